use anyhow::Context;
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::ChannelMsg;
use russh_keys::key::PublicKey;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::SshConfig;
use crate::error::TargetError;
use crate::result::CommandResult;
use crate::targets::target::Target;
use crate::targets::{TargetDescriptor, TargetKind};

/// Check a server key against a known_hosts file, trusting unknown hosts on first use.
///
/// Unknown keys are appended to the file and accepted. This is weaker than
/// strict checking: the first connection to a host is never verified. A key
/// that differs from the recorded one is rejected.
fn verify_host_key(host: &str, port: u16, key: &PublicKey, known_hosts: &Path) -> anyhow::Result<bool> {
    match russh_keys::check_known_hosts_path(host, port, key, known_hosts) {
        Ok(true) => {
            debug!("Host key for {}:{} matches {:?}", host, port, known_hosts);
            Ok(true)
        }
        Ok(false) => {
            warn!(
                "Unknown host key for {}:{} ({}), trusting on first use and recording it in {:?}",
                host,
                port,
                key.fingerprint(),
                known_hosts
            );
            if let Some(parent) = known_hosts.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            russh_keys::learn_known_hosts_path(host, port, key, known_hosts)
                .context("Failed to record host key")?;
            Ok(true)
        }
        Err(russh_keys::Error::KeyChanged { line }) => {
            error!(
                "Host key for {}:{} changed (known_hosts line {})",
                host, port, line
            );
            anyhow::bail!(
                "host key for {}:{} does not match {:?} line {}; refusing to connect",
                host,
                port,
                known_hosts,
                line
            )
        }
        Err(e) => Err(e).context("Failed to read known_hosts"),
    }
}

struct HostKeyVerifier {
    host: String,
    port: u16,
    known_hosts: PathBuf,
}

#[async_trait]
impl client::Handler for HostKeyVerifier {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        verify_host_key(&self.host, self.port, server_public_key, &self.known_hosts)
    }
}

/// Separately collected streams of one exec channel
#[derive(Debug, Default)]
struct ExecOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_status: Option<u32>,
}

impl ExecOutput {
    fn absorb(&mut self, msg: ChannelMsg) {
        match msg {
            ChannelMsg::Data { ref data } => self.stdout.extend_from_slice(data),
            // ext 1 is SSH_EXTENDED_DATA_STDERR
            ChannelMsg::ExtendedData { ref data, ext: 1 } => self.stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => self.exit_status = Some(exit_status),
            _ => {}
        }
    }

    /// Only stdout becomes the result body
    fn into_result(self, address: &str) -> CommandResult {
        if !self.stderr.is_empty() {
            warn!(
                "stderr from {}: {}",
                address,
                String::from_utf8_lossy(&self.stderr).trim_end()
            );
        }
        match self.exit_status {
            Some(0) | None => {}
            Some(status) => warn!("Command on {} exited with status {}", address, status),
        }
        CommandResult::text(String::from_utf8_lossy(&self.stdout))
    }
}

/// Linux host reached over SSH with password authentication
pub struct SshTarget {
    descriptor: TargetDescriptor,
    known_hosts: PathBuf,
    session: Option<Handle<HostKeyVerifier>>,
}

impl SshTarget {
    pub fn new(descriptor: TargetDescriptor, config: &SshConfig) -> Self {
        Self {
            descriptor,
            known_hosts: config.known_hosts_path(),
            session: None,
        }
    }
}

#[async_trait]
impl Target for SshTarget {
    async fn connect(&mut self) -> Result<(), TargetError> {
        let kind = TargetKind::Linux;
        info!(
            "Connecting to {} over SSH as {}",
            self.descriptor.address(),
            self.descriptor.user
        );

        let config = Arc::new(client::Config::default());
        let handler = HostKeyVerifier {
            host: self.descriptor.host.clone(),
            port: self.descriptor.port,
            known_hosts: self.known_hosts.clone(),
        };

        let mut session = client::connect(
            config,
            (self.descriptor.host.as_str(), self.descriptor.port),
            handler,
        )
        .await
        .map_err(|e| TargetError::connection(kind, format!("{:#}", e)))?;

        let authenticated = session
            .authenticate_password(self.descriptor.user.clone(), self.descriptor.password.clone())
            .await
            .map_err(|e| TargetError::connection(kind, e))?;

        if !authenticated {
            return Err(TargetError::connection(
                kind,
                format!("password authentication rejected for user {}", self.descriptor.user),
            ));
        }

        info!("Successfully connected to {}", self.descriptor.address());
        self.session = Some(session);
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandResult, TargetError> {
        let kind = TargetKind::Linux;
        let session = self
            .session
            .as_ref()
            .ok_or(TargetError::NotConnected(kind))?;

        debug!("Executing on {}: {}", self.descriptor.address(), command);

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| TargetError::execution(kind, e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| TargetError::execution(kind, e))?;

        let mut output = ExecOutput::default();
        while let Some(msg) = channel.wait().await {
            output.absorb(msg);
        }

        Ok(output.into_result(&self.descriptor.address()))
    }

    fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    fn target_type(&self) -> &'static str {
        "ssh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::CryptoVec;
    use tempfile::TempDir;

    const KEY_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIL6g3uwfIZL4DfhTVuyGerNhopImzAAc9QNFtoAeZHhb";
    const KEY_B: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIKdYwcNZP2LuJ8or+uaawWEKqufTD5JcLmNyTfCC5cnm";

    fn key(encoded: &str) -> PublicKey {
        russh_keys::parse_public_key_base64(encoded).unwrap()
    }

    #[test]
    fn test_stderr_is_not_part_of_body() {
        let mut output = ExecOutput::default();
        output.absorb(ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"ls: cannot access '/nope'\n"),
            ext: 1,
        });
        output.absorb(ChannelMsg::ExitStatus { exit_status: 2 });

        assert_eq!(output.stderr, b"ls: cannot access '/nope'\n");
        assert_eq!(output.into_result("h:22"), CommandResult::text(""));
    }

    #[test]
    fn test_stdout_collected_across_messages() {
        let mut output = ExecOutput::default();
        output.absorb(ChannelMsg::Data {
            data: CryptoVec::from_slice(b"eth0: "),
        });
        output.absorb(ChannelMsg::ExtendedData {
            data: CryptoVec::from_slice(b"warning\n"),
            ext: 1,
        });
        output.absorb(ChannelMsg::Data {
            data: CryptoVec::from_slice(b"flags=4163\n"),
        });
        output.absorb(ChannelMsg::ExitStatus { exit_status: 0 });

        assert_eq!(output.exit_status, Some(0));
        assert_eq!(output.into_result("h:22"), CommandResult::text("eth0: flags=4163\n"));
    }

    #[test]
    fn test_unknown_host_is_learned() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let known_hosts = temp_dir.path().join("ssh").join("known_hosts");

        assert!(verify_host_key("10.1.1.1", 22, &key(KEY_A), &known_hosts)?);
        let content = fs::read_to_string(&known_hosts)?;
        assert!(content.contains(KEY_A));

        // Second contact matches the recorded key
        assert!(verify_host_key("10.1.1.1", 22, &key(KEY_A), &known_hosts)?);
        Ok(())
    }

    #[test]
    fn test_changed_host_key_is_rejected() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let known_hosts = temp_dir.path().join("known_hosts");

        verify_host_key("10.1.1.1", 2222, &key(KEY_A), &known_hosts)?;
        let err = verify_host_key("10.1.1.1", 2222, &key(KEY_B), &known_hosts).unwrap_err();
        assert!(err.to_string().contains("does not match"));
        Ok(())
    }

    #[tokio::test]
    async fn test_execute_before_connect() {
        let descriptor = TargetDescriptor::new(TargetKind::Linux, "h", "u", "p");
        let mut target = SshTarget::new(descriptor, &SshConfig::default());
        let err = target.execute("uptime").await.unwrap_err();
        assert!(matches!(err, TargetError::NotConnected(TargetKind::Linux)));
    }
}
