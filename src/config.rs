use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::targets::{TargetKind, TargetParams};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub winrm: WinRmConfig,
    #[serde(default)]
    pub emit: EmitConfig,
    /// Named targets usable with `--profile`
    #[serde(default)]
    pub profiles: BTreeMap<String, TargetParams>,
}

/// Limits applied around `connect` and `execute`. Unset means wait forever.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_timeout_seconds: Option<u64>,
}

impl ExecutionConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_seconds.map(Duration::from_secs)
    }

    pub fn execute_timeout(&self) -> Option<Duration> {
        self.execute_timeout_seconds.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshConfig {
    /// known_hosts file used for trust-on-first-use (defaults to ~/.ssh/known_hosts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts: Option<PathBuf>,
}

impl SshConfig {
    pub fn known_hosts_path(&self) -> PathBuf {
        if let Some(ref path) = self.known_hosts {
            return path.clone();
        }
        dirs::home_dir()
            .map(|home| home.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("known_hosts"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinRmConfig {
    #[serde(default = "default_service_path")]
    pub service_path: String,
    /// Console code page requested for the remote shell
    #[serde(default = "default_codepage")]
    pub codepage: u32,
    /// Label of the single-byte encoding used to decode command output
    #[serde(default = "default_output_encoding")]
    pub output_encoding: String,
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_seconds: u64,
}

fn default_service_path() -> String {
    "wsman".to_string()
}

fn default_codepage() -> u32 {
    437
}

fn default_output_encoding() -> String {
    "windows-1252".to_string()
}

fn default_operation_timeout() -> u64 {
    20
}

impl Default for WinRmConfig {
    fn default() -> Self {
        Self {
            service_path: default_service_path(),
            codepage: default_codepage(),
            output_encoding: default_output_encoding(),
            operation_timeout_seconds: default_operation_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitConfig {
    /// Directory replay artifacts are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// When set, artifacts reference this environment variable instead of
    /// embedding the password in cleartext
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for EmitConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            password_env: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Self = toml::from_str(&contents).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("ADX_KNOWN_HOSTS") {
            config.ssh.known_hosts = Some(PathBuf::from(path));
        }
        config.execution.connect_timeout_seconds = std::env::var("ADX_CONNECT_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok());
        config.execution.execute_timeout_seconds = std::env::var("ADX_EXECUTE_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok());
        if let Ok(dir) = std::env::var("ADX_OUTPUT_DIR") {
            config.emit.output_dir = PathBuf::from(dir);
        }
        if let Ok(label) = std::env::var("ADX_WINRM_ENCODING") {
            config.winrm.output_encoding = label;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if encoding_rs::Encoding::for_label(self.winrm.output_encoding.as_bytes()).is_none() {
            anyhow::bail!(
                "Unknown WinRM output encoding '{}'",
                self.winrm.output_encoding
            );
        }
        for (name, profile) in &self.profiles {
            if profile.kind.requires_database()
                && profile.database.as_deref().map_or(true, str::is_empty)
            {
                anyhow::bail!("Profile '{}' ({}) requires a database", name, profile.kind);
            }
        }
        Ok(())
    }

    /// Look up a named target profile
    pub fn profile(&self, name: &str) -> Result<&TargetParams> {
        self.profiles.get(name).with_context(|| {
            format!(
                "Profile '{}' not found. Configure [profiles.{}] in the config file",
                name, name
            )
        })
    }

    /// Create a sample configuration file
    pub fn create_sample<P: AsRef<Path>>(path: P) -> Result<()> {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "app-server".to_string(),
            TargetParams {
                kind: TargetKind::Linux,
                host: "192.0.2.10".to_string(),
                port: Some(22),
                user: "operator".to_string(),
                password: None,
                password_env: Some("ADX_APP_SERVER_PASSWORD".to_string()),
                database: None,
            },
        );
        profiles.insert(
            "billing-db".to_string(),
            TargetParams {
                kind: TargetKind::Oracle,
                host: "192.0.2.20".to_string(),
                port: Some(1521),
                user: "report".to_string(),
                password: None,
                password_env: Some("ADX_BILLING_DB_PASSWORD".to_string()),
                database: Some("orcl".to_string()),
            },
        );

        let sample = Self {
            execution: ExecutionConfig {
                connect_timeout_seconds: Some(15),
                execute_timeout_seconds: None,
            },
            ssh: SshConfig::default(),
            winrm: WinRmConfig::default(),
            emit: EmitConfig::default(),
            profiles,
        };

        let toml_string =
            toml::to_string_pretty(&sample).context("Failed to serialize sample config")?;
        fs::write(path.as_ref(), toml_string)
            .with_context(|| format!("Failed to write sample config to {:?}", path.as_ref()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sample_round_trip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("adx.toml");
        Config::create_sample(&path)?;

        let config = Config::from_file(&path)?;
        assert_eq!(config.execution.connect_timeout(), Some(Duration::from_secs(15)));
        assert_eq!(config.execution.execute_timeout(), None);
        assert_eq!(config.winrm.service_path, "wsman");
        assert_eq!(config.profile("billing-db")?.kind, TargetKind::Oracle);
        assert!(config.profile("missing").is_err());
        Ok(())
    }

    #[test]
    fn test_empty_file_uses_defaults() -> Result<()> {
        let config: Config = toml::from_str("")?;
        assert_eq!(config.winrm.codepage, 437);
        assert_eq!(config.winrm.output_encoding, "windows-1252");
        assert_eq!(config.emit.output_dir, PathBuf::from("."));
        assert!(config.emit.password_env.is_none());
        assert!(config.profiles.is_empty());
        Ok(())
    }

    #[test]
    fn test_rejects_unknown_encoding() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("adx.toml");
        fs::write(&path, "[winrm]\noutput_encoding = \"klingon\"\n").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_rejects_profile_without_database() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("adx.toml");
        fs::write(
            &path,
            "[profiles.erp]\nkind = \"sqlserver\"\nhost = \"h\"\nuser = \"sa\"\npassword = \"p\"\n",
        )
        .unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("erp"));
    }

    #[test]
    fn test_known_hosts_override() {
        let ssh = SshConfig {
            known_hosts: Some(PathBuf::from("/tmp/kh")),
        };
        assert_eq!(ssh.known_hosts_path(), PathBuf::from("/tmp/kh"));
    }
}
