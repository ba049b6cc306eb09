//! Replay artifacts
//!
//! A successful invocation can be frozen into a TOML file holding the target
//! parameters and the command. The file starts with a `#!` line so it can be
//! run directly; `adx replay` reads it back, applies any overrides and runs
//! the same command again.
//!
//! By default the password is embedded in cleartext. Set `[emit] password_env`
//! to store the name of an environment variable instead.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::EmitConfig;
use crate::error::TargetError;
use crate::targets::{TargetDescriptor, TargetOverrides, TargetParams};

/// Artifact layout version written by this build
pub const FORMAT_VERSION: u32 = 1;

const SHEBANG: &str = "#!/usr/bin/env -S adx replay";

/// One recorded invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptArtifact {
    pub format_version: u32,
    pub generated_at: DateTime<Utc>,
    pub command: String,
    pub target: TargetParams,
}

impl ScriptArtifact {
    pub fn new(target: TargetParams, command: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            generated_at: Utc::now(),
            command: command.into(),
            target,
        }
    }

    /// Read an artifact from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay artifact: {:?}", path))?;

        let artifact: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse replay artifact: {:?}", path))?;

        if artifact.format_version > FORMAT_VERSION {
            anyhow::bail!(
                "Replay artifact {:?} has format version {}, this build reads up to {}",
                path,
                artifact.format_version,
                FORMAT_VERSION
            );
        }
        Ok(artifact)
    }

    /// Descriptor and command for a replay.
    ///
    /// Overrides win over the recorded values. The password comes from the
    /// override, then the embedded value, then `password_env`.
    pub fn resolve(
        &self,
        overrides: TargetOverrides,
        command: Option<String>,
    ) -> Result<(TargetDescriptor, String), TargetError> {
        let descriptor = overrides.apply(Some(&self.target))?;
        let command = command.unwrap_or_else(|| self.command.clone());
        Ok((descriptor, command))
    }

    /// Render the artifact as an executable TOML document
    pub fn to_toml(&self) -> Result<String> {
        let body = toml::to_string_pretty(self).context("Failed to serialize replay artifact")?;
        Ok(format!("{}\n{}", SHEBANG, body))
    }
}

/// Human summary used by `adx show`; never prints the password
impl fmt::Display for ScriptArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = &self.target;
        writeln!(f, "kind:      {}", target.kind)?;
        match target.port {
            Some(port) => writeln!(f, "host:      {}:{}", target.host, port)?,
            None => writeln!(f, "host:      {} (default port {})", target.host, target.kind.default_port())?,
        }
        writeln!(f, "user:      {}", target.user)?;
        if let Some(ref database) = target.database {
            writeln!(f, "database:  {}", database)?;
        }
        let password = match (&target.password, &target.password_env) {
            (Some(_), _) => "embedded".to_string(),
            (None, Some(var)) => format!("from ${}", var),
            (None, None) => "not stored".to_string(),
        };
        writeln!(f, "password:  {}", password)?;
        writeln!(f, "generated: {}", self.generated_at.to_rfc3339())?;
        write!(f, "command:   {}", self.command)
    }
}

/// Writes replay artifacts into one output directory
#[derive(Debug, Clone)]
pub struct ScriptEmitter {
    output_dir: PathBuf,
    password_env: Option<String>,
}

impl ScriptEmitter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            password_env: None,
        }
    }

    /// Store `password_env = <var>` instead of the password
    pub fn with_password_env(mut self, var: impl Into<String>) -> Self {
        self.password_env = Some(var.into());
        self
    }

    pub fn from_config(config: &EmitConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            password_env: config.password_env.clone(),
        }
    }

    /// `<output_dir>/<name>.toml`, keeping an existing `.toml` extension
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        if name.ends_with(".toml") {
            self.output_dir.join(name)
        } else {
            self.output_dir.join(format!("{}.toml", name))
        }
    }

    fn artifact(&self, descriptor: &TargetDescriptor, command: &str) -> ScriptArtifact {
        let mut params = TargetParams::from_descriptor(descriptor);
        if let Some(ref var) = self.password_env {
            params.password = None;
            params.password_env = Some(var.clone());
        }
        ScriptArtifact::new(params, command)
    }

    /// Write the artifact for one invocation, overwriting any file of the same name
    pub fn emit(
        &self,
        descriptor: &TargetDescriptor,
        command: &str,
        name: &str,
    ) -> Result<PathBuf, TargetError> {
        let path = self.artifact_path(name.trim());
        let emission = |message: String| TargetError::Emission {
            path: path.clone(),
            message,
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(emission("artifact name is empty".to_string()));
        }
        if !is_plain_file_name(name) {
            return Err(emission(format!(
                "artifact name '{}' must be a file name, not a path",
                name
            )));
        }

        let artifact = self.artifact(descriptor, command);
        if artifact.target.password.is_some() {
            warn!("Replay artifact {:?} embeds the password in cleartext", path);
        }

        let rendered = artifact.to_toml().map_err(|e| emission(format!("{:#}", e)))?;
        debug!("Writing replay artifact for {} to {:?}", descriptor.address(), path);
        fs::write(&path, rendered).map_err(|e| emission(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .map_err(|e| emission(e.to_string()))?;
        }

        info!("Replay artifact written to {:?}", path);
        Ok(path)
    }
}

/// Artifacts always land directly in the output directory
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    !name.contains(['/', '\\'])
        && matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
}
