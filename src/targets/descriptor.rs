use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TargetError;
use crate::targets::TargetKind;

/// Connection parameters for one target. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub kind: TargetKind,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
}

impl TargetDescriptor {
    /// Create a descriptor using the protocol's default port
    pub fn new(
        kind: TargetKind,
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            host: host.into(),
            port: kind.default_port(),
            user: user.into(),
            password: password.into(),
            database: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Check the parameters before anything is constructed or dialed
    pub fn validate(&self) -> Result<(), TargetError> {
        if self.host.trim().is_empty() {
            return Err(TargetError::Validation(format!(
                "{} target requires a host",
                self.kind
            )));
        }
        if self.user.trim().is_empty() {
            return Err(TargetError::Validation(format!(
                "{} target requires a user",
                self.kind
            )));
        }
        if self.kind.requires_database()
            && self.database.as_deref().map_or(true, |db| db.trim().is_empty())
        {
            return Err(TargetError::Validation(format!(
                "{} target requires a non-empty database",
                self.kind
            )));
        }
        Ok(())
    }

    /// `host:port` for log lines
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetDescriptor")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .finish()
    }
}

/// Stored target parameters, as found in config profiles and replay artifacts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetParams {
    pub kind: TargetKind,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Name of an environment variable holding the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl TargetParams {
    pub fn from_descriptor(descriptor: &TargetDescriptor) -> Self {
        Self {
            kind: descriptor.kind,
            host: descriptor.host.clone(),
            port: Some(descriptor.port),
            user: descriptor.user.clone(),
            password: Some(descriptor.password.clone()),
            password_env: None,
            database: descriptor.database.clone(),
        }
    }

    fn resolve_password(&self) -> Option<String> {
        if let Some(ref password) = self.password {
            return Some(password.clone());
        }
        self.password_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
    }
}

/// Per-invocation parameter overrides (CLI flags, replay arguments)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetOverrides {
    pub kind: Option<TargetKind>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl TargetOverrides {
    /// Build a descriptor from these overrides on top of optional stored parameters.
    ///
    /// Overrides win over `base`; the port falls back to the protocol default.
    pub fn apply(self, base: Option<&TargetParams>) -> Result<TargetDescriptor, TargetError> {
        let kind = self
            .kind
            .or(base.map(|b| b.kind))
            .ok_or_else(|| TargetError::Validation("target kind is required".to_string()))?;

        let host = self
            .host
            .or_else(|| base.map(|b| b.host.clone()))
            .ok_or_else(|| TargetError::Validation("host is required".to_string()))?;

        let user = self
            .user
            .or_else(|| base.map(|b| b.user.clone()))
            .ok_or_else(|| TargetError::Validation("user is required".to_string()))?;

        let password = self
            .password
            .or_else(|| base.and_then(TargetParams::resolve_password))
            .ok_or_else(|| TargetError::Validation("password is required".to_string()))?;

        // A stored port only applies while the kind is unchanged
        let base_port = base.filter(|b| b.kind == kind).and_then(|b| b.port);
        let port = self.port.or(base_port).unwrap_or(kind.default_port());

        let database = self.database.or_else(|| base.and_then(|b| b.database.clone()));

        Ok(TargetDescriptor {
            kind,
            host,
            port,
            user,
            password,
            database,
        })
    }
}
