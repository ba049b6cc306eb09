use tracing::debug;

use crate::config::Config;
use crate::error::TargetError;
use crate::targets::{
    MySqlTarget, OracleTarget, SqlServerTarget, SshTarget, TargetDescriptor, TargetInstance,
    TargetKind, WinRmTarget,
};

/// Builds an unconnected target from a validated descriptor
pub type Constructor = Box<dyn Fn(TargetDescriptor, &Config) -> TargetInstance + Send + Sync>;

struct Entry {
    name: &'static str,
    kind: TargetKind,
    construct: Constructor,
}

/// Explicit mapping from discriminator string to target constructor
pub struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registry with the five built-in targets
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "linux",
            TargetKind::Linux,
            Box::new(|descriptor, config| Box::new(SshTarget::new(descriptor, &config.ssh))),
        );
        registry.register(
            "windows",
            TargetKind::Windows,
            Box::new(|descriptor, config| Box::new(WinRmTarget::new(descriptor, &config.winrm))),
        );
        registry.register(
            "mysql",
            TargetKind::MySql,
            Box::new(|descriptor, _| Box::new(MySqlTarget::new(descriptor))),
        );
        registry.register(
            "oracle",
            TargetKind::Oracle,
            Box::new(|descriptor, _| Box::new(OracleTarget::new(descriptor))),
        );
        registry.register(
            "sqlserver",
            TargetKind::SqlServer,
            Box::new(|descriptor, _| Box::new(SqlServerTarget::new(descriptor))),
        );
        registry
    }

    /// Bind a discriminator and constructor to one of the built-in kinds.
    ///
    /// Any entry with the same name or the same kind is replaced, so a kind
    /// always has exactly one discriminator. New kinds need a `TargetKind` variant.
    pub fn register(&mut self, name: &'static str, kind: TargetKind, construct: Constructor) {
        self.entries
            .retain(|entry| !entry.name.eq_ignore_ascii_case(name) && entry.kind != kind);
        self.entries.push(Entry {
            name,
            kind,
            construct,
        });
    }

    /// Registered discriminators, in registration order
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.name).collect()
    }

    /// Resolve a discriminator (ASCII case-insensitive, trimmed) to a target kind
    pub fn resolve(&self, discriminator: &str) -> Result<TargetKind, TargetError> {
        let wanted = discriminator.trim();
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(wanted))
            .map(|entry| entry.kind)
            .ok_or_else(|| TargetError::UnknownTargetKind {
                given: discriminator.to_string(),
                supported: self.names().join(", "),
            })
    }

    /// Validate the descriptor and construct its target. Never connects.
    pub fn build(
        &self,
        descriptor: TargetDescriptor,
        config: &Config,
    ) -> Result<TargetInstance, TargetError> {
        descriptor.validate()?;

        let entry = self
            .entries
            .iter()
            .find(|entry| entry.kind == descriptor.kind)
            .ok_or_else(|| TargetError::UnknownTargetKind {
                given: descriptor.kind.to_string(),
                supported: self.names().join(", "),
            })?;

        debug!(
            "Constructing {} target for {}",
            entry.name,
            descriptor.address()
        );
        Ok((entry.construct)(descriptor, config))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
