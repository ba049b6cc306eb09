//! Remote target implementations
//!
//! A target is one remote system a single ad hoc command is sent to:
//! - Shell hosts (Linux over SSH, Windows over WinRM) returning text
//! - Database engines (MySQL, Oracle, SQL Server) returning result sets
//!
//! Commands are forwarded verbatim. This crate is an operator tool and treats
//! the operator's input as trusted; nothing here escapes or sanitizes it.

mod descriptor;
mod mysql;
mod oracle;
mod registry;
mod sqlserver;
mod ssh;
mod target;
mod winrm;

pub use descriptor::{TargetDescriptor, TargetOverrides, TargetParams};
pub use mysql::MySqlTarget;
pub use oracle::OracleTarget;
pub use registry::{Constructor, Registry};
pub use sqlserver::SqlServerTarget;
pub use ssh::SshTarget;
pub use target::Target;
pub use winrm::WinRmTarget;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TargetError;

/// Target type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum TargetKind {
    Linux,
    Windows,
    MySql,
    Oracle,
    SqlServer,
}

impl TargetKind {
    pub const ALL: [TargetKind; 5] = [
        TargetKind::Linux,
        TargetKind::Windows,
        TargetKind::MySql,
        TargetKind::Oracle,
        TargetKind::SqlServer,
    ];

    /// Discriminator string used on every front-end
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Linux => "linux",
            TargetKind::Windows => "windows",
            TargetKind::MySql => "mysql",
            TargetKind::Oracle => "oracle",
            TargetKind::SqlServer => "sqlserver",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TargetKind::Linux => 22,
            TargetKind::Windows => 5985,
            TargetKind::MySql => 3306,
            TargetKind::Oracle => 1521,
            TargetKind::SqlServer => 1433,
        }
    }

    /// Oracle and SQL Server need a SID / database name to connect
    pub fn requires_database(&self) -> bool {
        matches!(self, TargetKind::Oracle | TargetKind::SqlServer)
    }

    pub fn is_database(&self) -> bool {
        matches!(
            self,
            TargetKind::MySql | TargetKind::Oracle | TargetKind::SqlServer
        )
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsing is ASCII case-insensitive and ignores surrounding whitespace.
impl std::str::FromStr for TargetKind {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        TargetKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| TargetError::UnknownTargetKind {
                given: s.to_string(),
                supported: TargetKind::ALL
                    .iter()
                    .map(TargetKind::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

impl TryFrom<String> for TargetKind {
    type Error = TargetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Type alias for target trait object
pub type TargetInstance = Box<dyn Target>;

/// `0x`-prefixed lowercase hex, used for binary cells
pub(crate) fn hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
