use serde::Serialize;
use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;

use crate::targets::TargetKind;

/// Errors surfaced by the target core.
///
/// Every invocation ends in at most one of these. Driver errors are flattened
/// into messages at the variant boundary so callers only ever match on kind.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid target parameters: {0}")]
    Validation(String),

    #[error("unknown target kind '{given}' (supported: {supported})")]
    UnknownTargetKind { given: String, supported: String },

    #[error("failed to connect to {kind} target: {message}")]
    Connection { kind: TargetKind, message: String },

    #[error("{kind} command failed: {message}")]
    Execution { kind: TargetKind, message: String },

    #[error("{0} target is not connected")]
    NotConnected(TargetKind),

    #[error("failed to write replay artifact {path:?}: {message}")]
    Emission { path: PathBuf, message: String },
}

impl TargetError {
    pub fn connection(kind: TargetKind, message: impl Display) -> Self {
        Self::Connection {
            kind,
            message: message.to_string(),
        }
    }

    pub fn execution(kind: TargetKind, message: impl Display) -> Self {
        Self::Execution {
            kind,
            message: message.to_string(),
        }
    }

    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::UnknownTargetKind { .. } => "unknown_target_kind",
            Self::Connection { .. } => "connection",
            Self::Execution { .. } => "execution",
            Self::NotConnected(_) => "not_connected",
            Self::Emission { .. } => "emission",
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Structured error handed to front-ends
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
}
