//! Ad hoc remote execution library
//!
//! Sends one shell command or SQL statement to a remote target and returns
//! the result: Linux hosts over SSH, Windows hosts over WinRM, and MySQL,
//! Oracle or SQL Server databases. Every invocation follows the same steps:
//! build a [`TargetDescriptor`], let the [`Registry`] construct the target,
//! `connect`, then `execute`. A successful invocation can be written out as a
//! replay artifact with [`emitter::ScriptEmitter`].
//!
//! # Security notes
//!
//! - Commands are sent verbatim. The operator is trusted; nothing is escaped.
//! - SSH host keys are trusted on first use and recorded in `known_hosts`.
//!   A changed key is rejected, but the first contact is never verified.
//! - WinRM uses basic authentication over plain HTTP.
//! - SQL Server certificates are not verified.
//! - Replay artifacts embed the password in cleartext unless
//!   `[emit] password_env` is configured.

pub mod config;
pub mod emitter;
pub mod error;
pub mod result;
pub mod runner;
pub mod targets;

pub use config::Config;
pub use error::{ErrorReport, TargetError};
pub use result::CommandResult;
pub use targets::{
    Registry, Target, TargetDescriptor, TargetInstance, TargetKind, TargetOverrides, TargetParams,
};
