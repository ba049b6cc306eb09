use crate::error::TargetError;
use crate::result::CommandResult;
use crate::targets::{TargetDescriptor, TargetKind};

/// Trait for remote targets (shell hosts and database engines)
///
/// A target owns at most one live session. `connect` opens it and `execute`
/// sends exactly the command it is given over that session.
#[async_trait::async_trait]
pub trait Target: Send {
    /// Open the session described by the target's descriptor
    async fn connect(&mut self) -> Result<(), TargetError>;

    /// Run a single command. Fails with `NotConnected` if `connect` has not succeeded.
    async fn execute(&mut self, command: &str) -> Result<CommandResult, TargetError>;

    /// Connection parameters this target was built from
    fn descriptor(&self) -> &TargetDescriptor;

    /// Get the target kind for display purposes
    fn kind(&self) -> TargetKind {
        self.descriptor().kind
    }

    /// Name of the transport or driver backing this target
    fn target_type(&self) -> &'static str;
}
