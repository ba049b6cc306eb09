use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::Config;
use crate::emitter::{ScriptArtifact, ScriptEmitter};
use crate::error::TargetError;
use crate::result::CommandResult;
use crate::targets::{Registry, TargetDescriptor, TargetOverrides};

/// Outcome of `run_and_emit`
///
/// The command has already run when emission is attempted, so a failed
/// write is reported alongside the result instead of replacing it.
#[derive(Debug)]
pub struct Invocation {
    pub result: CommandResult,
    /// Replay artifact written after the command succeeded
    pub artifact: Result<Option<PathBuf>, TargetError>,
}

/// Await `future`, failing with `on_timeout` once `limit` has passed
async fn within<T, F>(
    limit: Option<Duration>,
    future: F,
    on_timeout: impl FnOnce(Duration) -> TargetError,
) -> Result<T, TargetError>
where
    F: Future<Output = Result<T, TargetError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| on_timeout(limit))?,
        None => future.await,
    }
}

/// Validate, dispatch, connect and execute one command
pub async fn run_command(
    registry: &Registry,
    config: &Config,
    descriptor: TargetDescriptor,
    command: &str,
) -> Result<CommandResult, TargetError> {
    let kind = descriptor.kind;
    let mut target = registry.build(descriptor, config)?;
    debug!("Using {} target for {}", target.target_type(), target.descriptor().address());

    within(
        config.execution.connect_timeout(),
        target.connect(),
        |limit| TargetError::connection(kind, format!("timed out after {}s", limit.as_secs())),
    )
    .await?;

    let result = within(
        config.execution.execute_timeout(),
        target.execute(command),
        |limit| TargetError::execution(kind, format!("timed out after {}s", limit.as_secs())),
    )
    .await?;

    info!("Command completed on {}", target.descriptor().address());
    Ok(result)
}

/// Run a command and, when it succeeds and a name is given, write a replay artifact
pub async fn run_and_emit(
    registry: &Registry,
    config: &Config,
    descriptor: TargetDescriptor,
    command: &str,
    emit_name: Option<&str>,
) -> Result<Invocation, TargetError> {
    let result = run_command(registry, config, descriptor.clone(), command).await?;

    let artifact = match emit_name {
        Some(name) => {
            let emitter = ScriptEmitter::from_config(&config.emit);
            emitter.emit(&descriptor, command, name).map(Some)
        }
        None => Ok(None),
    };

    Ok(Invocation { result, artifact })
}

/// Re-run a recorded invocation with optional overrides
pub async fn replay(
    registry: &Registry,
    config: &Config,
    artifact: &ScriptArtifact,
    overrides: TargetOverrides,
    command: Option<String>,
) -> Result<CommandResult, TargetError> {
    let (descriptor, command) = artifact.resolve(overrides, command)?;
    info!(
        "Replaying {} command against {} (recorded {})",
        descriptor.kind,
        descriptor.address(),
        artifact.generated_at.to_rfc3339()
    );
    run_command(registry, config, descriptor, &command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::{Target, TargetKind};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Built(TargetDescriptor),
        Connected,
        Executed(String),
    }

    #[derive(Debug, Clone, Copy, Default)]
    struct Behavior {
        fail_connect: bool,
        fail_execute: bool,
        connect_delay: Option<Duration>,
    }

    struct FakeTarget {
        descriptor: TargetDescriptor,
        events: Arc<Mutex<Vec<Event>>>,
        behavior: Behavior,
        connected: bool,
    }

    #[async_trait::async_trait]
    impl Target for FakeTarget {
        async fn connect(&mut self) -> Result<(), TargetError> {
            if let Some(delay) = self.behavior.connect_delay {
                tokio::time::sleep(delay).await;
            }
            if self.behavior.fail_connect {
                return Err(TargetError::connection(self.descriptor.kind, "refused"));
            }
            self.events.lock().unwrap().push(Event::Connected);
            self.connected = true;
            Ok(())
        }

        async fn execute(&mut self, command: &str) -> Result<CommandResult, TargetError> {
            if !self.connected {
                return Err(TargetError::NotConnected(self.descriptor.kind));
            }
            self.events
                .lock()
                .unwrap()
                .push(Event::Executed(command.to_string()));
            if self.behavior.fail_execute {
                return Err(TargetError::execution(self.descriptor.kind, "syntax error"));
            }
            Ok(CommandResult::text(format!("ran {}", command)))
        }

        fn descriptor(&self) -> &TargetDescriptor {
            &self.descriptor
        }

        fn target_type(&self) -> &'static str {
            "fake"
        }
    }

    fn recording_registry(events: Arc<Mutex<Vec<Event>>>, behavior: Behavior) -> Registry {
        let mut registry = Registry::new();
        for kind in TargetKind::ALL {
            let events = events.clone();
            registry.register(
                kind.as_str(),
                kind,
                Box::new(move |descriptor, _| {
                    events.lock().unwrap().push(Event::Built(descriptor.clone()));
                    Box::new(FakeTarget {
                        descriptor,
                        events: events.clone(),
                        behavior,
                        connected: false,
                    })
                }),
            );
        }
        registry
    }

    fn config_in(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.emit.output_dir = dir.path().to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_connect_then_execute() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(events.clone(), Behavior::default());
        let descriptor = TargetDescriptor::new(TargetKind::Linux, "web1", "ops", "pw");

        let result = run_command(&registry, &Config::default(), descriptor.clone(), "uptime")
            .await
            .unwrap();

        assert_eq!(result, CommandResult::text("ran uptime"));
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Built(descriptor),
                Event::Connected,
                Event::Executed("uptime".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_skips_execute() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let behavior = Behavior {
            fail_connect: true,
            ..Default::default()
        };
        let registry = recording_registry(events.clone(), behavior);
        let descriptor = TargetDescriptor::new(TargetKind::MySql, "db", "u", "p");

        let err = run_command(&registry, &Config::default(), descriptor, "SELECT 1")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "connection");
        assert!(!events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::Executed(_))));
    }

    #[tokio::test]
    async fn test_invalid_descriptor_never_dials() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(events.clone(), Behavior::default());
        let descriptor =
            TargetDescriptor::new(TargetKind::Oracle, "h", "u", "p").with_database("");

        let err = run_command(&registry, &Config::default(), descriptor, "SELECT 1 FROM dual")
            .await
            .unwrap_err();

        assert!(matches!(err, TargetError::Validation(_)));
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_within_maps_expiry() {
        let err = within(
            Some(Duration::from_millis(10)),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            |_| TargetError::execution(TargetKind::Windows, "timed out"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "execution");

        let value = within(None, async { Ok(7) }, |_| {
            TargetError::execution(TargetKind::Windows, "timed out")
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_connect_timeout_is_connection_error() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let behavior = Behavior {
            connect_delay: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let registry = recording_registry(events.clone(), behavior);
        let mut config = Config::default();
        config.execution.connect_timeout_seconds = Some(1);

        let descriptor = TargetDescriptor::new(TargetKind::Windows, "win1", "admin", "pw");
        let err = run_command(&registry, &config, descriptor, "ipconfig")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "connection");
        assert!(err.to_string().contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn test_emits_only_after_success() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(&temp_dir);
        let events = Arc::new(Mutex::new(Vec::new()));
        let behavior = Behavior {
            fail_execute: true,
            ..Default::default()
        };
        let registry = recording_registry(events, behavior);
        let descriptor = TargetDescriptor::new(TargetKind::MySql, "db", "u", "p");

        let err = run_and_emit(&registry, &config, descriptor, "SELEC 1", Some("broken"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "execution");
        assert!(!temp_dir.path().join("broken.toml").exists());
    }

    #[tokio::test]
    async fn test_result_survives_emission_failure() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.emit.output_dir = temp_dir.path().join("missing");
        let events = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(events.clone(), Behavior::default());
        let descriptor = TargetDescriptor::new(TargetKind::Linux, "web1", "ops", "pw");

        let invocation = run_and_emit(
            &registry,
            &config,
            descriptor,
            "rm -f /tmp/lock",
            Some("cleanup"),
        )
        .await
        .unwrap();

        assert_eq!(invocation.result, CommandResult::text("ran rm -f /tmp/lock"));
        let err = invocation.artifact.unwrap_err();
        assert_eq!(err.kind(), "emission");
        assert!(events
            .lock()
            .unwrap()
            .contains(&Event::Executed("rm -f /tmp/lock".to_string())));
    }

    #[tokio::test]
    async fn test_no_emit_name_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(&temp_dir);
        let registry = recording_registry(Arc::new(Mutex::new(Vec::new())), Behavior::default());
        let descriptor = TargetDescriptor::new(TargetKind::Linux, "web1", "ops", "pw");

        let invocation = run_and_emit(&registry, &config, descriptor, "uptime", None)
            .await
            .unwrap();

        assert!(matches!(invocation.artifact, Ok(None)));
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_replay_reproduces_invocation() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_in(&temp_dir);
        let descriptor = TargetDescriptor::new(TargetKind::SqlServer, "erp", "sa", "s3cret")
            .with_port(14330)
            .with_database("ledger");
        let command = "SELECT TOP 5 * FROM invoices";

        let first_events = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(first_events.clone(), Behavior::default());
        let invocation =
            run_and_emit(&registry, &config, descriptor.clone(), command, Some("invoices"))
                .await
                .unwrap();
        let path = invocation.artifact.unwrap().unwrap();
        assert_eq!(path, temp_dir.path().join("invoices.toml"));

        let artifact = ScriptArtifact::load(&path).unwrap();
        let replay_events = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(replay_events.clone(), Behavior::default());
        let result = replay(&registry, &config, &artifact, TargetOverrides::default(), None)
            .await
            .unwrap();

        assert_eq!(result, invocation.result);
        assert_eq!(*replay_events.lock().unwrap(), *first_events.lock().unwrap());
        assert_eq!(
            replay_events.lock().unwrap()[0],
            Event::Built(descriptor)
        );
    }

    #[tokio::test]
    async fn test_replay_with_overrides() {
        let artifact = ScriptArtifact::new(
            crate::targets::TargetParams::from_descriptor(&TargetDescriptor::new(
                TargetKind::Linux,
                "web1",
                "ops",
                "pw",
            )),
            "uptime",
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let registry = recording_registry(events.clone(), Behavior::default());
        let overrides = TargetOverrides {
            host: Some("web2".to_string()),
            ..Default::default()
        };

        replay(&registry, &Config::default(), &artifact, overrides, Some("w".to_string()))
            .await
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(
            events[0],
            Event::Built(TargetDescriptor::new(TargetKind::Linux, "web2", "ops", "pw"))
        );
        assert_eq!(events[2], Event::Executed("w".to_string()));
    }
}
