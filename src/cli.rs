//! CLI parsing and command execution
//!
//! This module handles command-line argument parsing and routes commands to the runner.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use adhoc_exec::emitter::ScriptArtifact;
use adhoc_exec::runner::{self, Invocation};
use adhoc_exec::{CommandResult, Config, Registry, TargetError, TargetOverrides};

#[derive(Debug, Parser)]
#[command(name = "adx")]
#[command(about = "Run one ad hoc command against a Linux, Windows, MySQL, Oracle or SQL Server target", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, env = "ADX_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Connection flags shared by `run` and `replay`
#[derive(Debug, Default, Args)]
pub struct TargetArgs {
    /// Target kind: linux, windows, mysql, oracle or sqlserver (any case)
    #[arg(short = 't', long)]
    pub kind: Option<String>,

    /// Host name or address
    #[arg(long)]
    pub host: Option<String>,

    /// Port (defaults to the protocol's standard port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// User name
    #[arg(short, long)]
    pub user: Option<String>,

    /// Password
    #[arg(long, env = "ADX_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Oracle SID or SQL Server database name
    #[arg(short, long)]
    pub database: Option<String>,
}

impl TargetArgs {
    fn into_overrides(self, registry: &Registry) -> Result<TargetOverrides, TargetError> {
        let kind = self
            .kind
            .as_deref()
            .map(|kind| registry.resolve(kind))
            .transpose()?;

        Ok(TargetOverrides {
            kind,
            host: self.host,
            port: self.port,
            user: self.user,
            password: self.password,
            database: self.database,
        })
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Initialize a sample configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "adx-config.toml")]
        output: PathBuf,
    },

    /// Run one command against a target
    Run {
        #[command(flatten)]
        target: TargetArgs,

        /// Named target from the config file; flags override its values
        #[arg(long)]
        profile: Option<String>,

        /// Shell command or SQL statement, sent verbatim
        #[arg(short = 'c', long)]
        command: String,

        /// Write a replay artifact with this name after a successful run
        #[arg(long, value_name = "NAME")]
        emit: Option<String>,

        /// Print the result (or error) as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-run a replay artifact, optionally overriding its parameters
    Replay {
        /// Artifact written by `run --emit`
        file: PathBuf,

        #[command(flatten)]
        target: TargetArgs,

        /// Run this command instead of the recorded one
        #[arg(short = 'c', long)]
        command: Option<String>,

        /// Print the result (or error) as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a replay artifact's target and command
    Show {
        /// Artifact to inspect
        file: PathBuf,
    },

    /// List supported target kinds
    Kinds,
}

/// Print a result for humans or as JSON. Errors are also returned so the process exits non-zero.
fn print_outcome(outcome: Result<CommandResult, TargetError>, json: bool) -> Result<()> {
    match outcome {
        Ok(result) => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result).context("Failed to encode result")?
                );
            } else {
                println!("{}", result);
            }
            Ok(())
        }
        Err(e) => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&e.report()).context("Failed to encode error")?
                );
            }
            Err(e.into())
        }
    }
}

async fn run(
    config: &Config,
    registry: &Registry,
    target: TargetArgs,
    profile: Option<&str>,
    command: &str,
    emit: Option<&str>,
) -> Result<Invocation, TargetError> {
    let base = match profile {
        Some(name) => Some(
            config
                .profile(name)
                .map_err(|e| TargetError::Validation(e.to_string()))?,
        ),
        None => None,
    };
    let descriptor = target.into_overrides(registry)?.apply(base)?;
    runner::run_and_emit(registry, config, descriptor, command, emit).await
}

/// Execute a CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    // Handle init command separately as it doesn't need a config
    if let Commands::Init { output } = cli.command {
        Config::create_sample(&output)
            .with_context(|| format!("Failed to create sample config at {:?}", output))?;
        info!("Sample configuration created at {:?}", output);
        return Ok(());
    }

    // Load configuration
    let config = if let Some(config_path) = cli.config {
        Config::from_file(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        Config::from_env().context("Failed to load config from environment")?
    };

    let registry = Registry::with_defaults();

    match cli.command {
        Commands::Init { .. } => unreachable!(), // Handled above

        Commands::Run {
            target,
            profile,
            command,
            emit,
            json,
        } => {
            let outcome = run(
                &config,
                &registry,
                target,
                profile.as_deref(),
                &command,
                emit.as_deref(),
            )
            .await;

            match outcome {
                Ok(invocation) => {
                    print_outcome(Ok(invocation.result), json)?;
                    if let Some(path) = invocation.artifact? {
                        eprintln!("Replay artifact written to {}", path.display());
                    }
                }
                Err(e) => print_outcome(Err(e), json)?,
            }
        }

        Commands::Replay {
            file,
            target,
            command,
            json,
        } => {
            let artifact = ScriptArtifact::load(&file)?;
            let outcome = match target.into_overrides(&registry) {
                Ok(overrides) => {
                    runner::replay(&registry, &config, &artifact, overrides, command).await
                }
                Err(e) => Err(e),
            };
            print_outcome(outcome, json)?;
        }

        Commands::Show { file } => {
            let artifact = ScriptArtifact::load(&file)?;
            println!("{}", artifact);
        }

        Commands::Kinds => {
            for name in registry.names() {
                let kind = registry.resolve(name)?;
                let note = if kind.requires_database() {
                    "query engine, database required"
                } else if kind.is_database() {
                    "query engine"
                } else {
                    "shell"
                };
                println!("{:<10} port {:<5} {}", name, kind.default_port(), note);
            }
        }
    }

    Ok(())
}
