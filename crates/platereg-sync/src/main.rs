//! Platereg Sync - vehicle registry import job

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use platereg_common::logging::{init_logging, LogConfig, LogLevel};
use platereg_sync::scheduler::{run_every, shutdown_signal};
use platereg_sync::{
    ChangeCheckMode, FileSyncStateStore, MemoryRegistryStore, PgRegistryStore, PgSyncStateStore,
    RegistryStore, RunOptions, StateBackend, SyncConfig, SyncOrchestrator, SyncOutcome,
    SyncStateStore,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "platereg-sync")]
#[command(author, version, about = "Import the national vehicle registry into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Source archive URL
    #[arg(long, global = true, env = "REGSYNC_SOURCE_URL")]
    source_url: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sync and print its summary as JSON
    Run {
        /// Import even if the source is unchanged
        #[arg(long)]
        force: bool,

        /// Write to an in-memory store; leave the database and sync state alone
        #[arg(long)]
        dry_run: bool,
    },

    /// Report whether the source changed since the last sync
    Check,

    /// Sync on a fixed interval until interrupted
    Daemon {
        /// Seconds between runs
        #[arg(long, env = "REGSYNC_INTERVAL_SECS", default_value_t = 86_400)]
        interval_secs: u64,

        /// Force the first run
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("platereg-sync")
        .build()
        .merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    let mut config = SyncConfig::from_env().context("Failed to load configuration")?;
    if let Some(url) = cli.source_url {
        config = config.with_source_url(url);
    }
    config.validate()?;

    match cli.command {
        Command::Run { force, dry_run } => {
            let registry = if dry_run {
                RegistryTarget::Memory
            } else {
                RegistryTarget::Database
            };
            let orchestrator = build_orchestrator(config, registry, dry_run).await?;
            let outcome = orchestrator.run(RunOptions { force }).await;
            report(outcome)
        },
        Command::Check => {
            // Only the sync state is read; the registry is never touched.
            let orchestrator = build_orchestrator(config, RegistryTarget::Memory, false).await?;
            let report = orchestrator.check().await?;
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        },
        Command::Daemon {
            interval_secs,
            force,
        } => {
            if interval_secs == 0 {
                anyhow::bail!("--interval-secs must be greater than 0");
            }
            if config.change_check == ChangeCheckMode::AlwaysResync {
                info!("Change check disabled, every tick re-imports the registry");
            }
            let orchestrator =
                build_orchestrator(config, RegistryTarget::Database, false).await?;
            run_every(
                &orchestrator,
                Duration::from_secs(interval_secs),
                RunOptions { force },
                shutdown_signal(),
            )
            .await;
            Ok(())
        },
    }
}

/// Where the registry writes of a command go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistryTarget {
    Database,
    Memory,
}

fn needs_database(registry: RegistryTarget, state: &StateBackend) -> bool {
    registry == RegistryTarget::Database || matches!(state, StateBackend::Database { .. })
}

async fn build_orchestrator(
    config: SyncConfig,
    registry: RegistryTarget,
    dry_run: bool,
) -> Result<SyncOrchestrator> {
    let pool = if needs_database(registry, &config.state) {
        info!("Connecting to database");
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
            .connect(&config.database.url)
            .await
            .context("Failed to connect to database")?;
        Some(pool)
    } else {
        None
    };

    let store: Arc<dyn RegistryStore> = match (&pool, registry) {
        (Some(pool), RegistryTarget::Database) => Arc::new(PgRegistryStore::new(
            pool.clone(),
            config.registry_table.clone(),
            config.history_table.clone(),
        )),
        _ => Arc::new(MemoryRegistryStore::new()),
    };

    let state: Arc<dyn SyncStateStore> = match (&config.state, &pool) {
        (StateBackend::Database { table }, Some(pool)) => {
            Arc::new(PgSyncStateStore::new(pool.clone(), table.clone()))
        },
        (StateBackend::File { path }, _) => Arc::new(FileSyncStateStore::new(path.clone())),
        (StateBackend::Database { .. }, None) => {
            anyhow::bail!("Database state backend configured but no database connection")
        },
    };

    info!(store = store.name(), dry_run, "Registry store ready");

    Ok(SyncOrchestrator::new(config, store, state)?.dry_run(dry_run))
}

fn report(outcome: platereg_sync::Result<SyncOutcome>) -> Result<()> {
    match outcome {
        Ok(outcome) => {
            println!("{}", serde_json::to_string(&outcome)?);
            Ok(())
        },
        Err(e) => {
            error!(error = %e, kind = e.kind(), retryable = e.is_retryable(), "Registry sync failed");
            Err(e.into())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_check_with_file_state_needs_no_database() {
        let file = StateBackend::File {
            path: PathBuf::from("sync_state.json"),
        };
        let table = StateBackend::Database {
            table: "registry_sync_state".to_string(),
        };

        assert!(!needs_database(RegistryTarget::Memory, &file));
        assert!(needs_database(RegistryTarget::Memory, &table));
        assert!(needs_database(RegistryTarget::Database, &file));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["platereg-sync", "run", "--dry-run"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Run {
                force: false,
                dry_run: true
            }
        ));

        let cli = Cli::try_parse_from(["platereg-sync", "check"]).unwrap();
        assert!(matches!(cli.command, Command::Check));
    }
}
