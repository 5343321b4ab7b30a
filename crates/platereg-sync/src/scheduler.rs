//! Fixed-interval daemon loop

use std::future::Future;
use std::time::Duration;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::orchestrator::{RunOptions, SyncOrchestrator, SyncOutcome};

/// Tally of a daemon session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub runs: u64,
    pub synced: u64,
    pub unchanged: u64,
    pub failed: u64,
}

/// Call `run` every `interval` until `shutdown` resolves.
///
/// The first run starts immediately and is the only one that honours
/// `first_run.force`. A failed run is logged and retried at the next tick.
/// Shutdown is checked between runs, never in the middle of one.
pub async fn run_every<F>(
    orchestrator: &SyncOrchestrator,
    interval: Duration,
    first_run: RunOptions,
    shutdown: F,
) -> SchedulerStats
where
    F: Future<Output = ()>,
{
    let mut stats = SchedulerStats::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut options = first_run;

    tokio::pin!(shutdown);

    info!(interval_secs = interval.as_secs(), "Registry sync scheduler started");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, stopping scheduler");
                break;
            },
            _ = ticker.tick() => {
                stats.runs += 1;
                match orchestrator.run(options).await {
                    Ok(SyncOutcome::Synced(_)) => stats.synced += 1,
                    Ok(SyncOutcome::Unchanged { .. }) => stats.unchanged += 1,
                    Err(e) => {
                        stats.failed += 1;
                        if e.is_retryable() {
                            warn!(error = %e, kind = e.kind(), "Scheduled sync failed, will retry next tick");
                        } else {
                            error!(error = %e, kind = e.kind(), "Scheduled sync failed and needs operator attention");
                        }
                    },
                }
                options = RunOptions::default();
            },
        }
    }

    info!(
        runs = stats.runs,
        synced = stats.synced,
        unchanged = stats.unchanged,
        failed = stats.failed,
        "Registry sync scheduler stopped"
    );
    stats
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::state::FileSyncStateStore;
    use crate::storage::MemoryRegistryStore;
    use std::sync::Arc;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_failed_runs_are_retried_until_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::default().with_source_url(format!("{}/registry.zip", server.uri()));
        let orchestrator = SyncOrchestrator::new(
            config,
            Arc::new(MemoryRegistryStore::new()),
            Arc::new(FileSyncStateStore::new(dir.path().join("state.json"))),
        )
        .unwrap();

        let stats = run_every(
            &orchestrator,
            Duration::from_millis(20),
            RunOptions::default(),
            tokio::time::sleep(Duration::from_millis(150)),
        )
        .await;

        assert!(stats.runs >= 2, "{stats:?}");
        assert_eq!(stats.failed, stats.runs);
        assert_eq!(stats.synced, 0);
    }
}
