//! `rfs-worker` wiring: configuration, store selection and the local collaborators.

pub mod cli;
pub mod config;
pub mod local;

use anyhow::{Context, Result};
use config::{Backend, Mode, WorkerConfig};
use local::LocalCluster;
use rfs_coordination::LeaseWatchdog;
use rfs_core::{Clock, SystemClock};
use rfs_migration::{CoordinationStore, MigrationRunner, WorkerState, EXIT_SUCCESS};
use rfs_opensearch::{OpenSearchCoordinator, OpenSearchCoordinatorConfig, ReqwestTransport};
use rfs_storage::{SqliteCoordinator, SqliteCoordinatorConfig};
use std::sync::Arc;
use tracing::{error, info};

pub fn open_store(
    config: &WorkerConfig,
    worker_id: &str,
    clock: Arc<dyn Clock>,
) -> Result<Box<dyn CoordinationStore>> {
    let store = &config.store;
    match store.backend {
        Backend::Sqlite => {
            let coordinator = SqliteCoordinator::open(&store.path, worker_id, clock)
                .with_context(|| format!("Failed to open store {}", store.path.display()))?
                .with_config(SqliteCoordinatorConfig {
                    tolerable_clock_drift: store.tolerable_clock_drift(),
                    ..SqliteCoordinatorConfig::default()
                })?;
            Ok(Box::new(coordinator))
        }
        Backend::Opensearch => {
            let url = store
                .url
                .as_deref()
                .context("store.url is required for the opensearch backend")?;
            let mut transport = ReqwestTransport::new(url)?;
            if let (Some(username), Some(password)) = (&store.username, &store.password) {
                transport = transport.with_basic_auth(username, password);
            }
            let coordinator = OpenSearchCoordinator::new(transport, worker_id, clock).with_config(
                OpenSearchCoordinatorConfig {
                    tolerable_clock_drift: store.tolerable_clock_drift(),
                    ..OpenSearchCoordinatorConfig::default()
                },
            );
            Ok(Box::new(coordinator))
        }
    }
}

/// Runs one worker invocation and returns the process exit code. Only wiring
/// failures surface as errors; migration failures map to their exit code.
pub fn run(config: &WorkerConfig, worker_id: &str) -> Result<i32> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let phases = config.migration.parsed_phases()?;
    let settings = config.migration_settings();
    let store = open_store(config, worker_id, clock.clone())?;
    let watchdog = LeaseWatchdog::start(clock.clone(), None);
    let cluster = LocalCluster::new(&config.local.source_dir, &config.local.target_dir);

    info!(
        event = "worker_started",
        worker_id,
        mode = ?config.migration.mode,
        backend = ?config.store.backend,
        snapshot = %settings.snapshot_name
    );
    let state = WorkerState::new(
        store.as_ref(),
        cluster.collaborators(),
        clock,
        &watchdog,
        &settings,
    );
    let mut runner = MigrationRunner::new(state);

    let code = match config.migration.mode {
        Mode::Phases => match runner.run_phases(&phases) {
            Ok(()) => EXIT_SUCCESS,
            Err(err) => {
                let code = err.exit_code();
                error!(event = "worker_failed", exit_code = code, error = %error_chain(&err));
                code
            }
        },
        Mode::Shard => match runner.run_shard_worker() {
            Ok(outcome) => {
                info!(event = "shard_worker_finished", outcome = ?outcome);
                outcome.exit_code()
            }
            Err(err) => {
                let code = err.exit_code();
                error!(event = "worker_failed", exit_code = code, error = %error_chain(&err));
                code
            }
        },
    };
    Ok(code)
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
