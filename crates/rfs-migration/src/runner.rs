use crate::context::WorkerState;
use crate::error::{MigrationError, EXIT_NO_WORK_LEFT, EXIT_SUCCESS};
use crate::phases::{DocumentsStep, IndexStep, MetadataStep, SnapshotStep};
use crate::shard_worker::{migrate_next_shard, ShardOutcome};
use crate::step::{drive, random_wait, PhaseExit, PhaseStep};
use rfs_core::{Phase, WorkCoordinator};
use rfs_coordination::{FanOutOutcome, ShardWorkPreparer};
use tracing::{debug, error, info};

/// Result of a single shard-worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardWorkerOutcome {
    Migrated { work_item_id: String, documents: usize },
    /// The acquired shard was past its attempt limit and is now settled as failed.
    ShardFailed { work_item_id: String, attempts: u32 },
    /// Every work item is settled.
    NothingPending,
    /// Nothing acquirable, yet other workers still hold incomplete items.
    NoWorkLeft,
}

impl ShardWorkerOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShardWorkerOutcome::Migrated { .. }
            | ShardWorkerOutcome::ShardFailed { .. }
            | ShardWorkerOutcome::NothingPending => EXIT_SUCCESS,
            ShardWorkerOutcome::NoWorkLeft => EXIT_NO_WORK_LEFT,
        }
    }
}

pub struct MigrationRunner<'a> {
    state: WorkerState<'a>,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(state: WorkerState<'a>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &WorkerState<'a> {
        &self.state
    }

    /// Runs the given phases in order. A phase that ends in its failed terminal step
    /// stops the run.
    pub fn run_phases(&mut self, phases: &[Phase]) -> Result<(), MigrationError> {
        self.state.store.setup()?;
        info!(
            event = "runner_started",
            worker_id = %self.state.store.worker_id(),
            phases = phases.len()
        );
        for &phase in phases {
            match self.run_phase(phase)? {
                PhaseExit::Success => {}
                PhaseExit::Failed(failure) => {
                    error!(event = "runner_phase_failed", phase = %phase, reason = %failure);
                    return Err(MigrationError::PhaseExitedFailed { phase, failure });
                }
            }
        }
        info!(event = "runner_finished");
        Ok(())
    }

    /// Drives one phase's step graph from `EnterPhase`. Errors carry the phase, the
    /// step that raised them and the last entry observed.
    pub fn run_phase(&mut self, phase: Phase) -> Result<PhaseExit, MigrationError> {
        let state = &mut self.state;
        let result = match phase {
            Phase::Snapshot => drive(PhaseStep::<SnapshotStep>::EnterPhase, state),
            Phase::Metadata => drive(PhaseStep::<MetadataStep>::EnterPhase, state),
            Phase::Index => drive(PhaseStep::<IndexStep>::EnterPhase, state),
            Phase::Documents => drive(PhaseStep::<DocumentsStep>::EnterPhase, state),
        };
        result.map_err(|source| {
            error!(
                event = "runner_failed",
                phase = %phase,
                step = state.step,
                error = %source
            );
            MigrationError::PhaseFailed {
                phase,
                step: state.step,
                entry: state.phase_entry.clone(),
                source: Box::new(source),
            }
        })
    }

    /// One invocation of a standalone shard worker: make sure the shard work items
    /// exist, then migrate at most one shard.
    pub fn run_shard_worker(&mut self) -> Result<ShardWorkerOutcome, MigrationError> {
        self.state.store.setup()?;
        self.prepare_shard_work()?;

        match migrate_next_shard(&self.state)? {
            ShardOutcome::Migrated {
                work_item_id,
                documents,
            } => Ok(ShardWorkerOutcome::Migrated {
                work_item_id,
                documents,
            }),
            ShardOutcome::Failed {
                work_item_id,
                attempts,
            } => Ok(ShardWorkerOutcome::ShardFailed {
                work_item_id,
                attempts,
            }),
            ShardOutcome::NoAvailableWork | ShardOutcome::AlreadyCompleted => {
                if self.state.store.work_items_are_pending()? {
                    info!(event = "shard_worker_no_work_left");
                    Ok(ShardWorkerOutcome::NoWorkLeft)
                } else {
                    info!(event = "shard_worker_nothing_pending");
                    Ok(ShardWorkerOutcome::NothingPending)
                }
            }
        }
    }

    fn prepare_shard_work(&self) -> Result<(), MigrationError> {
        let settings = self.state.settings;
        let preparer = ShardWorkPreparer::new(
            self.state.collaborators.snapshot_metadata,
            &settings.snapshot_name,
            &settings.allowlist,
        );
        loop {
            match preparer.prepare(&self.state.session()) {
                Ok(FanOutOutcome::Prepared { shards, created }) => {
                    info!(event = "shard_work_prepared", shards, created);
                    return Ok(());
                }
                Ok(FanOutOutcome::AlreadyPrepared) => return Ok(()),
                Err(err) if err.is_held_elsewhere() => {
                    let wait = random_wait(settings.fan_out_retry_wait);
                    debug!(event = "fan_out_held_elsewhere", wait_ms = wait.as_millis() as u64);
                    self.state.clock.sleep(wait);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
