use crate::context::WorkerState;
use crate::error::MigrationError;
use crate::shard_worker::{migrate_next_shard, ShardOutcome};
use crate::step::{mark_in_progress, PhaseStep, PhaseWork};
use rfs_core::{Phase, WorkCoordinator};
use rfs_coordination::{FanOutOutcome, ShardWorkPreparer};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    Pending,
    Ready,
    /// The phase entry changed before it could be marked in progress.
    EntryChanged,
    /// Another worker holds the fan-out guard.
    GuardHeldElsewhere,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardStepOutcome {
    Pending,
    Migrated,
    /// A shard past its attempt limit was settled as failed; the others carry on.
    ShardFailed,
    NoWork,
}

#[derive(Debug)]
pub enum DocumentsStep {
    SetupDocumentsWork { outcome: SetupOutcome },
    MigrateShard { outcome: ShardStepOutcome },
    CheckPendingWork { pending: bool },
}

impl PhaseWork for DocumentsStep {
    const PHASE: Phase = Phase::Documents;

    fn start() -> Self {
        DocumentsStep::SetupDocumentsWork {
            outcome: SetupOutcome::Pending,
        }
    }

    fn resume() -> Self {
        DocumentsStep::MigrateShard {
            outcome: ShardStepOutcome::Pending,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            DocumentsStep::SetupDocumentsWork { .. } => "SetupDocumentsWork",
            DocumentsStep::MigrateShard { .. } => "MigrateShard",
            DocumentsStep::CheckPendingWork { .. } => "CheckPendingWork",
        }
    }

    fn run(&mut self, state: &mut WorkerState<'_>) -> Result<(), MigrationError> {
        match self {
            DocumentsStep::SetupDocumentsWork { outcome } => {
                *outcome = setup_documents_work(state)?;
            }
            DocumentsStep::MigrateShard { outcome } => {
                *outcome = match migrate_next_shard(state)? {
                    ShardOutcome::Migrated { .. } => ShardStepOutcome::Migrated,
                    ShardOutcome::Failed { .. } => ShardStepOutcome::ShardFailed,
                    ShardOutcome::NoAvailableWork | ShardOutcome::AlreadyCompleted => {
                        ShardStepOutcome::NoWork
                    }
                };
            }
            DocumentsStep::CheckPendingWork { pending } => {
                *pending = state.store.work_items_are_pending()?;
                debug!(event = "documents_pending_checked", pending = *pending);
            }
        }
        Ok(())
    }

    fn next_step(self, _state: &WorkerState<'_>) -> PhaseStep<Self> {
        match self {
            DocumentsStep::SetupDocumentsWork {
                outcome: SetupOutcome::Ready,
            } => PhaseStep::Work(Self::resume()),
            DocumentsStep::SetupDocumentsWork {
                outcome: SetupOutcome::EntryChanged,
            } => PhaseStep::GetEntry,
            DocumentsStep::SetupDocumentsWork { .. } => PhaseStep::Work(Self::start()),
            DocumentsStep::MigrateShard {
                outcome: ShardStepOutcome::NoWork,
            } => PhaseStep::Work(DocumentsStep::CheckPendingWork { pending: false }),
            DocumentsStep::MigrateShard { .. } => PhaseStep::Work(Self::resume()),
            DocumentsStep::CheckPendingWork { pending: true } => PhaseStep::RandomWait,
            DocumentsStep::CheckPendingWork { pending: false } => PhaseStep::ExitPhaseSuccess,
        }
    }
}

fn setup_documents_work(state: &mut WorkerState<'_>) -> Result<SetupOutcome, MigrationError> {
    let settings = state.settings;
    let preparer = ShardWorkPreparer::new(
        state.collaborators.snapshot_metadata,
        &settings.snapshot_name,
        &settings.allowlist,
    );
    match preparer.prepare(&state.session()) {
        Ok(FanOutOutcome::Prepared { shards, created }) => {
            info!(event = "documents_work_prepared", shards, created);
        }
        Ok(FanOutOutcome::AlreadyPrepared) => {
            debug!(event = "documents_work_already_prepared");
        }
        Err(err) if err.is_held_elsewhere() => {
            debug!(
                event = "fan_out_held_elsewhere",
                retry_in_secs = settings.fan_out_retry_wait.as_secs()
            );
            state.clock.sleep(settings.fan_out_retry_wait);
            return Ok(SetupOutcome::GuardHeldElsewhere);
        }
        Err(err) => return Err(err.into()),
    }

    Ok(if mark_in_progress(state)? {
        SetupOutcome::Ready
    } else {
        SetupOutcome::EntryChanged
    })
}
