use crate::context::WorkerState;
use crate::error::{MigrationError, PhaseFailure};
use crate::step::{mark_in_progress, PhaseStep, PhaseWork};
use rfs_core::collaborators::SnapshotState;
use rfs_core::Phase;
use tracing::{debug, info};

#[derive(Debug)]
pub enum SnapshotStep {
    CreateSnapshot { marked: bool },
    WaitForSnapshot { observed: Option<SnapshotState> },
}

impl PhaseWork for SnapshotStep {
    const PHASE: Phase = Phase::Snapshot;

    fn start() -> Self {
        SnapshotStep::CreateSnapshot { marked: false }
    }

    fn resume() -> Self {
        SnapshotStep::WaitForSnapshot { observed: None }
    }

    fn name(&self) -> &'static str {
        match self {
            SnapshotStep::CreateSnapshot { .. } => "CreateSnapshot",
            SnapshotStep::WaitForSnapshot { .. } => "WaitForSnapshot",
        }
    }

    fn run(&mut self, state: &mut WorkerState<'_>) -> Result<(), MigrationError> {
        let settings = state.settings;
        let snapshot_name = settings.snapshot_name.as_str();
        match self {
            SnapshotStep::CreateSnapshot { marked } => {
                state
                    .collaborators
                    .snapshot_creator
                    .create_snapshot(snapshot_name)?;
                info!(event = "snapshot_initiated", snapshot = snapshot_name);
                *marked = mark_in_progress(state)?;
            }
            SnapshotStep::WaitForSnapshot { observed } => {
                let current = state
                    .collaborators
                    .snapshot_creator
                    .snapshot_state(snapshot_name)?;
                if current == SnapshotState::InProgress {
                    debug!(event = "snapshot_pending", snapshot = snapshot_name);
                    state.clock.sleep(settings.snapshot_poll_interval);
                }
                *observed = Some(current);
            }
        }
        Ok(())
    }

    fn next_step(self, state: &WorkerState<'_>) -> PhaseStep<Self> {
        match self {
            SnapshotStep::CreateSnapshot { marked: true } => PhaseStep::Work(Self::resume()),
            SnapshotStep::CreateSnapshot { marked: false } => PhaseStep::GetEntry,
            SnapshotStep::WaitForSnapshot {
                observed: Some(SnapshotState::Completed),
            } => PhaseStep::ExitPhaseSuccess,
            SnapshotStep::WaitForSnapshot {
                observed: Some(SnapshotState::Failed),
            } => PhaseStep::ExitPhaseFailed(PhaseFailure::SnapshotFailed {
                snapshot_name: state.settings.snapshot_name.clone(),
            }),
            SnapshotStep::WaitForSnapshot { .. } => PhaseStep::Work(Self::resume()),
        }
    }
}
