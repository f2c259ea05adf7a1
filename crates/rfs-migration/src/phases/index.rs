use crate::context::WorkerState;
use crate::error::MigrationError;
use crate::step::{mark_in_progress, PhaseStep, PhaseWork};
use rfs_core::{EntryStore, IndexWorkEntry, IndexWorkStatus, Phase};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum IndexStep {
    SetupIndexWorkEntries { marked: bool },
    GetIndicesToMigrate { batch: Vec<IndexWorkEntry> },
    MigrateIndices { batch: Vec<IndexWorkEntry> },
}

impl PhaseWork for IndexStep {
    const PHASE: Phase = Phase::Index;

    fn start() -> Self {
        IndexStep::SetupIndexWorkEntries { marked: false }
    }

    fn resume() -> Self {
        IndexStep::GetIndicesToMigrate { batch: Vec::new() }
    }

    fn name(&self) -> &'static str {
        match self {
            IndexStep::SetupIndexWorkEntries { .. } => "SetupIndexWorkEntries",
            IndexStep::GetIndicesToMigrate { .. } => "GetIndicesToMigrate",
            IndexStep::MigrateIndices { .. } => "MigrateIndices",
        }
    }

    fn run(&mut self, state: &mut WorkerState<'_>) -> Result<(), MigrationError> {
        match self {
            IndexStep::SetupIndexWorkEntries { marked } => {
                let indices = state
                    .collaborators
                    .snapshot_metadata
                    .indices(&state.settings.snapshot_name)?;
                let mut created = 0;
                for index in indices
                    .iter()
                    .filter(|index| state.settings.allowlist.allows(&index.name))
                {
                    if state
                        .store
                        .create_index_work_entry(&IndexWorkEntry::not_started(index.name.as_str()))?
                    {
                        created += 1;
                    }
                }
                info!(event = "index_work_entries_created", created);
                *marked = mark_in_progress(state)?;
            }
            IndexStep::GetIndicesToMigrate { batch } => {
                *batch = state
                    .store
                    .index_work_entries_to_migrate(state.settings.index_batch_size.max(1))?;
                debug!(event = "index_batch_pulled", size = batch.len());
            }
            IndexStep::MigrateIndices { batch } => {
                for entry in batch.iter() {
                    migrate_index(state, entry)?;
                }
            }
        }
        Ok(())
    }

    fn next_step(self, _state: &WorkerState<'_>) -> PhaseStep<Self> {
        match self {
            IndexStep::SetupIndexWorkEntries { marked: true } => PhaseStep::Work(Self::resume()),
            IndexStep::SetupIndexWorkEntries { marked: false } => PhaseStep::GetEntry,
            IndexStep::GetIndicesToMigrate { batch } if batch.is_empty() => {
                PhaseStep::ExitPhaseSuccess
            }
            IndexStep::GetIndicesToMigrate { batch } => {
                PhaseStep::Work(IndexStep::MigrateIndices { batch })
            }
            IndexStep::MigrateIndices { .. } => PhaseStep::Work(Self::resume()),
        }
    }
}

/// Settles one child entry. Only store failures propagate; a failed index creation
/// is recorded on the entry and retried on a later pull.
fn migrate_index(state: &WorkerState<'_>, entry: &IndexWorkEntry) -> Result<(), MigrationError> {
    if entry.num_attempts > IndexWorkEntry::ATTEMPTS_SOFT_LIMIT {
        let failed = entry.with_status(IndexWorkStatus::Failed);
        if state.store.update_index_work_entry(&failed, entry)?.is_some() {
            warn!(
                event = "index_marked_failed",
                index = %entry.name,
                num_attempts = entry.num_attempts
            );
        }
        return Ok(());
    }

    match state
        .collaborators
        .index_creator
        .create_index(&state.settings.snapshot_name, &entry.name)
    {
        Ok(()) => {
            state
                .store
                .force_update_index_work_entry(&entry.with_status(IndexWorkStatus::Completed))?;
            info!(event = "index_created", index = %entry.name);
        }
        Err(err) => {
            warn!(event = "index_creation_failed", index = %entry.name, error = %err);
            state
                .store
                .update_index_work_entry(&entry.with_attempt_recorded(), entry)?;
        }
    }
    Ok(())
}
