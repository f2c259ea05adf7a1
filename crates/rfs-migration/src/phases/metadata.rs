use crate::context::WorkerState;
use crate::error::MigrationError;
use crate::step::{PhaseStep, PhaseWork};
use rfs_core::Phase;
use tracing::info;

#[derive(Debug)]
pub enum MetadataStep {
    MigrateTemplates,
}

impl PhaseWork for MetadataStep {
    const PHASE: Phase = Phase::Metadata;

    fn start() -> Self {
        MetadataStep::MigrateTemplates
    }

    fn resume() -> Self {
        MetadataStep::MigrateTemplates
    }

    fn name(&self) -> &'static str {
        "MigrateTemplates"
    }

    fn run(&mut self, state: &mut WorkerState<'_>) -> Result<(), MigrationError> {
        let snapshot_name = state.settings.snapshot_name.as_str();
        state
            .collaborators
            .metadata_migrator
            .migrate_templates(snapshot_name)?;
        info!(event = "templates_migrated", snapshot = snapshot_name);
        Ok(())
    }

    fn next_step(self, _state: &WorkerState<'_>) -> PhaseStep<Self> {
        PhaseStep::ExitPhaseSuccess
    }
}
