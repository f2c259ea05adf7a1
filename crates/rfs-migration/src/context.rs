use chrono::{DateTime, Utc};
use rfs_core::collaborators::{
    DocumentSink, DocumentSource, IndexCreator, MetadataMigrator, SnapshotCreator,
    SnapshotMetadataSource,
};
use rfs_core::{Clock, EntryStore, Phase, PhaseEntry, WorkCoordinator};
use rfs_coordination::{IndexAllowlist, LeaseWatchdog, ScopedWorkSession};
use std::sync::Arc;
use std::time::Duration;

/// Store holding both work items and phase entries.
pub trait CoordinationStore: WorkCoordinator + EntryStore {}

impl<T: WorkCoordinator + EntryStore + ?Sized> CoordinationStore for T {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSettings {
    pub snapshot_name: String,
    pub allowlist: IndexAllowlist,
    pub phase_lease: Duration,
    pub shard_lease: Duration,
    pub phase_max_attempts: u32,
    pub max_shard_attempts: u32,
    pub index_batch_size: usize,
    pub documents_per_bulk: usize,
    /// Upper bound of the randomized back-off before re-reading a contended entry.
    pub random_wait: Duration,
    pub fan_out_retry_wait: Duration,
    pub snapshot_poll_interval: Duration,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            snapshot_name: "rfs-snapshot".to_string(),
            allowlist: IndexAllowlist::default(),
            phase_lease: Duration::from_secs(60),
            shard_lease: Duration::from_secs(600),
            phase_max_attempts: PhaseEntry::MAX_ATTEMPTS,
            max_shard_attempts: 5,
            index_batch_size: 10,
            documents_per_bulk: 500,
            random_wait: Duration::from_secs(5),
            fan_out_retry_wait: Duration::from_secs(10),
            snapshot_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Systems the phases drive.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub snapshot_metadata: &'a dyn SnapshotMetadataSource,
    pub snapshot_creator: &'a dyn SnapshotCreator,
    pub metadata_migrator: &'a dyn MetadataMigrator,
    pub index_creator: &'a dyn IndexCreator,
    pub document_source: &'a dyn DocumentSource,
    pub document_sink: &'a dyn DocumentSink,
}

/// Everything a step may read or mutate, owned by the runner and passed down
/// explicitly. The phase, step and entry fields double as failure context.
pub struct WorkerState<'a> {
    pub store: &'a dyn CoordinationStore,
    pub collaborators: Collaborators<'a>,
    pub clock: Arc<dyn Clock>,
    pub watchdog: &'a LeaseWatchdog,
    pub settings: &'a MigrationSettings,
    pub phase: Option<Phase>,
    pub step: &'static str,
    pub phase_entry: Option<PhaseEntry>,
}

impl<'a> WorkerState<'a> {
    pub fn new(
        store: &'a dyn CoordinationStore,
        collaborators: Collaborators<'a>,
        clock: Arc<dyn Clock>,
        watchdog: &'a LeaseWatchdog,
        settings: &'a MigrationSettings,
    ) -> Self {
        Self {
            store,
            collaborators,
            clock,
            watchdog,
            settings,
            phase: None,
            step: "",
            phase_entry: None,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn session(&self) -> ScopedWorkSession<'a, dyn CoordinationStore + 'a> {
        ScopedWorkSession::new(self.store, self.watchdog)
    }
}
