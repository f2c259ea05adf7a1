use crate::session::{AcquisitionVisitor, ScopedWorkSession, WorkLease};
use rfs_core::collaborators::{CollaboratorError, SnapshotMetadataSource};
use rfs_core::{CoordinationError, IndexAndShard, WorkCoordinator, WorkItemIdError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Well-known work item guarding the one-time shard fan-out.
pub const SHARD_SETUP_WORK_ITEM_ID: &str = "shard_setup";
pub const SHARD_SETUP_LEASE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum FanOutError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    #[error("snapshot metadata unavailable: {0}")]
    Metadata(#[from] CollaboratorError),
    #[error(transparent)]
    InvalidIndexName(#[from] WorkItemIdError),
    #[error("fan-out lease expired before every shard was enqueued")]
    LeaseExpired,
}

impl FanOutError {
    /// Another worker holds the fan-out guard.
    pub fn is_held_elsewhere(&self) -> bool {
        matches!(
            self,
            FanOutError::Coordination(CoordinationError::LeaseLockHeldElsewhere { .. })
        )
    }
}

/// Which indices a migration covers. Empty selects every index not starting with `.`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexAllowlist {
    names: Vec<String>,
}

impl IndexAllowlist {
    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, index_name: &str) -> bool {
        if self.names.is_empty() {
            !index_name.starts_with('.')
        } else {
            self.names.iter().any(|name| name == index_name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutOutcome {
    /// This worker enumerated the shards. `created` excludes items that already existed.
    Prepared { shards: usize, created: usize },
    AlreadyPrepared,
}

/// Enqueues one unassigned work item per (index, shard) in the snapshot.
pub struct ShardWorkPreparer<'a, M: ?Sized> {
    metadata: &'a M,
    snapshot_name: &'a str,
    allowlist: &'a IndexAllowlist,
}

impl<'a, M: SnapshotMetadataSource + ?Sized> ShardWorkPreparer<'a, M> {
    pub fn new(metadata: &'a M, snapshot_name: &'a str, allowlist: &'a IndexAllowlist) -> Self {
        Self {
            metadata,
            snapshot_name,
            allowlist,
        }
    }

    /// Runs the fan-out under the guard item. Fails with a held-elsewhere error while
    /// another worker is enumerating; callers wait and retry.
    pub fn prepare<C: WorkCoordinator + ?Sized>(
        &self,
        session: &ScopedWorkSession<'_, C>,
    ) -> Result<FanOutOutcome, FanOutError> {
        let mut visitor = FanOutVisitor {
            preparer: self,
            coordinator: session.coordinator(),
        };
        session.ensure_phase_completion(
            |coordinator| {
                coordinator
                    .create_or_update_lease_for_work_item(SHARD_SETUP_WORK_ITEM_ID, SHARD_SETUP_LEASE)
            },
            &mut visitor,
        )
    }

    fn enqueue_shards<C: WorkCoordinator + ?Sized>(
        &self,
        coordinator: &C,
        lease: &WorkLease,
    ) -> Result<FanOutOutcome, FanOutError> {
        let indices = self.metadata.indices(self.snapshot_name)?;
        let mut shards = 0;
        let mut created = 0;
        for index in indices.iter().filter(|index| self.allowlist.allows(&index.name)) {
            for shard in 0..index.shards {
                if lease.is_expired() {
                    return Err(FanOutError::LeaseExpired);
                }
                let id = IndexAndShard::new(index.name.as_str(), shard)?.work_item_id();
                if coordinator.create_unassigned_work_item(&id)? {
                    created += 1;
                    debug!(event = "fan_out_item_created", work_item_id = %id);
                }
                shards += 1;
            }
        }
        info!(
            event = "fan_out_prepared",
            snapshot = self.snapshot_name,
            indices = indices.len(),
            shards,
            created
        );
        Ok(FanOutOutcome::Prepared { shards, created })
    }
}

struct FanOutVisitor<'p, 'a, M: ?Sized, C: ?Sized> {
    preparer: &'p ShardWorkPreparer<'a, M>,
    coordinator: &'p C,
}

impl<M, C> AcquisitionVisitor for FanOutVisitor<'_, '_, M, C>
where
    M: SnapshotMetadataSource + ?Sized,
    C: WorkCoordinator + ?Sized,
{
    type Output = FanOutOutcome;
    type Error = FanOutError;

    fn on_already_completed(&mut self) -> Result<FanOutOutcome, FanOutError> {
        Ok(FanOutOutcome::AlreadyPrepared)
    }

    fn on_no_available_work(&mut self) -> Result<FanOutOutcome, FanOutError> {
        Ok(FanOutOutcome::AlreadyPrepared)
    }

    fn on_acquired_work(&mut self, lease: &WorkLease) -> Result<FanOutOutcome, FanOutError> {
        self.preparer.enqueue_shards(self.coordinator, lease)
    }
}
