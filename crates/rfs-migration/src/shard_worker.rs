use crate::context::WorkerState;
use crate::error::MigrationError;
use rfs_core::collaborators::SourceDocument;
use rfs_core::{IndexAndShard, WorkCoordinator};
use rfs_coordination::{AcquisitionVisitor, WorkLease};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// What one pass of shard acquisition produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardOutcome {
    Migrated { work_item_id: String, documents: usize },
    /// The shard was past its attempt limit and is now settled as failed.
    Failed { work_item_id: String, attempts: u32 },
    NoAvailableWork,
    AlreadyCompleted,
}

/// Reads one shard from the snapshot and re-indexes it into the target in bulks.
/// The lease token is checked before every document, so an expired lease stops the
/// stream before the next bulk is sent.
pub fn migrate_shard(
    state: &WorkerState<'_>,
    lease: &WorkLease,
    shard: &IndexAndShard,
) -> Result<usize, MigrationError> {
    let settings = state.settings;
    let bulk_size = settings.documents_per_bulk.max(1);
    let documents = state.collaborators.document_source.read_shard(
        &settings.snapshot_name,
        &shard.index_name,
        shard.shard,
    )?;

    let expired = || MigrationError::LeaseExpired {
        work_item_id: lease.work_item_id().to_string(),
    };
    let mut bulk: Vec<SourceDocument> = Vec::with_capacity(bulk_size);
    let mut sent = 0;
    for document in documents {
        if lease.is_expired() {
            return Err(expired());
        }
        bulk.push(document?);
        if bulk.len() >= bulk_size {
            state
                .collaborators
                .document_sink
                .send_bulk(&shard.index_name, &bulk)?;
            sent += bulk.len();
            debug!(
                event = "bulk_sent",
                work_item_id = %lease.work_item_id(),
                documents = bulk.len()
            );
            bulk.clear();
        }
    }
    if !bulk.is_empty() {
        if lease.is_expired() {
            return Err(expired());
        }
        state
            .collaborators
            .document_sink
            .send_bulk(&shard.index_name, &bulk)?;
        sent += bulk.len();
    }

    info!(
        event = "shard_migrated",
        work_item_id = %lease.work_item_id(),
        index = %shard.index_name,
        shard = shard.shard,
        documents = sent
    );
    Ok(sent)
}

/// Visitor for the scoped session that migrates whichever shard was acquired.
pub struct ShardMigrationVisitor<'s, 'a> {
    pub state: &'s WorkerState<'a>,
}

impl AcquisitionVisitor for ShardMigrationVisitor<'_, '_> {
    type Output = ShardOutcome;
    type Error = MigrationError;

    fn on_already_completed(&mut self) -> Result<ShardOutcome, MigrationError> {
        Ok(ShardOutcome::AlreadyCompleted)
    }

    fn on_no_available_work(&mut self) -> Result<ShardOutcome, MigrationError> {
        Ok(ShardOutcome::NoAvailableWork)
    }

    fn on_acquired_work(&mut self, lease: &WorkLease) -> Result<ShardOutcome, MigrationError> {
        let max_attempts = self.state.settings.max_shard_attempts;
        if lease.work.num_attempts > max_attempts {
            warn!(
                event = "shard_attempts_exhausted",
                work_item_id = %lease.work_item_id(),
                num_attempts = lease.work.num_attempts,
                max_attempts
            );
            self.state.store.fail_work_item(lease.work_item_id())?;
            return Ok(ShardOutcome::Failed {
                work_item_id: lease.work_item_id().to_string(),
                attempts: lease.work.num_attempts,
            });
        }
        let shard = IndexAndShard::from_str(lease.work_item_id())?;
        info!(
            event = "shard_acquired",
            work_item_id = %lease.work_item_id(),
            num_attempts = lease.work.num_attempts,
            lease_expiration = %lease.work.lease_expiration
        );
        let documents = migrate_shard(self.state, lease, &shard)?;
        Ok(ShardOutcome::Migrated {
            work_item_id: lease.work_item_id().to_string(),
            documents,
        })
    }
}

/// Acquires any one shard and migrates it under the scoped session.
pub fn migrate_next_shard(state: &WorkerState<'_>) -> Result<ShardOutcome, MigrationError> {
    let shard_lease = state.settings.shard_lease;
    let mut visitor = ShardMigrationVisitor { state };
    state.session().ensure_phase_completion(
        |coordinator| coordinator.acquire_next_work_item(shard_lease),
        &mut visitor,
    )
}
