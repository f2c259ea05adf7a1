use crate::phase::{IndexWorkEntry, Phase, PhaseEntry};
use crate::work_item::WorkItem;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("lease for work item {work_item_id} is held by another worker")]
    LeaseLockHeldElsewhere { work_item_id: String },
    #[error(
        "client time {client_epoch_seconds} and store time {server_epoch_seconds} differ by more than {tolerance_secs}s"
    )]
    ClockDrift {
        client_epoch_seconds: i64,
        server_epoch_seconds: i64,
        tolerance_secs: u64,
    },
    #[error("claim matched eligible work items but updated none after {attempts} retries; clocks are likely drifting")]
    PotentialClockDrift { attempts: u32 },
    #[error("{operation} did not succeed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        last_error: String,
    },
    #[error("work item {work_item_id} is leased to {holder:?}, not {worker_id}")]
    LeaseOwnershipViolation {
        work_item_id: String,
        worker_id: String,
        holder: Option<String>,
    },
    #[error("work item {work_item_id} uses script version {found}, expected {expected}")]
    ScriptVersionMismatch {
        work_item_id: String,
        found: String,
        expected: String,
    },
    #[error("work item {0} not found")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("malformed store response: {0}")]
    MalformedResponse(String),
    #[error("store backend error: {0}")]
    Backend(#[source] BoxedError),
}

impl CoordinationError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }

    /// Contention outcomes the caller is expected to absorb by waiting and retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LeaseLockHeldElsewhere { .. })
    }
}

/// A lease the caller now holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredWork {
    pub work_item_id: String,
    /// Authoritative deadline as stored; the caller's clock may disagree with the store's.
    pub lease_expiration: DateTime<Utc>,
    pub num_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkAcquisitionOutcome {
    AlreadyCompleted,
    NoAvailableWork,
    Acquired(AcquiredWork),
}

/// One round of the claim-any operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOneResult<T> {
    Assigned(T),
    /// Another claimant updated the chosen document first.
    VersionConflict,
    NothingToAcquire,
    /// Documents matched but the conditional update declined all of them.
    PotentialClockDrift,
}

/// Lease/mutex protocol over a shared store. Every mutation is a conditional write
/// keyed on previously observed state.
pub trait WorkCoordinator {
    fn worker_id(&self) -> &str;

    /// Idempotently creates the backing collection with its schema.
    fn setup(&self) -> Result<(), CoordinationError>;

    /// Inserts an unleased item if absent. Returns whether it was newly created.
    fn create_unassigned_work_item(&self, work_item_id: &str) -> Result<bool, CoordinationError>;

    /// Claims or re-affirms the lease on one specific item.
    ///
    /// Returns `Err(LeaseLockHeldElsewhere)` while another worker holds an unexpired
    /// lease.
    fn create_or_update_lease_for_work_item(
        &self,
        work_item_id: &str,
        lease_duration: Duration,
    ) -> Result<WorkAcquisitionOutcome, CoordinationError>;

    /// Claims any one incomplete item whose lease is absent or expired.
    fn acquire_next_work_item(
        &self,
        lease_duration: Duration,
    ) -> Result<WorkAcquisitionOutcome, CoordinationError>;

    /// Marks an item completed. Fails if the caller does not hold its lease. Completing
    /// an item the holder already failed leaves it failed.
    fn complete_work_item(&self, work_item_id: &str) -> Result<(), CoordinationError>;

    /// Settles an item as failed so that it is never claimed again. Same holder rule as
    /// `complete_work_item`; a no-op on items that are already settled.
    fn fail_work_item(&self, work_item_id: &str) -> Result<(), CoordinationError>;

    /// Items neither completed nor failed, after a visibility barrier.
    fn num_work_items_pending(&self) -> Result<u64, CoordinationError>;

    fn work_items_are_pending(&self) -> Result<bool, CoordinationError> {
        Ok(self.num_work_items_pending()? > 0)
    }

    fn get_work_item(&self, work_item_id: &str) -> Result<Option<WorkItem>, CoordinationError>;
}

/// Phase and child entries. Updates are compare-and-swap against the caller's
/// last-read entry: a mismatch is reported as `Ok(None)` and nothing is written.
pub trait EntryStore {
    fn get_phase_entry(&self, phase: Phase) -> Result<Option<PhaseEntry>, CoordinationError>;

    /// `Ok(None)` when another worker created the entry first.
    fn create_phase_entry(
        &self,
        entry: &PhaseEntry,
    ) -> Result<Option<PhaseEntry>, CoordinationError>;

    fn update_phase_entry(
        &self,
        updated: &PhaseEntry,
        expected: &PhaseEntry,
    ) -> Result<Option<PhaseEntry>, CoordinationError>;

    /// Idempotent. Returns whether the entry was newly created.
    fn create_index_work_entry(&self, entry: &IndexWorkEntry) -> Result<bool, CoordinationError>;

    fn get_index_work_entry(
        &self,
        index_name: &str,
    ) -> Result<Option<IndexWorkEntry>, CoordinationError>;

    /// Up to `limit` entries still `NOT_STARTED`, in name order.
    fn index_work_entries_to_migrate(
        &self,
        limit: usize,
    ) -> Result<Vec<IndexWorkEntry>, CoordinationError>;

    fn update_index_work_entry(
        &self,
        updated: &IndexWorkEntry,
        expected: &IndexWorkEntry,
    ) -> Result<Option<IndexWorkEntry>, CoordinationError>;

    /// Unconditional write. Only for callers that have locally confirmed the outcome.
    fn force_update_index_work_entry(
        &self,
        updated: &IndexWorkEntry,
    ) -> Result<IndexWorkEntry, CoordinationError>;
}
