use crate::watchdog::LeaseWatchdog;
use rfs_core::{AcquiredWork, CoordinationError, WorkAcquisitionOutcome, WorkCoordinator};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A lease held for the duration of one guarded unit of work.
#[derive(Debug, Clone)]
pub struct WorkLease {
    pub work: AcquiredWork,
    /// Cancelled by the watchdog once the lease expires.
    pub cancellation: CancellationToken,
}

impl WorkLease {
    pub fn work_item_id(&self) -> &str {
        &self.work.work_item_id
    }

    pub fn is_expired(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Receives exactly one of the three acquisition outcomes.
pub trait AcquisitionVisitor {
    type Output;
    type Error: From<CoordinationError>;

    fn on_already_completed(&mut self) -> Result<Self::Output, Self::Error>;

    fn on_no_available_work(&mut self) -> Result<Self::Output, Self::Error>;

    /// Runs with the watchdog armed. Returning `Ok` marks the work item complete.
    fn on_acquired_work(&mut self, lease: &WorkLease) -> Result<Self::Output, Self::Error>;
}

/// Unregisters the watchdog however the guarded work ends.
struct Registration<'a> {
    watchdog: &'a LeaseWatchdog,
    work_item_id: &'a str,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.watchdog.mark_work_as_completed(self.work_item_id);
    }
}

pub struct ScopedWorkSession<'a, C: ?Sized> {
    coordinator: &'a C,
    watchdog: &'a LeaseWatchdog,
}

impl<'a, C: WorkCoordinator + ?Sized> ScopedWorkSession<'a, C> {
    pub fn new(coordinator: &'a C, watchdog: &'a LeaseWatchdog) -> Self {
        Self {
            coordinator,
            watchdog,
        }
    }

    pub fn coordinator(&self) -> &'a C {
        self.coordinator
    }

    /// Acquires through `acquire`, dispatches the outcome to `visitor`, and completes
    /// the work item only when the visitor's guarded work returns normally. An error
    /// leaves the item leased until its lease runs out.
    pub fn ensure_phase_completion<V, A>(
        &self,
        acquire: A,
        visitor: &mut V,
    ) -> Result<V::Output, V::Error>
    where
        V: AcquisitionVisitor,
        A: FnOnce(&C) -> Result<WorkAcquisitionOutcome, CoordinationError>,
    {
        match acquire(self.coordinator)? {
            WorkAcquisitionOutcome::AlreadyCompleted => visitor.on_already_completed(),
            WorkAcquisitionOutcome::NoAvailableWork => visitor.on_no_available_work(),
            WorkAcquisitionOutcome::Acquired(work) => {
                let cancellation = self
                    .watchdog
                    .register_expiration(&work.work_item_id, work.lease_expiration);
                let lease = WorkLease { work, cancellation };
                let _registration = Registration {
                    watchdog: self.watchdog,
                    work_item_id: lease.work_item_id(),
                };

                let output = visitor.on_acquired_work(&lease)?;
                self.coordinator
                    .complete_work_item(lease.work_item_id())
                    .map_err(V::Error::from)?;
                debug!(event = "scoped_work_completed", work_item_id = %lease.work_item_id());
                Ok(output)
            }
        }
    }
}
