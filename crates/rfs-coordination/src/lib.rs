pub mod fan_out;
pub mod session;
pub mod watchdog;

pub use fan_out::{
    FanOutError, FanOutOutcome, IndexAllowlist, ShardWorkPreparer, SHARD_SETUP_LEASE,
    SHARD_SETUP_WORK_ITEM_ID,
};
pub use session::{AcquisitionVisitor, ScopedWorkSession, WorkLease};
pub use tokio_util::sync::CancellationToken;
pub use watchdog::{ExpirationCallback, LeaseWatchdog};
