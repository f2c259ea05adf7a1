pub mod clock;
pub mod collaborators;
pub mod coordinator;
pub mod lease;
pub mod retry;
pub mod phase;
pub mod work_item;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{
    AcquiredWork, AssignOneResult, CoordinationError, EntryStore, WorkAcquisitionOutcome,
    WorkCoordinator,
};
pub use phase::{IndexWorkEntry, IndexWorkStatus, Phase, PhaseEntry, PhaseStatus};
pub use work_item::{ClaimDecision, IndexAndShard, WorkItem, WorkItemIdError};

/// Schema tag written into every work item document. Participants running a different
/// claim script refuse to touch documents carrying another tag.
pub const SCRIPT_VERSION: &str = "2.0";
