//! Phase state machine driving a snapshot-to-cluster migration: Snapshot, Metadata,
//! Index and Documents, each an explicit step graph over a leased phase entry.

pub mod context;
pub mod error;
pub mod phases;
pub mod routing;
pub mod runner;
pub mod shard_worker;
pub mod step;

pub use context::{Collaborators, CoordinationStore, MigrationSettings, WorkerState};
pub use error::{
    MigrationError, PhaseFailure, EXIT_FAILURE, EXIT_LEASE_EXPIRED, EXIT_NO_WORK_LEFT,
    EXIT_SUCCESS,
};
pub use routing::{route_phase_entry, EntryRoute};
pub use runner::{MigrationRunner, ShardWorkerOutcome};
pub use step::{drive, PhaseExit, PhaseStep, PhaseWork, Step, Transition};
