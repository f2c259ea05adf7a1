use rfs_core::collaborators::CollaboratorError;
use rfs_core::{CoordinationError, Phase, PhaseEntry, WorkItemIdError};
use rfs_coordination::FanOutError;
use std::fmt;
use thiserror::Error;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
/// The worker held a lease that ran out before its work finished.
pub const EXIT_LEASE_EXPIRED: i32 = 2;
/// Nothing left to acquire although other workers still hold incomplete items.
pub const EXIT_NO_WORK_LEFT: i32 = 3;

/// Why a phase ended in its failed terminal step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseFailure {
    AttemptsExhausted { attempts: u32, max_attempts: u32 },
    /// Another worker already recorded the phase as failed.
    MarkedFailed,
    SnapshotFailed { snapshot_name: String },
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseFailure::AttemptsExhausted {
                attempts,
                max_attempts,
            } => write!(f, "phase lease attempts exhausted ({attempts}/{max_attempts})"),
            PhaseFailure::MarkedFailed => f.write_str("phase previously marked failed"),
            PhaseFailure::SnapshotFailed { snapshot_name } => {
                write!(f, "snapshot {snapshot_name} failed")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    #[error("collaborator failed: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("shard fan-out failed: {0}")]
    FanOut(#[from] FanOutError),
    #[error(transparent)]
    InvalidWorkItemId(#[from] WorkItemIdError),
    #[error("lease on {work_item_id} expired before the work finished")]
    LeaseExpired { work_item_id: String },
    #[error("{phase} phase failed: {failure}")]
    PhaseExitedFailed { phase: Phase, failure: PhaseFailure },
    #[error("{phase} phase failed in step {step} (entry: {entry:?})")]
    PhaseFailed {
        phase: Phase,
        step: &'static str,
        entry: Option<PhaseEntry>,
        #[source]
        source: Box<MigrationError>,
    },
}

impl MigrationError {
    pub fn exit_code(&self) -> i32 {
        match self {
            MigrationError::LeaseExpired { .. }
            | MigrationError::FanOut(FanOutError::LeaseExpired) => EXIT_LEASE_EXPIRED,
            MigrationError::PhaseFailed { source, .. } => source.exit_code(),
            _ => EXIT_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_expiry_keeps_its_exit_code_through_wrapping() {
        let inner = MigrationError::LeaseExpired {
            work_item_id: "logs__0".to_string(),
        };
        assert_eq!(inner.exit_code(), EXIT_LEASE_EXPIRED);

        let wrapped = MigrationError::PhaseFailed {
            phase: Phase::Documents,
            step: "MigrateShard",
            entry: None,
            source: Box::new(inner),
        };
        assert_eq!(wrapped.exit_code(), EXIT_LEASE_EXPIRED);
        assert!(wrapped.to_string().contains("MigrateShard"));
    }

    #[test]
    fn other_failures_exit_with_generic_code() {
        let err = MigrationError::PhaseExitedFailed {
            phase: Phase::Snapshot,
            failure: PhaseFailure::MarkedFailed,
        };
        assert_eq!(err.exit_code(), EXIT_FAILURE);
        assert_eq!(
            err.to_string(),
            "SNAPSHOT phase failed: phase previously marked failed"
        );
    }
}
