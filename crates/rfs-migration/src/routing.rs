use crate::error::PhaseFailure;
use chrono::{DateTime, Utc};
use rfs_core::{PhaseEntry, PhaseStatus};

/// Where the step graph goes after reading a phase entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryRoute {
    Create,
    Wait,
    AcquireLease,
    Resume,
    Completed,
    Failed(PhaseFailure),
}

pub fn route_phase_entry(
    entry: Option<&PhaseEntry>,
    now: DateTime<Utc>,
    max_attempts: u32,
) -> EntryRoute {
    let Some(entry) = entry else {
        return EntryRoute::Create;
    };
    match entry.status {
        PhaseStatus::Completed => EntryRoute::Completed,
        PhaseStatus::Failed => EntryRoute::Failed(PhaseFailure::MarkedFailed),
        PhaseStatus::InProgress => EntryRoute::Resume,
        PhaseStatus::Setup if !entry.is_lease_expired(now) => EntryRoute::Wait,
        PhaseStatus::Setup if entry.num_attempts >= max_attempts => {
            EntryRoute::Failed(PhaseFailure::AttemptsExhausted {
                attempts: entry.num_attempts,
                max_attempts,
            })
        }
        PhaseStatus::Setup => EntryRoute::AcquireLease,
    }
}
