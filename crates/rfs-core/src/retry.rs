use crate::clock::Clock;
use crate::coordinator::{AssignOneResult, CoordinationError};
use rand::Rng;
use std::fmt::Display;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

/// Index/schema creation at startup.
pub const SETUP_RETRY: RetryPolicy = RetryPolicy {
    base_delay: Duration::from_millis(10),
    max_attempts: 6,
};

/// Refresh barrier before pending-count queries and after completions.
pub const REFRESH_RETRY: RetryPolicy = RetryPolicy {
    base_delay: Duration::from_millis(10),
    max_attempts: 6,
};

/// Claim-any loop that keeps matching documents it cannot update. The last wait before
/// giving up is roughly 40 seconds.
pub const DRIFT_RETRY: RetryPolicy = RetryPolicy {
    base_delay: Duration::from_millis(10),
    max_attempts: 13,
};

pub const MAX_VERSION_CONFLICT_RETRIES: u32 = 64;

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(30))
    }

    /// Uniform in `[delay/2, delay]` so concurrent claimants desynchronize.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let floor = delay / 2;
        let spread = delay.saturating_sub(floor).as_millis() as u64;
        floor + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Runs `operation` until it succeeds, sleeping a doubling delay between failures, and
/// escalates to [`CoordinationError::RetriesExhausted`] once the ceiling is reached.
pub fn with_bounded_retries<T, E, F>(
    clock: &dyn Clock,
    policy: RetryPolicy,
    operation: &'static str,
    mut f: F,
) -> Result<T, CoordinationError>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(CoordinationError::RetriesExhausted {
                        operation,
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
                let delay = policy.delay(attempt - 1);
                warn!(
                    event = "coordination_retry",
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err
                );
                clock.sleep(delay);
            }
        }
    }
}

/// Drives a single claim-any round until it assigns something or finds nothing
/// eligible. Version conflicts retry immediately; rounds that matched a document but
/// could not update it are taken as clock drift and retried with jittered backoff.
pub fn assign_with_drift_retries<T, F>(
    clock: &dyn Clock,
    mut assign_one: F,
) -> Result<Option<T>, CoordinationError>
where
    F: FnMut() -> Result<AssignOneResult<T>, CoordinationError>,
{
    let mut drift_retries = 0;
    let mut conflicts = 0;
    loop {
        match assign_one()? {
            AssignOneResult::Assigned(value) => return Ok(Some(value)),
            AssignOneResult::NothingToAcquire => return Ok(None),
            AssignOneResult::VersionConflict => {
                conflicts += 1;
                if conflicts >= MAX_VERSION_CONFLICT_RETRIES {
                    return Err(CoordinationError::RetriesExhausted {
                        operation: "acquire_next_work_item",
                        attempts: conflicts,
                        last_error: "version conflict".to_string(),
                    });
                }
            }
            AssignOneResult::PotentialClockDrift => {
                if drift_retries >= DRIFT_RETRY.max_attempts {
                    return Err(CoordinationError::PotentialClockDrift {
                        attempts: drift_retries,
                    });
                }
                let delay = DRIFT_RETRY.jittered_delay(drift_retries);
                warn!(
                    event = "claim_noop_despite_match",
                    attempt = drift_retries,
                    delay_ms = delay.as_millis() as u64
                );
                clock.sleep(delay);
                drift_retries += 1;
            }
        }
    }
}
