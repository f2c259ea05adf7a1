use crate::coordinator::CoordinationError;
use std::time::Duration;

/// Lease windows stop doubling past this many attempts.
pub const MAX_LEASE_EXPONENT: u32 = 30;

/// Lease window granted for a claim made when the item has already been claimed
/// `num_attempts` times: `base * 2^num_attempts`.
pub fn lease_window(base: Duration, num_attempts: u32) -> Duration {
    let factor = 1u32 << num_attempts.min(MAX_LEASE_EXPONENT);
    base.saturating_mul(factor)
}

/// Expiration (epoch seconds) a claim would write, computed from the claimant's clock.
pub fn candidate_expiration(client_epoch_seconds: i64, base: Duration, num_attempts: u32) -> i64 {
    let window = lease_window(base, num_attempts).as_secs().min(i64::MAX as u64) as i64;
    client_epoch_seconds.saturating_add(window)
}

/// Rejects a request whose timestamp disagrees with the store's by more than `tolerance`.
pub fn check_clock_drift(
    client_epoch_seconds: i64,
    server_epoch_seconds: i64,
    tolerance: Duration,
) -> Result<(), CoordinationError> {
    let drift = client_epoch_seconds.abs_diff(server_epoch_seconds);
    if drift > tolerance.as_secs() {
        return Err(CoordinationError::ClockDrift {
            client_epoch_seconds,
            server_epoch_seconds,
            tolerance_secs: tolerance.as_secs(),
        });
    }
    Ok(())
}
