//! Per-process timer that trips a cancellation token once a held lease runs out.
//!
//! Cancellation is cooperative: firing cancels the token registered for the work item
//! and invokes the configured callback, and the guarded work is expected to observe the
//! token before producing its next externally visible effect.

use chrono::{DateTime, Utc};
use rfs_core::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on how long the timer thread sleeps before re-reading the clock.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type ExpirationCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Registration {
    expiry: DateTime<Utc>,
    token: CancellationToken,
}

#[derive(Default)]
struct State {
    registrations: HashMap<String, Registration>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
    on_expired: Option<ExpirationCallback>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct LeaseWatchdog {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    timer: Option<JoinHandle<()>>,
}

impl LeaseWatchdog {
    /// Starts the dedicated timer thread.
    pub fn start(clock: Arc<dyn Clock>, on_expired: Option<ExpirationCallback>) -> Self {
        let mut watchdog = Self::manual(clock, on_expired);
        let shared = watchdog.shared.clone();
        let clock = watchdog.clock.clone();
        watchdog.timer = Some(std::thread::spawn(move || run_timer(&shared, clock.as_ref())));
        watchdog
    }

    /// No timer thread; expirations fire only through [`LeaseWatchdog::fire_expired`].
    pub fn manual(clock: Arc<dyn Clock>, on_expired: Option<ExpirationCallback>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                wakeup: Condvar::new(),
                on_expired,
            }),
            clock,
            timer: None,
        }
    }

    /// Schedules a one-shot expiration. Re-registering an id replaces its deadline
    /// and token. Returns the token that is cancelled when the deadline passes.
    pub fn register_expiration(
        &self,
        work_item_id: &str,
        expiry: DateTime<Utc>,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        self.shared.lock().registrations.insert(
            work_item_id.to_string(),
            Registration {
                expiry,
                token: token.clone(),
            },
        );
        self.shared.wakeup.notify_all();
        debug!(event = "watchdog_registered", work_item_id, expiry = %expiry);
        token
    }

    /// Drops the registration so a stale timer cannot fire after success.
    pub fn mark_work_as_completed(&self, work_item_id: &str) -> bool {
        let removed = self
            .shared
            .lock()
            .registrations
            .remove(work_item_id)
            .is_some();
        if removed {
            self.shared.wakeup.notify_all();
        }
        removed
    }

    pub fn is_registered(&self, work_item_id: &str) -> bool {
        self.shared.lock().registrations.contains_key(work_item_id)
    }

    /// Fires every registration whose deadline is at or before the clock's now.
    pub fn fire_expired(&self) -> Vec<String> {
        fire_due(&self.shared, self.clock.now())
    }
}

impl Drop for LeaseWatchdog {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        if let Some(timer) = self.timer.take() {
            if timer.join().is_err() {
                warn!(event = "watchdog_timer_panicked");
            }
        }
    }
}

fn fire_due(shared: &Shared, now: DateTime<Utc>) -> Vec<String> {
    let due: Vec<(String, CancellationToken)> = {
        let mut state = shared.lock();
        let ids: Vec<String> = state
            .registrations
            .iter()
            .filter(|(_, registration)| registration.expiry <= now)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| {
                state
                    .registrations
                    .remove(&id)
                    .map(|registration| (id, registration.token))
            })
            .collect()
    };

    for (id, token) in &due {
        warn!(event = "lease_watchdog_fired", work_item_id = %id, now = %now);
        token.cancel();
        if let Some(callback) = &shared.on_expired {
            callback(id);
        }
    }
    due.into_iter().map(|(id, _)| id).collect()
}

fn run_timer(shared: &Shared, clock: &dyn Clock) {
    loop {
        let wait = {
            let state = shared.lock();
            if state.shutdown {
                return;
            }
            let now = clock.now();
            state
                .registrations
                .values()
                .map(|registration| {
                    (registration.expiry - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                })
                .min()
                .unwrap_or(POLL_INTERVAL)
                .min(POLL_INTERVAL)
        };

        if !wait.is_zero() {
            let state = shared.lock();
            if state.shutdown {
                return;
            }
            let _ = shared
                .wakeup
                .wait_timeout(state, wait)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        fire_due(shared, clock.now());
    }
}
