use crate::context::WorkerState;
use crate::error::{MigrationError, PhaseFailure};
use crate::routing::{route_phase_entry, EntryRoute};
use rand::Rng;
use rfs_core::{EntryStore, Phase, PhaseEntry, PhaseStatus};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseExit {
    Success,
    Failed(PhaseFailure),
}

#[derive(Debug)]
pub enum Transition<S> {
    Next(S),
    Exit(PhaseExit),
}

/// One node of a phase's step graph. `run` performs the side effect and records
/// what it observed; `next_step` decides where to go from that record alone.
pub trait Step: Sized {
    fn name(&self) -> &'static str;

    fn run(&mut self, state: &mut WorkerState<'_>) -> Result<(), MigrationError>;

    fn next_step(self, state: &WorkerState<'_>) -> Transition<Self>;
}

/// Runs steps until one yields a terminal exit. Errors from `run` propagate
/// untouched; `state.step` still names the step that raised them.
pub fn drive<S: Step>(first: S, state: &mut WorkerState<'_>) -> Result<PhaseExit, MigrationError> {
    let mut step = first;
    loop {
        state.step = step.name();
        debug!(
            event = "step_entered",
            phase = ?state.phase,
            step = state.step
        );
        step.run(state)?;
        match step.next_step(state) {
            Transition::Next(next) => step = next,
            Transition::Exit(exit) => return Ok(exit),
        }
    }
}

/// Phase-specific work performed while the phase entry is leased or in progress.
pub trait PhaseWork: Sized + fmt::Debug {
    const PHASE: Phase;

    /// First work step once this worker created or re-leased the entry.
    fn start() -> Self;

    /// Where a worker joins a phase already marked in progress.
    fn resume() -> Self;

    fn name(&self) -> &'static str;

    fn run(&mut self, state: &mut WorkerState<'_>) -> Result<(), MigrationError>;

    fn next_step(self, state: &WorkerState<'_>) -> PhaseStep<Self>;
}

/// The step graph shared by every phase, with the phase's own work steps embedded.
#[derive(Debug)]
pub enum PhaseStep<W> {
    EnterPhase,
    GetEntry,
    CreateEntry { created: bool },
    AcquireLease { acquired: bool },
    RandomWait,
    Work(W),
    ExitPhaseSuccess,
    ExitPhaseFailed(PhaseFailure),
}

impl<W: PhaseWork> PhaseStep<W> {
    pub fn create_entry() -> Self {
        PhaseStep::CreateEntry { created: false }
    }

    pub fn acquire_lease() -> Self {
        PhaseStep::AcquireLease { acquired: false }
    }
}

/// Uniform in `[max/2, max]`.
pub(crate) fn random_wait(max: Duration) -> Duration {
    let floor = max / 2;
    let spread = max.saturating_sub(floor).as_millis() as u64;
    floor + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Moves the phase entry from whatever is stored now to `status`, unless it already
/// settled. Losing the swap is fine: someone else settled it first.
pub(crate) fn settle_phase_entry(
    state: &mut WorkerState<'_>,
    phase: Phase,
    status: PhaseStatus,
) -> Result<(), MigrationError> {
    let Some(current) = state.store.get_phase_entry(phase)? else {
        return Ok(());
    };
    if current.status.is_terminal() {
        state.phase_entry = Some(current);
        return Ok(());
    }
    let updated = current.with_status(status);
    match state.store.update_phase_entry(&updated, &current)? {
        Some(stored) => state.phase_entry = Some(stored),
        None => debug!(event = "phase_settle_dropped", phase = %phase, status = %status),
    }
    Ok(())
}

/// Marks a leased `SETUP` entry as in progress. Returns false when the entry changed
/// underneath, in which case the caller re-reads it.
pub(crate) fn mark_in_progress(state: &mut WorkerState<'_>) -> Result<bool, MigrationError> {
    let Some(current) = state.phase_entry.clone() else {
        return Ok(false);
    };
    if current.status == PhaseStatus::InProgress {
        return Ok(true);
    }
    let updated = current.with_status(PhaseStatus::InProgress);
    match state.store.update_phase_entry(&updated, &current)? {
        Some(stored) => {
            state.phase_entry = Some(stored);
            Ok(true)
        }
        None => Ok(false),
    }
}

impl<W: PhaseWork> Step for PhaseStep<W> {
    fn name(&self) -> &'static str {
        match self {
            PhaseStep::EnterPhase => "EnterPhase",
            PhaseStep::GetEntry => "GetEntry",
            PhaseStep::CreateEntry { .. } => "CreateEntry",
            PhaseStep::AcquireLease { .. } => "AcquireLease",
            PhaseStep::RandomWait => "RandomWait",
            PhaseStep::Work(work) => work.name(),
            PhaseStep::ExitPhaseSuccess => "ExitPhaseSuccess",
            PhaseStep::ExitPhaseFailed(_) => "ExitPhaseFailed",
        }
    }

    fn run(&mut self, state: &mut WorkerState<'_>) -> Result<(), MigrationError> {
        match self {
            PhaseStep::EnterPhase => {
                state.phase = Some(W::PHASE);
                state.phase_entry = None;
                info!(event = "phase_entered", phase = %W::PHASE);
            }
            PhaseStep::GetEntry => {
                state.phase_entry = state.store.get_phase_entry(W::PHASE)?;
            }
            PhaseStep::CreateEntry { created } => {
                let entry = PhaseEntry::initial(W::PHASE, state.now(), state.settings.phase_lease);
                let stored = state.store.create_phase_entry(&entry)?;
                *created = stored.is_some();
                if stored.is_some() {
                    state.phase_entry = stored;
                }
            }
            PhaseStep::AcquireLease { acquired } => {
                *acquired = false;
                if let Some(current) = state.phase_entry.clone() {
                    let updated =
                        current.with_acquired_lease(state.now(), state.settings.phase_lease);
                    if let Some(stored) = state.store.update_phase_entry(&updated, &current)? {
                        info!(
                            event = "phase_lease_acquired",
                            phase = %W::PHASE,
                            num_attempts = stored.num_attempts
                        );
                        state.phase_entry = Some(stored);
                        *acquired = true;
                    }
                }
            }
            PhaseStep::RandomWait => {
                let wait = random_wait(state.settings.random_wait);
                debug!(
                    event = "phase_random_wait",
                    phase = %W::PHASE,
                    wait_ms = wait.as_millis() as u64
                );
                state.clock.sleep(wait);
            }
            PhaseStep::Work(work) => work.run(state)?,
            PhaseStep::ExitPhaseSuccess => {
                settle_phase_entry(state, W::PHASE, PhaseStatus::Completed)?;
                info!(event = "phase_exit", phase = %W::PHASE, outcome = "success");
            }
            PhaseStep::ExitPhaseFailed(failure) => {
                if let Err(err) = settle_phase_entry(state, W::PHASE, PhaseStatus::Failed) {
                    warn!(event = "phase_fail_writeback_failed", phase = %W::PHASE, error = %err);
                }
                warn!(
                    event = "phase_exit",
                    phase = %W::PHASE,
                    outcome = "failed",
                    reason = %failure
                );
            }
        }
        Ok(())
    }

    fn next_step(self, state: &WorkerState<'_>) -> Transition<Self> {
        let next = match self {
            PhaseStep::EnterPhase => PhaseStep::GetEntry,
            PhaseStep::GetEntry => match route_phase_entry(
                state.phase_entry.as_ref(),
                state.now(),
                state.settings.phase_max_attempts,
            ) {
                EntryRoute::Create => PhaseStep::create_entry(),
                EntryRoute::Wait => PhaseStep::RandomWait,
                EntryRoute::AcquireLease => PhaseStep::acquire_lease(),
                EntryRoute::Resume => PhaseStep::Work(W::resume()),
                EntryRoute::Completed => PhaseStep::ExitPhaseSuccess,
                EntryRoute::Failed(failure) => PhaseStep::ExitPhaseFailed(failure),
            },
            PhaseStep::CreateEntry { created: true } => PhaseStep::Work(W::start()),
            PhaseStep::CreateEntry { created: false } => PhaseStep::GetEntry,
            PhaseStep::AcquireLease { acquired: true } => PhaseStep::Work(W::start()),
            PhaseStep::AcquireLease { acquired: false } => PhaseStep::RandomWait,
            PhaseStep::RandomWait => PhaseStep::GetEntry,
            PhaseStep::Work(work) => work.next_step(state),
            PhaseStep::ExitPhaseSuccess => return Transition::Exit(PhaseExit::Success),
            PhaseStep::ExitPhaseFailed(failure) => {
                return Transition::Exit(PhaseExit::Failed(failure))
            }
        };
        Transition::Next(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_wait_stays_within_upper_half() {
        let max = Duration::from_secs(5);
        for _ in 0..200 {
            let wait = random_wait(max);
            assert!(wait >= Duration::from_millis(2500), "{wait:?}");
            assert!(wait <= max, "{wait:?}");
        }
        assert_eq!(random_wait(Duration::ZERO), Duration::ZERO);
    }
}
