// Suspend/resume accounting
//
// The target keeps a suspend count per thread plus the effect of
// VirtualMachine.Suspend on every thread. The tracker mirrors both so the
// engine can answer "is this thread stopped" without a round-trip.

use crate::poison::lock;
use crate::registry::RequestId;
use crate::stepping::{StepCandidate, StepPhase, StepState};
use crate::types::{SuspendPolicy, ThreadId};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SuspendTarget {
    Thread(ThreadId),
    All,
}

impl fmt::Display for SuspendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspendTarget::Thread(t) => write!(f, "thread {:#x}", t),
            SuspendTarget::All => write!(f, "all threads"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SuspendError {
    #[error("Cannot resume {0}: already running")]
    AlreadyRunning(SuspendTarget),

    #[error("Thread {0:#x} is not suspended")]
    NotSuspended(ThreadId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSuspendState {
    pub thread: ThreadId,
    pub suspend_count: u32,
    pub step: Option<StepState>,
}

impl ThreadSuspendState {
    fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            suspend_count: 0,
            step: None,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    threads: HashMap<ThreadId, ThreadSuspendState>,
    all: u32,
}

impl TrackerState {
    fn entry(&mut self, thread: ThreadId) -> &mut ThreadSuspendState {
        self.threads
            .entry(thread)
            .or_insert_with(|| ThreadSuspendState::new(thread))
    }
}

#[derive(Debug, Default)]
pub struct SuspendTracker {
    state: Mutex<TrackerState>,
}

impl SuspendTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, thread: ThreadId) {
        lock(&self.state, "suspend.register").entry(thread);
    }

    /// Drop a thread on ThreadDeath. Returns its last state.
    pub fn forget(&self, thread: ThreadId) -> Option<ThreadSuspendState> {
        let removed = lock(&self.state, "suspend.forget").threads.remove(&thread);
        if let Some(state) = &removed {
            debug!(
                "Forgot thread {:#x} (suspend_count={})",
                thread, state.suspend_count
            );
        }
        removed
    }

    pub fn is_registered(&self, thread: ThreadId) -> bool {
        lock(&self.state, "suspend.is_registered")
            .threads
            .contains_key(&thread)
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        let mut threads: Vec<_> = lock(&self.state, "suspend.threads")
            .threads
            .keys()
            .copied()
            .collect();
        threads.sort_unstable();
        threads
    }

    pub fn thread_state(&self, thread: ThreadId) -> Option<ThreadSuspendState> {
        lock(&self.state, "suspend.thread_state")
            .threads
            .get(&thread)
            .cloned()
    }

    pub fn suspend(&self, target: SuspendTarget) {
        let mut state = lock(&self.state, "suspend.suspend");
        match target {
            SuspendTarget::Thread(t) => state.entry(t).suspend_count += 1,
            SuspendTarget::All => state.all += 1,
        }
    }

    /// Decrement the count for `target`. A count already at zero is left
    /// unchanged.
    pub fn resume(&self, target: SuspendTarget) -> Result<(), SuspendError> {
        let mut state = lock(&self.state, "suspend.resume");
        let count = match target {
            SuspendTarget::Thread(t) => match state.threads.get_mut(&t) {
                Some(thread) => &mut thread.suspend_count,
                None => return Err(SuspendError::AlreadyRunning(target)),
            },
            SuspendTarget::All => &mut state.all,
        };

        if *count == 0 {
            return Err(SuspendError::AlreadyRunning(target));
        }
        *count -= 1;
        Ok(())
    }

    pub fn suspend_count(&self, target: SuspendTarget) -> u32 {
        let state = lock(&self.state, "suspend.suspend_count");
        match target {
            SuspendTarget::Thread(t) => state.threads.get(&t).map_or(0, |s| s.suspend_count),
            SuspendTarget::All => state.all,
        }
    }

    /// A thread is stopped if its own count or the all-threads count is
    /// non-zero
    pub fn is_stopped(&self, thread: ThreadId) -> bool {
        let state = lock(&self.state, "suspend.is_stopped");
        state.all > 0 || state.threads.get(&thread).is_some_and(|s| s.suspend_count > 0)
    }

    pub fn require_stopped(&self, thread: ThreadId) -> Result<(), SuspendError> {
        if self.is_stopped(thread) {
            Ok(())
        } else {
            Err(SuspendError::NotSuspended(thread))
        }
    }

    /// Record what an EventSet's suspend policy did on the target
    pub fn apply_policy(&self, policy: SuspendPolicy, thread: Option<ThreadId>) {
        match (policy, thread) {
            (SuspendPolicy::None, _) => {}
            (SuspendPolicy::EventThread, Some(t)) => self.suspend(SuspendTarget::Thread(t)),
            (SuspendPolicy::EventThread, None) => {
                warn!("EVENT_THREAD suspend policy on an event set without a thread")
            }
            (SuspendPolicy::All, _) => self.suspend(SuspendTarget::All),
        }
    }

    /// Adopt the target's suspend count for `thread`
    pub fn set_suspend_count(&self, thread: ThreadId, count: u32) {
        let mut state = lock(&self.state, "suspend.set_suspend_count");
        let entry = state.entry(thread);
        if entry.suspend_count != count {
            debug!(
                "Thread {:#x} suspend count {} -> {} (from target)",
                thread, entry.suspend_count, count
            );
        }
        entry.suspend_count = count;
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state, "suspend.clear");
        state.threads.clear();
        state.all = 0;
    }

    /// Arm a step for `thread`. Fails (returning the armed state) if one is
    /// already in flight.
    pub fn arm_step(&self, thread: ThreadId, step: StepState) -> Result<(), StepState> {
        let mut state = lock(&self.state, "suspend.arm_step");
        let entry = state.entry(thread);
        if let Some(existing) = &entry.step {
            return Err(existing.clone());
        }
        entry.step = Some(step);
        Ok(())
    }

    /// Remove whatever step `request` armed
    pub fn disarm_request(&self, request: RequestId) -> Option<ThreadId> {
        let mut state = lock(&self.state, "suspend.disarm_request");
        state.threads.values_mut().find_map(|t| {
            if t.step.as_ref().is_some_and(|s| s.request == request) {
                t.step = None;
                Some(t.thread)
            } else {
                None
            }
        })
    }

    pub fn is_stepping(&self, thread: ThreadId) -> bool {
        lock(&self.state, "suspend.is_stepping")
            .threads
            .get(&thread)
            .is_some_and(|t| t.step.is_some())
    }

    pub fn step_phase(&self, thread: ThreadId) -> StepPhase {
        lock(&self.state, "suspend.step_phase")
            .threads
            .get(&thread)
            .and_then(|t| t.step.clone())
            .map_or(StepPhase::Idle, StepPhase::Armed)
    }

    /// Run a candidate through the thread's step. A completed step is
    /// removed; anything else stays armed.
    pub fn settle_step(&self, thread: ThreadId, candidate: &StepCandidate) -> StepPhase {
        let mut state = lock(&self.state, "suspend.settle_step");
        let Some(entry) = state.threads.get_mut(&thread) else {
            return StepPhase::Idle;
        };
        let Some(step) = entry.step.take() else {
            return StepPhase::Idle;
        };

        let phase = StepPhase::Armed(step).advance(candidate);
        if let StepPhase::Armed(still_armed) = &phase {
            entry.step = Some(still_armed.clone());
        }
        phase
    }
}
