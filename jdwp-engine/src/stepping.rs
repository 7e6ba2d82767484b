// Single/multi-step state machine
//
// A step request is armed with the frame it started from. The target's
// SingleStep events are candidates; only those that satisfy the requested
// depth against the originating frame complete the step.

use crate::commands::event_kinds;
use crate::connection::Connection;
use crate::events::EventSet;
use crate::registry::RequestId;
use crate::types::{FrameId, Location, StepDepth, StepSize, ThreadId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// In-flight step for one thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub request: RequestId,
    pub granularity: StepSize,
    pub depth: StepDepth,
    pub originating_frame_id: FrameId,
    pub originating_stack_depth: u32,
    pub originating_location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepPhase {
    Idle,
    Armed(StepState),
    Completed(StepState),
}

/// Where a SingleStep event landed. `stack_depth` is `None` when the
/// frame count could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCandidate {
    pub location: Location,
    pub stack_depth: Option<u32>,
}

impl StepState {
    pub fn qualifies(&self, candidate: &StepCandidate) -> bool {
        let Some(depth) = candidate.stack_depth else {
            return true;
        };

        let moved = candidate.location != self.originating_location
            || depth != self.originating_stack_depth;

        match self.depth {
            StepDepth::Into => moved,
            StepDepth::Over => moved && depth <= self.originating_stack_depth,
            StepDepth::Out => depth < self.originating_stack_depth,
        }
    }
}

impl StepPhase {
    /// Feed a candidate to an armed step. Non-qualifying candidates leave
    /// the phase armed.
    pub fn advance(self, candidate: &StepCandidate) -> StepPhase {
        match self {
            StepPhase::Armed(state) if state.qualifies(candidate) => StepPhase::Completed(state),
            other => other,
        }
    }
}

impl Connection {
    /// Settle SingleStep candidates in `set` against armed steps. Returns
    /// `None` if every event in the set was swallowed.
    pub(crate) async fn settle_steps(&self, set: EventSet) -> Option<EventSet> {
        let event_thread = set.event_thread();
        let EventSet {
            suspend_policy,
            events,
        } = set;

        let had_events = !events.is_empty();
        let mut kept = Vec::with_capacity(events.len());

        for event in events {
            let (Some(thread), Some(location)) = (event.thread(), event.location()) else {
                kept.push(event);
                continue;
            };
            if event.kind != event_kinds::SINGLE_STEP || !self.ctx.threads.is_stepping(thread) {
                kept.push(event);
                continue;
            }

            let candidate = StepCandidate {
                location,
                stack_depth: self.candidate_depth(thread).await,
            };

            match self.ctx.threads.settle_step(thread, &candidate) {
                StepPhase::Completed(state) => {
                    debug!(
                        "Step completed on thread {:#x} at {:?} (request {})",
                        thread, location, state.request
                    );
                    if let Err(e) = self.disable_request(state.request).await {
                        warn!("Failed to disable completed step request {}: {}", state.request, e);
                    }
                    kept.push(event);
                }
                StepPhase::Armed(state) => {
                    debug!(
                        "Swallowed step candidate on thread {:#x} at depth {:?} (armed at {})",
                        thread, candidate.stack_depth, state.originating_stack_depth
                    );
                }
                StepPhase::Idle => kept.push(event),
            }
        }

        if had_events && kept.is_empty() {
            if let Err(e) = self.resume_policy(suspend_policy, event_thread).await {
                warn!("Failed to resume after swallowed step candidate: {}", e);
            }
            return None;
        }

        Some(EventSet {
            suspend_policy,
            events: kept,
        })
    }

    async fn candidate_depth(&self, thread: ThreadId) -> Option<u32> {
        match self.frame_count(thread).await {
            Ok(count) => Some(count),
            Err(e) => {
                debug!("Frame count for thread {:#x} unavailable: {}", thread, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{command_sets, event_request_commands, thread_commands};
    use crate::mock::{EventWriter, MockTarget};
    use crate::registry::RequestState;
    use crate::suspend::SuspendTarget;
    use crate::types::SuspendPolicy;

    fn armed(depth: StepDepth, stack_depth: u32) -> StepState {
        StepState {
            request: RequestId(1),
            granularity: StepSize::Line,
            depth,
            originating_frame_id: 0x100,
            originating_stack_depth: stack_depth,
            originating_location: Location::new(1, 2, 10),
        }
    }

    fn at(index: u64, depth: u32) -> StepCandidate {
        StepCandidate {
            location: Location::new(1, 2, index),
            stack_depth: Some(depth),
        }
    }

    #[test]
    fn over_ignores_deeper_frames() {
        let phase = StepPhase::Armed(armed(StepDepth::Over, 3));

        let phase = phase.advance(&at(0, 4));
        assert!(matches!(phase, StepPhase::Armed(_)));

        let phase = phase.advance(&at(14, 3));
        assert!(matches!(phase, StepPhase::Completed(_)));
    }

    #[test]
    fn over_completes_on_return_to_caller() {
        assert!(armed(StepDepth::Over, 3).qualifies(&at(5, 2)));
    }

    #[test]
    fn into_completes_on_any_move() {
        let state = armed(StepDepth::Into, 3);
        assert!(state.qualifies(&at(0, 4)));
        assert!(state.qualifies(&at(12, 3)));
        assert!(!state.qualifies(&at(10, 3)));
    }

    #[test]
    fn out_requires_shallower_frame() {
        let state = armed(StepDepth::Out, 3);
        assert!(!state.qualifies(&at(12, 3)));
        assert!(!state.qualifies(&at(0, 4)));
        assert!(state.qualifies(&at(40, 2)));
    }

    #[test]
    fn unknown_depth_qualifies() {
        let state = armed(StepDepth::Out, 3);
        let candidate = StepCandidate {
            location: Location::new(1, 2, 10),
            stack_depth: None,
        };
        assert!(state.qualifies(&candidate));
    }

    #[test]
    fn idle_stays_idle() {
        assert_eq!(StepPhase::Idle.advance(&at(1, 1)), StepPhase::Idle);
    }


    #[tokio::test]
    async fn swallowed_candidate_leaves_rest_of_set_in_order() {
        let (conn, mut target) = MockTarget::connect().await;
        let thread = 5;
        target
            .arm_line_step(&conn, thread, StepDepth::Over, 3, Location::new(0x10, 0x20, 8), 30)
            .await;

        let recv = tokio::spawn({
            let conn = conn.clone();
            async move { conn.recv_event().await }
        });

        let hit = Location::new(0x11, 0x21, 0);
        target
            .send_event(
                EventWriter::new(SuspendPolicy::EventThread)
                    .breakpoint(77, thread, hit)
                    .step(30, thread, hit)
                    .method_entry(78, thread, hit)
                    .finish(),
            )
            .await;
        target.reply_frame_count(4).await;

        let set = recv.await.unwrap().unwrap();
        let kinds: Vec<_> = set.events.iter().map(|e| (e.kind, e.request_id)).collect();
        assert_eq!(
            kinds,
            vec![
                (event_kinds::BREAKPOINT, 77),
                (event_kinds::METHOD_ENTRY, 78)
            ]
        );
        // the remaining events keep the thread stopped
        target.assert_quiet().await;
        assert!(matches!(conn.ctx.threads.step_phase(thread), StepPhase::Armed(_)));
        assert_eq!(conn.ctx.threads.suspend_count(SuspendTarget::Thread(thread)), 2);
    }

    #[tokio::test]
    async fn step_out_swallows_same_depth_and_completes_in_caller() {
        let (conn, mut target) = MockTarget::connect().await;
        let thread = 6;
        let id = target
            .arm_line_step(&conn, thread, StepDepth::Out, 3, Location::new(0x10, 0x20, 8), 31)
            .await;

        let recv = tokio::spawn({
            let conn = conn.clone();
            async move { conn.recv_event().await }
        });

        // next line of the same method
        target
            .send_event(
                EventWriter::new(SuspendPolicy::EventThread)
                    .step(31, thread, Location::new(0x10, 0x20, 20))
                    .finish(),
            )
            .await;
        target.reply_frame_count(3).await;
        let cmd = target
            .expect(command_sets::THREAD_REFERENCE, thread_commands::RESUME)
            .await;
        assert_eq!(cmd.data, thread.to_be_bytes());
        target.reply(cmd.id, 0, &[]).await;

        let caller = Location::new(0x30, 0x40, 2);
        target
            .send_event(
                EventWriter::new(SuspendPolicy::EventThread)
                    .step(31, thread, caller)
                    .finish(),
            )
            .await;
        target.reply_frame_count(2).await;
        let cmd = target
            .expect(command_sets::EVENT_REQUEST, event_request_commands::CLEAR)
            .await;
        target.reply(cmd.id, 0, &[]).await;

        let set = recv.await.unwrap().unwrap();
        assert_eq!(set.events.len(), 1);
        assert_eq!(set.events[0].location(), Some(caller));
        assert_eq!(conn.ctx.threads.step_phase(thread), StepPhase::Idle);
        assert_eq!(conn.request(id).unwrap().state, RequestState::Disabled);
    }

    #[tokio::test]
    async fn step_into_completes_on_callee_entry() {
        let (conn, mut target) = MockTarget::connect().await;
        let thread = 7;
        target
            .arm_line_step(&conn, thread, StepDepth::Into, 3, Location::new(0x10, 0x20, 8), 32)
            .await;

        let recv = tokio::spawn({
            let conn = conn.clone();
            async move { conn.recv_event().await }
        });

        let callee = Location::new(0x50, 0x60, 0);
        target
            .send_event(
                EventWriter::new(SuspendPolicy::EventThread)
                    .step(32, thread, callee)
                    .finish(),
            )
            .await;
        target.reply_frame_count(4).await;
        let cmd = target
            .expect(command_sets::EVENT_REQUEST, event_request_commands::CLEAR)
            .await;
        target.reply(cmd.id, 0, &[]).await;

        let set = recv.await.unwrap().unwrap();
        assert_eq!(set.events[0].location(), Some(callee));
        assert_eq!(conn.ctx.threads.step_phase(thread), StepPhase::Idle);
    }
}
