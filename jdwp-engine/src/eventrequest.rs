// EventRequest command implementations
//
// Set up event requests (breakpoints, steps, exceptions, etc.). Local
// bookkeeping is in registry.rs; this module does the Set/Clear round-trips.

use crate::commands::{command_sets, error_codes, event_request_commands};
use crate::connection::Connection;
use crate::protocol::{Command, JdwpResult};
use crate::reader::read_i32;
use crate::registry::{EventRequest, Filter, RegistryError, RequestId, RequestKind};
use crate::stepping::StepState;
use crate::types::{Location, StepDepth, StepSize, SuspendPolicy, ThreadId};
use bytes::BufMut;
use tracing::{debug, info, warn};

impl Connection {
    /// Register a disabled request; nothing is sent until `enable_request`
    pub fn create_request(&self, kind: RequestKind) -> RequestId {
        self.ctx.requests().create(kind)
    }

    pub fn request(&self, id: RequestId) -> Option<EventRequest> {
        self.ctx.requests().get(id).cloned()
    }

    pub fn set_suspend_policy(
        &self,
        id: RequestId,
        policy: SuspendPolicy,
    ) -> Result<(), RegistryError> {
        self.ctx.requests().set_suspend_policy(id, policy)
    }

    pub fn add_class_filter(&self, id: RequestId, pattern: Option<&str>) -> Result<(), RegistryError> {
        self.ctx.requests().add_class_filter(id, pattern)
    }

    pub fn add_class_exclusion_filter(
        &self,
        id: RequestId,
        pattern: Option<&str>,
    ) -> Result<(), RegistryError> {
        self.ctx.requests().add_class_exclusion_filter(id, pattern)
    }

    pub fn add_thread_filter(&self, id: RequestId, thread: ThreadId) -> Result<(), RegistryError> {
        self.ctx.requests().add_filter(id, Filter::ThreadOnly(thread))
    }

    pub fn add_location_filter(
        &self,
        id: RequestId,
        location: Location,
    ) -> Result<(), RegistryError> {
        self.ctx.requests().add_filter(id, Filter::LocationOnly(location))
    }

    pub fn add_count_filter(&self, id: RequestId, count: i32) -> Result<(), RegistryError> {
        self.ctx.requests().add_filter(id, Filter::Count(count))
    }

    /// Send EventRequest.Set. The request is marked enabled only once the
    /// target accepts it.
    pub async fn enable_request(&self, id: RequestId) -> JdwpResult<()> {
        let payload = self.ctx.requests().begin_enable(id)?;
        let Some(payload) = payload else {
            debug!("Request {} already enabled", id);
            return Ok(());
        };

        let step_thread = self.request(id).and_then(|r| r.kind.step_thread());
        if let Some(thread) = step_thread {
            if let Err(e) = self.arm_step(id, thread).await {
                self.ctx.requests().abort_enable(id);
                return Err(e);
            }
        }

        let command = Command::new(command_sets::EVENT_REQUEST, event_request_commands::SET)
            .with_data(payload);
        let target_id = match self.ctx.dispatcher.call(command).await {
            Ok(reply) => {
                let mut data = reply.as_slice();
                read_i32(&mut data)
            }
            Err(e) => {
                self.abort_enable(id);
                return Err(RegistryError::from_target(e).into());
            }
        };

        match target_id {
            Ok(target_id) => {
                self.ctx.requests().finish_enable(id, target_id);
                debug!("Request {} enabled as target request {}", id, target_id);
                Ok(())
            }
            Err(e) => {
                self.abort_enable(id);
                Err(e.into())
            }
        }
    }

    fn abort_enable(&self, id: RequestId) {
        self.ctx.threads.disarm_request(id);
        self.ctx.requests().abort_enable(id);
    }

    /// Record where the step starts. The thread must be stopped.
    async fn arm_step(&self, id: RequestId, thread: ThreadId) -> JdwpResult<()> {
        let Some(RequestKind::SingleStep { size, depth, .. }) = self.request(id).map(|r| r.kind)
        else {
            return Ok(());
        };

        self.ctx.threads.require_stopped(thread)?;
        let stack_depth = self.frame_count(thread).await?;
        let top = self
            .frames(thread, 0, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RegistryError::Rejected(format!("thread {:#x} has no frames", thread)))?;

        let state = StepState {
            request: id,
            granularity: size,
            depth,
            originating_frame_id: top.frame_id,
            originating_stack_depth: stack_depth,
            originating_location: top.location,
        };

        if let Err(existing) = self.ctx.threads.arm_step(thread, state) {
            return Err(RegistryError::Rejected(format!(
                "thread {:#x} already has step request {} in flight",
                thread, existing.request
            ))
            .into());
        }
        debug!(
            "Step armed on thread {:#x}: {:?} {:?} at depth {}",
            thread, size, depth, stack_depth
        );
        Ok(())
    }

    /// Send EventRequest.Clear. Events for the request that are already in
    /// flight are dropped as stale.
    pub async fn disable_request(&self, id: RequestId) -> JdwpResult<()> {
        let clear = self.ctx.requests().begin_disable(id)?;
        self.ctx.threads.disarm_request(id);
        let Some(clear) = clear else {
            return Ok(());
        };

        let mut data = Vec::with_capacity(5);
        data.put_u8(clear.event_kind);
        data.put_i32(clear.target_id);
        let command =
            Command::new(command_sets::EVENT_REQUEST, event_request_commands::CLEAR).with_data(data);

        match self.ctx.dispatcher.call(command).await {
            Ok(_) => Ok(()),
            Err(e) if e.target_code() == Some(error_codes::NOT_FOUND) => {
                debug!("Target request {} was already gone", clear.target_id);
                Ok(())
            }
            Err(e) if e.is_terminal() => Err(e.into()),
            Err(e) => {
                warn!("Target refused to clear request {}: {}", id, e);
                self.ctx.requests().abort_disable(id, clear);
                Err(RegistryError::from_target(e).into())
            }
        }
    }

    /// Disable (if needed) and forget a request
    pub async fn delete_request(&self, id: RequestId) -> JdwpResult<()> {
        self.disable_request(id).await?;
        self.ctx.requests().remove(id)?;
        Ok(())
    }

    /// Create and enable a breakpoint at `location`
    pub async fn set_breakpoint(
        &self,
        location: Location,
        policy: SuspendPolicy,
    ) -> JdwpResult<RequestId> {
        let id = self.create_request(RequestKind::Breakpoint { location });
        self.set_suspend_policy(id, policy)?;

        if let Err(e) = self.enable_request(id).await {
            if let Err(remove) = self.ctx.requests().remove(id) {
                debug!("Failed breakpoint {} not removed: {}", id, remove);
            }
            return Err(e);
        }
        info!("Breakpoint {} set at {:?}", id, location);
        Ok(id)
    }

    pub async fn clear_breakpoint(&self, id: RequestId) -> JdwpResult<()> {
        self.delete_request(id).await
    }

    /// Create a (disabled) step request for `thread`, replacing any step
    /// request it already has
    pub async fn create_step_request(
        &self,
        thread: ThreadId,
        size: StepSize,
        depth: StepDepth,
    ) -> JdwpResult<RequestId> {
        self.clear_step(thread).await?;
        Ok(self.create_request(RequestKind::SingleStep {
            thread,
            size,
            depth,
        }))
    }

    /// Delete every step request for `thread`
    pub async fn clear_step(&self, thread: ThreadId) -> JdwpResult<()> {
        let existing = self.ctx.requests().step_requests_for(thread);
        for id in existing {
            self.delete_request(id).await?;
        }
        Ok(())
    }
}
