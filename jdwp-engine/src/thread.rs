// ThreadReference command implementations
//
// Commands for working with threads (frames, status, suspend/resume).
// Suspend and resume keep the local tracker in step with the target.

use crate::commands::{command_sets, error_codes, thread_commands};
use crate::connection::Connection;
use crate::dispatcher::DispatchError;
use crate::protocol::{Command, CodecError, JdwpError, JdwpResult};
use crate::reader::{read_count, read_i32, read_location, read_string, read_u64};
use crate::suspend::{SuspendError, SuspendTarget};
use crate::types::{FrameId, Location, ThreadId, ThreadStatus, SUSPEND_STATUS_SUSPENDED};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Stack frame information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: FrameId,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStatusInfo {
    pub status: ThreadStatus,
    pub suspended: bool,
}

/// Map THREAD_NOT_SUSPENDED from the target onto the local error
pub(crate) fn thread_error(thread: ThreadId, err: DispatchError) -> JdwpError {
    if err.target_code() == Some(error_codes::THREAD_NOT_SUSPENDED) {
        SuspendError::NotSuspended(thread).into()
    } else {
        err.into()
    }
}

fn thread_command(command: u8, thread: ThreadId) -> Command {
    let mut data = Vec::with_capacity(8);
    data.put_u64(thread);
    Command::new(command_sets::THREAD_REFERENCE, command).with_data(data)
}

impl Connection {
    async fn thread_call(&self, command: Command, thread: ThreadId) -> JdwpResult<Vec<u8>> {
        self.ctx
            .dispatcher
            .call(command)
            .await
            .map_err(|e| thread_error(thread, e))
    }

    /// Suspend one thread (ThreadReference.Suspend)
    pub async fn suspend_thread(&self, thread: ThreadId) -> JdwpResult<()> {
        let target = SuspendTarget::Thread(thread);
        self.ctx.threads.suspend(target);

        let command = thread_command(thread_commands::SUSPEND, thread);
        if let Err(e) = self.thread_call(command, thread).await {
            if !e.is_terminal() {
                if let Err(rollback) = self.ctx.threads.resume(target) {
                    debug!("Suspend rollback for thread {:#x}: {}", thread, rollback);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Resume one thread (ThreadReference.Resume). Fails locally with
    /// `AlreadyRunning` if the tracker holds no suspend for it.
    pub async fn resume_thread(&self, thread: ThreadId) -> JdwpResult<()> {
        let target = SuspendTarget::Thread(thread);
        self.ctx.threads.resume(target)?;

        if let Err(e) = self.send_thread_resume(thread).await {
            // teardown already cleared the tracker
            if !e.is_terminal() {
                self.ctx.threads.suspend(target);
            }
            return Err(e);
        }
        Ok(())
    }

    /// ThreadReference.Resume without touching the tracker
    pub(crate) async fn send_thread_resume(&self, thread: ThreadId) -> JdwpResult<()> {
        let command = thread_command(thread_commands::RESUME, thread);
        self.thread_call(command, thread).await.map(|_| ())
    }

    /// Get thread name (ThreadReference.Name)
    pub async fn thread_name(&self, thread: ThreadId) -> JdwpResult<String> {
        let reply = self
            .thread_call(thread_command(thread_commands::NAME, thread), thread)
            .await?;
        let mut data = reply.as_slice();
        Ok(read_string(&mut data)?)
    }

    /// Get thread status (ThreadReference.Status)
    pub async fn thread_status(&self, thread: ThreadId) -> JdwpResult<ThreadStatusInfo> {
        let reply = self
            .thread_call(thread_command(thread_commands::STATUS, thread), thread)
            .await?;
        let mut data = reply.as_slice();

        let raw = read_i32(&mut data)?;
        let suspend_status = read_i32(&mut data)?;
        let status = ThreadStatus::from_i32(raw)
            .ok_or_else(|| CodecError::Malformed(format!("Unknown thread status: {}", raw)))?;

        Ok(ThreadStatusInfo {
            status,
            suspended: suspend_status & SUSPEND_STATUS_SUSPENDED != 0,
        })
    }

    /// Get stack frames for a stopped thread (ThreadReference.Frames).
    /// `length` of -1 means all remaining frames.
    pub async fn frames(&self, thread: ThreadId, start: i32, length: i32) -> JdwpResult<Vec<Frame>> {
        self.ctx.threads.require_stopped(thread)?;

        let mut command = thread_command(thread_commands::FRAMES, thread);
        command.data.put_i32(start);
        command.data.put_i32(length);

        let reply = self.thread_call(command, thread).await?;
        let mut data = reply.as_slice();

        let count = read_count(&mut data)?;
        let mut frames = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let frame_id = read_u64(&mut data)?;
            let location = read_location(&mut data)?;
            frames.push(Frame { frame_id, location });
        }

        Ok(frames)
    }

    /// Get stack depth of a stopped thread (ThreadReference.FrameCount)
    pub async fn frame_count(&self, thread: ThreadId) -> JdwpResult<u32> {
        self.ctx.threads.require_stopped(thread)?;

        let reply = self
            .thread_call(thread_command(thread_commands::FRAME_COUNT, thread), thread)
            .await?;
        let mut data = reply.as_slice();
        Ok(read_count(&mut data)? as u32)
    }

    /// Adopt the target's suspend count (ThreadReference.SuspendCount)
    pub async fn sync_suspend_count(&self, thread: ThreadId) -> JdwpResult<u32> {
        let reply = self
            .thread_call(thread_command(thread_commands::SUSPEND_COUNT, thread), thread)
            .await?;
        let mut data = reply.as_slice();
        let count = read_count(&mut data)? as u32;

        debug!("Thread {:#x} suspend count on target: {}", thread, count);
        self.ctx.threads.set_suspend_count(thread, count);
        Ok(count)
    }
}
