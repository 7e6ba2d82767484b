// StackFrame command implementations
//
// Reading and writing local variable slots of a stopped thread's frame

use crate::commands::{command_sets, stack_frame_commands};
use crate::connection::Connection;
use crate::protocol::{Command, CodecError, JdwpResult};
use crate::reader::read_count;
use crate::thread::thread_error;
use crate::types::{read_tagged_value, FrameId, ThreadId, Value};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Variable slot information for GetValues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSlot {
    pub slot: i32,
    pub sig_byte: u8,
}

fn frame_header(thread: ThreadId, frame: FrameId, slots: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(20 + slots * 9);
    data.put_u64(thread);
    data.put_u64(frame);
    data.put_i32(slots as i32);
    data
}

impl Connection {
    /// Get values for variable slots in a frame (StackFrame.GetValues command)
    pub async fn get_frame_values(
        &self,
        thread: ThreadId,
        frame: FrameId,
        slots: &[VariableSlot],
    ) -> JdwpResult<Vec<Value>> {
        self.ctx.threads.require_stopped(thread)?;

        let mut data = frame_header(thread, frame, slots.len());
        for slot in slots {
            data.put_i32(slot.slot);
            data.put_u8(slot.sig_byte);
        }

        let command =
            Command::new(command_sets::STACK_FRAME, stack_frame_commands::GET_VALUES).with_data(data);
        let reply = self
            .ctx
            .dispatcher
            .call(command)
            .await
            .map_err(|e| thread_error(thread, e))?;
        let mut data = reply.as_slice();

        let count = read_count(&mut data)?;
        if count != slots.len() {
            return Err(CodecError::Malformed(format!(
                "GetValues returned {} values for {} slots",
                count,
                slots.len()
            ))
            .into());
        }

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(read_tagged_value(&mut data)?);
        }
        Ok(values)
    }

    /// Write variable slots in a frame (StackFrame.SetValues command)
    pub async fn set_frame_values(
        &self,
        thread: ThreadId,
        frame: FrameId,
        values: &[(i32, Value)],
    ) -> JdwpResult<()> {
        self.ctx.threads.require_stopped(thread)?;

        let mut data = frame_header(thread, frame, values.len());
        for (slot, value) in values {
            data.put_i32(*slot);
            value.write_tagged(&mut data);
        }

        let command =
            Command::new(command_sets::STACK_FRAME, stack_frame_commands::SET_VALUES).with_data(data);
        self.ctx
            .dispatcher
            .call(command)
            .await
            .map_err(|e| thread_error(thread, e))?;
        Ok(())
    }
}
