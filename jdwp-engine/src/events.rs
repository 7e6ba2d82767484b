// JDWP event handling
//
// Events are sent from the target to notify about breakpoints, steps, etc.
// One composite packet carries one EventSet.

use crate::commands::event_kinds;
use crate::protocol::CodecError;
use crate::reader::{read_i32, read_location, read_string, read_u32, read_u64, read_u8};
use crate::types::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Composite event packet (can contain multiple events)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSet {
    pub suspend_policy: SuspendPolicy,
    pub events: Vec<Event>,
}

impl EventSet {
    /// Thread the set's suspend policy applies to under EVENT_THREAD
    pub fn event_thread(&self) -> Option<ThreadId> {
        self.events.iter().find_map(Event::thread)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Single event within an event set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: u8,
    pub request_id: i32,
    pub details: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    VMStart {
        thread: ThreadId,
    },
    VMDeath,
    ThreadStart {
        thread: ThreadId,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    ClassPrepare {
        thread: ThreadId,
        ref_type_tag: u8,
        ref_type: ReferenceTypeId,
        signature: String,
        status: i32,
    },
    ClassUnload {
        signature: String,
    },
    Breakpoint {
        thread: ThreadId,
        location: Location,
    },
    Step {
        thread: ThreadId,
        location: Location,
    },
    Exception {
        thread: ThreadId,
        location: Location,
        exception: ObjectId,
        catch_location: Option<Location>,
    },
    FieldAccess {
        thread: ThreadId,
        location: Location,
        ref_type: ReferenceTypeId,
        field: FieldId,
        object: Option<ObjectId>,
    },
    FieldModification {
        thread: ThreadId,
        location: Location,
        ref_type: ReferenceTypeId,
        field: FieldId,
        object: Option<ObjectId>,
        value_to_be: Value,
    },
    MethodEntry {
        thread: ThreadId,
        location: Location,
    },
    MethodExit {
        thread: ThreadId,
        location: Location,
    },
}

impl Event {
    pub fn thread(&self) -> Option<ThreadId> {
        match &self.details {
            EventKind::VMStart { thread }
            | EventKind::ThreadStart { thread }
            | EventKind::ThreadDeath { thread }
            | EventKind::ClassPrepare { thread, .. }
            | EventKind::Breakpoint { thread, .. }
            | EventKind::Step { thread, .. }
            | EventKind::Exception { thread, .. }
            | EventKind::FieldAccess { thread, .. }
            | EventKind::FieldModification { thread, .. }
            | EventKind::MethodEntry { thread, .. }
            | EventKind::MethodExit { thread, .. } => Some(*thread),
            EventKind::VMDeath | EventKind::ClassUnload { .. } => None,
        }
    }

    pub fn location(&self) -> Option<Location> {
        match &self.details {
            EventKind::Breakpoint { location, .. }
            | EventKind::Step { location, .. }
            | EventKind::Exception { location, .. }
            | EventKind::FieldAccess { location, .. }
            | EventKind::FieldModification { location, .. }
            | EventKind::MethodEntry { location, .. }
            | EventKind::MethodExit { location, .. } => Some(*location),
            _ => None,
        }
    }

    /// Type signature carried by the event itself (class prepare/unload)
    pub fn signature(&self) -> Option<&str> {
        match &self.details {
            EventKind::ClassPrepare { signature, .. } | EventKind::ClassUnload { signature } => {
                Some(signature)
            }
            _ => None,
        }
    }

    /// Request id 0 marks events the target generates without a request
    pub fn is_automatic(&self) -> bool {
        self.request_id == 0
    }
}

/// Parse an event packet from JDWP
pub fn parse_event_packet(data: &[u8]) -> Result<EventSet, CodecError> {
    let mut buf = data;

    let suspend_policy = SuspendPolicy::try_from(read_u8(&mut buf)?)?;
    let event_count = read_u32(&mut buf)?;

    let mut events = Vec::with_capacity(event_count.min(64) as usize);

    for _ in 0..event_count {
        let kind = read_u8(&mut buf)?;
        let request_id = read_i32(&mut buf)?;

        let details = match kind {
            event_kinds::BREAKPOINT => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventKind::Breakpoint { thread, location }
            }
            event_kinds::SINGLE_STEP => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventKind::Step { thread, location }
            }
            event_kinds::METHOD_ENTRY => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventKind::MethodEntry { thread, location }
            }
            event_kinds::METHOD_EXIT => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                EventKind::MethodExit { thread, location }
            }
            event_kinds::EXCEPTION => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                let _tag = read_u8(&mut buf)?;
                let exception = read_u64(&mut buf)?;
                let catch = read_location(&mut buf)?;
                EventKind::Exception {
                    thread,
                    location,
                    exception,
                    catch_location: (!catch.is_null()).then_some(catch),
                }
            }
            event_kinds::FIELD_ACCESS | event_kinds::FIELD_MODIFICATION => {
                let thread = read_u64(&mut buf)?;
                let location = read_location(&mut buf)?;
                let _ref_type_tag = read_u8(&mut buf)?;
                let ref_type = read_u64(&mut buf)?;
                let field = read_u64(&mut buf)?;
                let _tag = read_u8(&mut buf)?;
                let object = Some(read_u64(&mut buf)?).filter(|id| *id != 0);

                if kind == event_kinds::FIELD_ACCESS {
                    EventKind::FieldAccess {
                        thread,
                        location,
                        ref_type,
                        field,
                        object,
                    }
                } else {
                    let value_to_be = read_tagged_value(&mut buf)?;
                    EventKind::FieldModification {
                        thread,
                        location,
                        ref_type,
                        field,
                        object,
                        value_to_be,
                    }
                }
            }
            event_kinds::CLASS_PREPARE => {
                let thread = read_u64(&mut buf)?;
                let ref_type_tag = read_u8(&mut buf)?;
                let ref_type = read_u64(&mut buf)?;
                let signature = read_string(&mut buf)?;
                let status = read_i32(&mut buf)?;
                EventKind::ClassPrepare {
                    thread,
                    ref_type_tag,
                    ref_type,
                    signature,
                    status,
                }
            }
            event_kinds::CLASS_UNLOAD => {
                let signature = read_string(&mut buf)?;
                EventKind::ClassUnload { signature }
            }
            event_kinds::VM_START => {
                let thread = read_u64(&mut buf)?;
                EventKind::VMStart { thread }
            }
            event_kinds::VM_DEATH => EventKind::VMDeath,
            event_kinds::THREAD_START => {
                let thread = read_u64(&mut buf)?;
                EventKind::ThreadStart { thread }
            }
            event_kinds::THREAD_DEATH => {
                let thread = read_u64(&mut buf)?;
                EventKind::ThreadDeath { thread }
            }
            _ => {
                // Layout of the remaining bytes is unknown
                warn!(
                    "Unsupported event kind {}; skipping rest of composite packet ({} events kept)",
                    kind,
                    events.len()
                );
                break;
            }
        };

        events.push(Event {
            kind,
            request_id,
            details,
        });
    }

    Ok(EventSet {
        suspend_policy,
        events,
    })
}
