// JDWP protocol engine
//
// Drives a live target over the Java Debug Wire Protocol:
// - Packet framing and codec
// - Command dispatch and reply correlation
// - Event requests with filters and suspend policy
// - Suspend/resume accounting and stepping

pub mod commands;
pub mod config;
pub mod connection;
pub mod dispatcher;
mod eventloop;
pub mod eventqueue;
pub mod eventrequest;
pub mod events;
pub mod protocol;
pub mod reader;
pub mod registry;
pub mod stackframe;
pub mod stepping;
pub mod suspend;
pub mod thread;
pub mod types;
pub mod vm;

mod poison;

#[cfg(test)]
mod mock;

pub use config::EngineConfig;
pub use connection::{Connection, EngineContext};
pub use dispatcher::DispatchError;
pub use eventqueue::QueueError;
pub use events::{Event, EventKind, EventSet};
pub use protocol::{CodecError, Command, JdwpError, JdwpResult, Packet};
pub use registry::{Filter, RegistryError, RequestId, RequestKind};
pub use suspend::{SuspendError, SuspendTarget};
pub use types::{Location, StepDepth, StepSize, SuspendPolicy};
