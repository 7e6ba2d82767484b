// Event request registry
//
// Controller-side bookkeeping for EventRequest.Set subscriptions. The table
// is synchronous; the network half (Set/Clear) lives in eventrequest.rs.

use crate::commands::{event_kinds, modifier_kinds};
use crate::dispatcher::DispatchError;
use crate::events::{Event, EventKind};
use crate::types::{
    FieldId, Location, ReferenceTypeId, StepDepth, StepSize, SuspendPolicy, ThreadId,
};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Local handle for an event request. Distinct from the id the target
/// assigns on EventRequest.Set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Invalid filter argument: {0}")]
    InvalidFilterArgument(&'static str),

    #[error("Request rejected by target: {0}")]
    Rejected(String),

    #[error("Unknown event request {0}")]
    UnknownRequest(RequestId),

    #[error("Filters of request {0} are frozen after its first enable")]
    FiltersFrozen(RequestId),

    #[error("Request {0} must be disabled first")]
    RequestEnabled(RequestId),

    #[error("Request {0} has an enable in flight")]
    Busy(RequestId),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl RegistryError {
    /// Target rejections become `Rejected`; transport failures pass through
    pub(crate) fn from_target(err: DispatchError) -> Self {
        match err {
            DispatchError::Target { .. } => RegistryError::Rejected(err.to_string()),
            other => RegistryError::Dispatch(other),
        }
    }
}

/// Event kind plus the parameters the kind itself implies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RequestKind {
    SingleStep {
        thread: ThreadId,
        size: StepSize,
        depth: StepDepth,
    },
    Breakpoint {
        location: Location,
    },
    Exception {
        /// `None` reports every exception type
        exception_type: Option<ReferenceTypeId>,
        caught: bool,
        uncaught: bool,
    },
    ClassPrepare,
    ClassUnload,
    FieldAccess {
        ref_type: ReferenceTypeId,
        field: FieldId,
    },
    FieldModification {
        ref_type: ReferenceTypeId,
        field: FieldId,
    },
    ThreadStart,
    ThreadDeath,
    MethodEntry,
    MethodExit,
}

impl RequestKind {
    pub fn event_kind(&self) -> u8 {
        match self {
            RequestKind::SingleStep { .. } => event_kinds::SINGLE_STEP,
            RequestKind::Breakpoint { .. } => event_kinds::BREAKPOINT,
            RequestKind::Exception { .. } => event_kinds::EXCEPTION,
            RequestKind::ClassPrepare => event_kinds::CLASS_PREPARE,
            RequestKind::ClassUnload => event_kinds::CLASS_UNLOAD,
            RequestKind::FieldAccess { .. } => event_kinds::FIELD_ACCESS,
            RequestKind::FieldModification { .. } => event_kinds::FIELD_MODIFICATION,
            RequestKind::ThreadStart => event_kinds::THREAD_START,
            RequestKind::ThreadDeath => event_kinds::THREAD_DEATH,
            RequestKind::MethodEntry => event_kinds::METHOD_ENTRY,
            RequestKind::MethodExit => event_kinds::METHOD_EXIT,
        }
    }

    pub fn step_thread(&self) -> Option<ThreadId> {
        match self {
            RequestKind::SingleStep { thread, .. } => Some(*thread),
            _ => None,
        }
    }

    /// Append the kind-implied modifier, returning how many were written
    fn write_modifiers(&self, buf: &mut Vec<u8>) -> i32 {
        match self {
            RequestKind::SingleStep {
                thread,
                size,
                depth,
            } => {
                buf.put_u8(modifier_kinds::STEP);
                buf.put_u64(*thread);
                buf.put_i32(*size as i32);
                buf.put_i32(*depth as i32);
                1
            }
            RequestKind::Breakpoint { location } => {
                buf.put_u8(modifier_kinds::LOCATION_ONLY);
                location.write(buf);
                1
            }
            RequestKind::Exception {
                exception_type,
                caught,
                uncaught,
            } => {
                buf.put_u8(modifier_kinds::EXCEPTION_ONLY);
                buf.put_u64(exception_type.unwrap_or(0));
                buf.put_u8(*caught as u8);
                buf.put_u8(*uncaught as u8);
                1
            }
            RequestKind::FieldAccess { ref_type, field }
            | RequestKind::FieldModification { ref_type, field } => {
                buf.put_u8(modifier_kinds::FIELD_ONLY);
                buf.put_u64(*ref_type);
                buf.put_u64(*field);
                1
            }
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    ClassMatch(String),
    ClassExclude(String),
    ThreadOnly(ThreadId),
    LocationOnly(Location),
    Count(i32),
}

impl Filter {
    fn write(&self, buf: &mut Vec<u8>) {
        match self {
            Filter::ClassMatch(pattern) => {
                buf.put_u8(modifier_kinds::CLASS_MATCH);
                write_string(buf, pattern);
            }
            Filter::ClassExclude(pattern) => {
                buf.put_u8(modifier_kinds::CLASS_EXCLUDE);
                write_string(buf, pattern);
            }
            Filter::ThreadOnly(thread) => {
                buf.put_u8(modifier_kinds::THREAD_ONLY);
                buf.put_u64(*thread);
            }
            Filter::LocationOnly(location) => {
                buf.put_u8(modifier_kinds::LOCATION_ONLY);
                location.write(buf);
            }
            Filter::Count(count) => {
                buf.put_u8(modifier_kinds::COUNT);
                buf.put_i32(*count);
            }
        }
    }

    /// Local check of a non-count filter. Unknown facts match: the target
    /// already applied the same modifier.
    fn accepts(&self, event: &Event, class_name: Option<&str>) -> bool {
        match self {
            Filter::ClassMatch(pattern) => class_name.map_or(true, |n| class_matches(pattern, n)),
            Filter::ClassExclude(pattern) => {
                class_name.map_or(true, |n| !class_matches(pattern, n))
            }
            Filter::ThreadOnly(thread) => event.thread().map_or(true, |t| t == *thread),
            Filter::LocationOnly(location) => event.location().map_or(true, |l| l == *location),
            Filter::Count(_) => true,
        }
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// JDWP class patterns: exact, or a single leading or trailing `*`
pub fn class_matches(pattern: &str, class_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return class_name.ends_with(suffix);
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return class_name.starts_with(prefix);
    }
    pattern == class_name
}

/// `Lcom/example/Foo;` -> `com.example.Foo`. Array and primitive
/// signatures are returned unchanged.
pub fn signature_to_class_name(signature: &str) -> String {
    match signature
        .strip_prefix('L')
        .and_then(|s| s.strip_suffix(';'))
    {
        Some(name) => name.replace('/', "."),
        None => signature.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Disabled,
    Enabling,
    Enabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    pub filters: Vec<Filter>,
    pub suspend_policy: SuspendPolicy,
    pub state: RequestState,
    /// Id the target assigned on the last successful enable
    pub target_id: Option<i32>,
    /// Set on the first successful enable; filters are immutable after
    pub frozen: bool,
}

impl EventRequest {
    fn new(id: RequestId, kind: RequestKind) -> Self {
        Self {
            id,
            kind,
            filters: Vec::new(),
            suspend_policy: SuspendPolicy::EventThread,
            state: RequestState::Disabled,
            target_id: None,
            frozen: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state == RequestState::Enabled
    }

    pub fn has_count(&self) -> bool {
        self.filters.iter().any(|f| matches!(f, Filter::Count(_)))
    }

    /// EventRequest.Set payload: kind, policy, then modifiers with
    /// kind-implied first, filters in insertion order and counts last
    pub fn encode_set(&self) -> Vec<u8> {
        let mut modifiers = Vec::new();
        let mut count = self.kind.write_modifiers(&mut modifiers);

        let (counts, others): (Vec<&Filter>, Vec<&Filter>) = self
            .filters
            .iter()
            .partition(|f| matches!(f, Filter::Count(_)));
        for filter in others.into_iter().chain(counts) {
            filter.write(&mut modifiers);
            count += 1;
        }

        let mut buf = Vec::with_capacity(6 + modifiers.len());
        buf.put_u8(self.kind.event_kind());
        buf.put_u8(self.suspend_policy as u8);
        buf.put_i32(count);
        buf.extend_from_slice(&modifiers);
        buf
    }

    /// Apply the local filters. Count filters are evaluated last and never
    /// reject an event the target delivered.
    pub fn matches(&self, event: &Event, class_name: Option<&str>) -> bool {
        self.filters
            .iter()
            .filter(|f| !matches!(f, Filter::Count(_)))
            .all(|f| f.accepts(event, class_name))
    }
}

/// What the reader task should do with one incoming event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Deliver,
    /// Delivered; the request's count filter has now expired it
    DeliverAndExpire(RequestId),
    Stale,
    Filtered,
}

/// Payload to send for a pending EventRequest.Clear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearRequest {
    pub event_kind: u8,
    pub target_id: i32,
}

/// Retired target ids remembered for stale-event detection
const RETIRED_WINDOW: usize = 256;

#[derive(Debug, Default)]
pub struct RequestTable {
    next_id: u32,
    requests: BTreeMap<RequestId, EventRequest>,
    by_target: HashMap<i32, RequestId>,
    retired: VecDeque<i32>,
    class_names: HashMap<ReferenceTypeId, String>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, kind: RequestKind) -> RequestId {
        self.next_id += 1;
        let id = RequestId(self.next_id);
        debug!("Created event request {} ({:?})", id, kind);
        self.requests.insert(id, EventRequest::new(id, kind));
        id
    }

    pub fn get(&self, id: RequestId) -> Option<&EventRequest> {
        self.requests.get(&id)
    }

    pub fn requests(&self) -> impl Iterator<Item = &EventRequest> {
        self.requests.values()
    }

    fn get_mut(&mut self, id: RequestId) -> Result<&mut EventRequest, RegistryError> {
        self.requests
            .get_mut(&id)
            .ok_or(RegistryError::UnknownRequest(id))
    }

    pub fn set_suspend_policy(
        &mut self,
        id: RequestId,
        policy: SuspendPolicy,
    ) -> Result<(), RegistryError> {
        let request = self.get_mut(id)?;
        match request.state {
            RequestState::Disabled => {
                request.suspend_policy = policy;
                Ok(())
            }
            RequestState::Enabling => Err(RegistryError::Busy(id)),
            RequestState::Enabled => Err(RegistryError::RequestEnabled(id)),
        }
    }

    pub fn add_filter(&mut self, id: RequestId, filter: Filter) -> Result<(), RegistryError> {
        match &filter {
            Filter::ClassMatch(p) | Filter::ClassExclude(p) if p.is_empty() => {
                return Err(RegistryError::InvalidFilterArgument("empty class pattern"));
            }
            Filter::Count(n) if *n <= 0 => {
                return Err(RegistryError::InvalidFilterArgument("count must be positive"));
            }
            _ => {}
        }

        let request = self.get_mut(id)?;
        if request.frozen || request.state != RequestState::Disabled {
            return Err(RegistryError::FiltersFrozen(id));
        }
        request.filters.push(filter);
        Ok(())
    }

    pub fn add_class_filter(
        &mut self,
        id: RequestId,
        pattern: Option<&str>,
    ) -> Result<(), RegistryError> {
        let pattern = pattern.ok_or(RegistryError::InvalidFilterArgument("missing class pattern"))?;
        self.add_filter(id, Filter::ClassMatch(pattern.to_string()))
    }

    pub fn add_class_exclusion_filter(
        &mut self,
        id: RequestId,
        pattern: Option<&str>,
    ) -> Result<(), RegistryError> {
        let pattern = pattern.ok_or(RegistryError::InvalidFilterArgument("missing class pattern"))?;
        self.add_filter(id, Filter::ClassExclude(pattern.to_string()))
    }

    /// Mark `id` as enabling and return its Set payload. `None` means the
    /// request is already enabled.
    pub fn begin_enable(&mut self, id: RequestId) -> Result<Option<Vec<u8>>, RegistryError> {
        let request = self.get_mut(id)?;
        match request.state {
            RequestState::Enabled => Ok(None),
            RequestState::Enabling => Err(RegistryError::Busy(id)),
            RequestState::Disabled => {
                request.state = RequestState::Enabling;
                Ok(Some(request.encode_set()))
            }
        }
    }

    pub fn finish_enable(&mut self, id: RequestId, target_id: i32) {
        if let Some(request) = self.requests.get_mut(&id) {
            request.state = RequestState::Enabled;
            request.target_id = Some(target_id);
            request.frozen = true;
            self.by_target.insert(target_id, id);
            self.unretire(target_id);
        }
    }

    pub fn abort_enable(&mut self, id: RequestId) {
        if let Some(request) = self.requests.get_mut(&id) {
            if request.state == RequestState::Enabling {
                request.state = RequestState::Disabled;
            }
        }
    }

    /// Mark `id` disabled locally so events racing the Clear are treated as
    /// stale. `None` means there is nothing to clear on the target.
    pub fn begin_disable(&mut self, id: RequestId) -> Result<Option<ClearRequest>, RegistryError> {
        let request = self.get_mut(id)?;
        match request.state {
            RequestState::Disabled => Ok(None),
            RequestState::Enabling => Err(RegistryError::Busy(id)),
            RequestState::Enabled => {
                request.state = RequestState::Disabled;
                let event_kind = request.kind.event_kind();
                let target_id = request.target_id.take();
                Ok(target_id.map(|target_id| {
                    self.retire(target_id);
                    ClearRequest {
                        event_kind,
                        target_id,
                    }
                }))
            }
        }
    }

    /// Undo `begin_disable` after the target refused the Clear
    pub fn abort_disable(&mut self, id: RequestId, clear: ClearRequest) {
        if let Some(request) = self.requests.get_mut(&id) {
            request.state = RequestState::Enabled;
            request.target_id = Some(clear.target_id);
            self.unretire(clear.target_id);
            self.by_target.insert(clear.target_id, id);
        }
    }

    pub fn remove(&mut self, id: RequestId) -> Result<EventRequest, RegistryError> {
        let request = self.get(id).ok_or(RegistryError::UnknownRequest(id))?;
        match request.state {
            RequestState::Disabled => {}
            RequestState::Enabling => return Err(RegistryError::Busy(id)),
            RequestState::Enabled => return Err(RegistryError::RequestEnabled(id)),
        }
        let request = self
            .requests
            .remove(&id)
            .ok_or(RegistryError::UnknownRequest(id))?;
        debug!("Deleted event request {}", id);
        Ok(request)
    }

    /// The oldest id falls out once the window is full
    fn retire(&mut self, target_id: i32) {
        self.by_target.remove(&target_id);
        self.unretire(target_id);
        if self.retired.len() == RETIRED_WINDOW {
            self.retired.pop_front();
        }
        self.retired.push_back(target_id);
    }

    fn unretire(&mut self, target_id: i32) {
        self.retired.retain(|retired| *retired != target_id);
    }

    /// Step requests for `thread`, enabled or not
    pub fn step_requests_for(&self, thread: ThreadId) -> Vec<RequestId> {
        self.requests
            .values()
            .filter(|r| r.kind.step_thread() == Some(thread))
            .map(|r| r.id)
            .collect()
    }

    pub fn record_class(&mut self, ref_type: ReferenceTypeId, signature: &str) {
        self.class_names
            .insert(ref_type, signature_to_class_name(signature));
    }

    pub fn class_name(&self, ref_type: ReferenceTypeId) -> Option<&str> {
        self.class_names.get(&ref_type).map(String::as_str)
    }

    fn event_class_name(&self, event: &Event) -> Option<String> {
        match &event.details {
            EventKind::ClassPrepare { signature, .. } | EventKind::ClassUnload { signature } => {
                Some(signature_to_class_name(signature))
            }
            _ => event
                .location()
                .and_then(|l| self.class_name(l.class_id))
                .map(str::to_string),
        }
    }

    /// Decide the fate of one event and apply count expiry
    pub fn classify(&mut self, event: &Event) -> Verdict {
        if event.is_automatic() {
            return Verdict::Deliver;
        }

        if self.retired.contains(&event.request_id) {
            debug!(
                "Dropping stale event kind={} for retired request id={}",
                event.kind, event.request_id
            );
            return Verdict::Stale;
        }

        let Some(id) = self.by_target.get(&event.request_id).copied() else {
            return Verdict::Deliver;
        };

        let class_name = self.event_class_name(event);
        let Some(request) = self.requests.get(&id) else {
            return Verdict::Deliver;
        };

        if !request.is_enabled() {
            debug!("Dropping stale event kind={} for disabled request {}", event.kind, id);
            return Verdict::Stale;
        }

        if !request.matches(event, class_name.as_deref()) {
            warn!(
                "Dropping event kind={} for request {}: filters do not match",
                event.kind, id
            );
            return Verdict::Filtered;
        }

        if request.has_count() {
            self.expire(id);
            return Verdict::DeliverAndExpire(id);
        }

        Verdict::Deliver
    }

    fn expire(&mut self, id: RequestId) {
        let target_id = match self.requests.get_mut(&id) {
            Some(request) => {
                request.state = RequestState::Disabled;
                request.target_id.take()
            }
            None => None,
        };
        if let Some(target_id) = target_id {
            debug!("Request {} expired after its count filter fired", id);
            self.retire(target_id);
        }
    }
}
