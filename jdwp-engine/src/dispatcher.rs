// Command dispatch and reply correlation
//
// Every outgoing command gets a fresh packet id and a PendingRequest
// holding both ends of a oneshot channel. The reader task completes the
// sender half; the caller waits on the receiver half.

use crate::poison::lock;
use crate::protocol::{error_name, CodecError, Command, ReplyPacket};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Timed out waiting for reply")]
    Timeout,

    #[error("Connection closed")]
    Disconnected,

    #[error("Connection torn down: {0}")]
    Codec(CodecError),

    #[error("JDWP error code {code}: {name}")]
    Target { code: u16, name: &'static str },

    #[error("No pending request with id {0}")]
    NotPending(u32),
}

impl DispatchError {
    pub fn target(code: u16) -> Self {
        DispatchError::Target {
            code,
            name: error_name(code),
        }
    }

    /// Target error code, if the target rejected the command
    pub fn target_code(&self) -> Option<u16> {
        match self {
            DispatchError::Target { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchError::Disconnected | DispatchError::Codec(_))
    }
}

type ReplyResult = Result<ReplyPacket, DispatchError>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct PendingRequest {
    tx: Option<oneshot::Sender<ReplyResult>>,
    rx: Option<oneshot::Receiver<ReplyResult>>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u32, PendingRequest>,
    closed: Option<DispatchError>,
}

pub struct Dispatcher {
    writer: tokio::sync::Mutex<Writer>,
    pending: Mutex<PendingTable>,
    next_id: AtomicU32,
    reply_timeout: Duration,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending_count())
            .field("reply_timeout", &self.reply_timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new<W>(writer: W, reply_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(PendingTable::default()),
            next_id: AtomicU32::new(1),
            reply_timeout,
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Register a PendingRequest and write the command. Returns the packet id.
    pub async fn send(&self, command: Command) -> Result<u32, DispatchError> {
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut table = lock(&self.pending, "dispatcher.send");
            if let Some(reason) = &table.closed {
                return Err(reason.clone());
            }
            let id = self.allocate_id(&table.entries);
            table.entries.insert(
                id,
                PendingRequest {
                    tx: Some(tx),
                    rx: Some(rx),
                },
            );
            id
        };

        let packet = command.into_packet(id);
        debug!(
            "Sending command id={} set={} cmd={} len={}",
            id,
            packet.command_set,
            packet.command,
            packet.data.len()
        );
        let encoded = packet.encode();

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&encoded).await {
            error!("Failed to write command id={}: {}", id, e);
            self.remove(id);
            return Err(DispatchError::Disconnected);
        }
        if let Err(e) = writer.flush().await {
            error!("Failed to flush command id={}: {}", id, e);
            self.remove(id);
            return Err(DispatchError::Disconnected);
        }

        Ok(id)
    }

    /// Wait for the reply to `id`. The PendingRequest is removed on every
    /// terminal outcome.
    pub async fn await_reply(&self, id: u32, timeout: Duration) -> Result<Vec<u8>, DispatchError> {
        let rx = {
            let mut table = lock(&self.pending, "dispatcher.await_reply");
            match table.entries.get_mut(&id).and_then(|p| p.rx.take()) {
                Some(rx) => rx,
                None => return Err(DispatchError::NotPending(id)),
            }
        };

        let outcome = tokio::time::timeout(timeout, rx).await;
        self.remove(id);

        let reply = match outcome {
            Ok(Ok(result)) => result?,
            Ok(Err(_closed)) => return Err(DispatchError::Disconnected),
            Err(_elapsed) => {
                debug!("Reply for id={} timed out after {:?}", id, timeout);
                return Err(DispatchError::Timeout);
            }
        };

        if reply.is_error() {
            debug!(
                "Command id={} failed: {} ({})",
                id,
                reply.error_code,
                reply.error_message()
            );
            return Err(DispatchError::target(reply.error_code));
        }

        Ok(reply.data)
    }

    /// Send a command and wait for its reply with the configured timeout
    pub async fn call(&self, command: Command) -> Result<Vec<u8>, DispatchError> {
        let id = self.send(command).await?;
        self.await_reply(id, self.reply_timeout).await
    }

    /// Route a reply from the reader task to its caller
    pub(crate) fn complete(&self, reply: ReplyPacket) {
        let id = reply.id;
        let mut table = lock(&self.pending, "dispatcher.complete");

        match table.entries.get_mut(&id).and_then(|p| p.tx.take()) {
            Some(tx) => {
                if tx.send(Ok(reply)).is_err() {
                    // caller went away mid-wait
                    table.entries.remove(&id);
                }
            }
            None => warn!("Received reply for unknown command id={}", id),
        }
    }

    /// Resolve every outstanding request with `reason` and refuse new sends
    pub(crate) fn teardown(&self, reason: DispatchError) {
        let mut table = lock(&self.pending, "dispatcher.teardown");
        if table.closed.is_some() {
            return;
        }
        table.closed = Some(reason.clone());

        let mut abandoned = Vec::new();
        for (id, pending) in table.entries.iter_mut() {
            if let Some(tx) = pending.tx.take() {
                if tx.send(Err(reason.clone())).is_err() {
                    abandoned.push(*id);
                }
            }
        }
        for id in abandoned {
            table.entries.remove(&id);
        }
    }

    pub(crate) async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Writer shutdown failed: {}", e);
        }
    }

    pub fn closed_reason(&self) -> Option<DispatchError> {
        lock(&self.pending, "dispatcher.closed_reason").closed.clone()
    }

    pub fn is_pending(&self, id: u32) -> bool {
        lock(&self.pending, "dispatcher.is_pending")
            .entries
            .contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending, "dispatcher.pending_count").entries.len()
    }

    fn remove(&self, id: u32) {
        lock(&self.pending, "dispatcher.remove").entries.remove(&id);
    }

    fn allocate_id(&self, entries: &HashMap<u32, PendingRequest>) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 && !entries.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Packet, HEADER_SIZE};
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn dispatcher() -> (Dispatcher, DuplexStream) {
        let (writer, target) = tokio::io::duplex(64 * 1024);
        (Dispatcher::new(writer, Duration::from_secs(5)), target)
    }

    fn reply(id: u32, error_code: u16, data: Vec<u8>) -> ReplyPacket {
        ReplyPacket {
            id,
            error_code,
            data,
        }
    }

    #[tokio::test]
    async fn reply_reaches_caller_and_pending_entry_is_removed() {
        let (dispatcher, mut target) = dispatcher();
        dispatcher.next_id.store(7, Ordering::SeqCst);

        let id = dispatcher.send(Command::new(15, 1)).await.unwrap();
        assert_eq!(id, 7);

        let mut sent = [0u8; HEADER_SIZE];
        target.read_exact(&mut sent).await.unwrap();
        assert_eq!(sent, [0, 0, 0, 11, 0, 0, 0, 7, 0x00, 15, 1]);

        let wire = [0, 0, 0, 11, 0, 0, 0, 7, 0x80, 0, 0];
        match Packet::decode(&wire).unwrap() {
            Packet::Reply(r) => dispatcher.complete(r),
            other => panic!("expected reply, got {:?}", other),
        }

        let payload = dispatcher
            .await_reply(7, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(payload.is_empty());
        assert!(!dispatcher.is_pending(7));
    }

    #[tokio::test]
    async fn unmatched_reply_does_not_disturb_other_requests() {
        let (dispatcher, _target) = dispatcher();

        let a = dispatcher.send(Command::new(1, 1)).await.unwrap();
        let b = dispatcher.send(Command::new(1, 7)).await.unwrap();

        dispatcher.complete(reply(999, 0, vec![1]));
        dispatcher.complete(reply(b, 0, vec![0xb]));
        dispatcher.complete(reply(a, 0, vec![0xa]));

        assert_eq!(
            dispatcher.await_reply(a, Duration::from_secs(1)).await.unwrap(),
            vec![0xa]
        );
        assert_eq!(
            dispatcher.await_reply(b, Duration::from_secs(1)).await.unwrap(),
            vec![0xb]
        );
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_entry_and_late_reply_is_dropped() {
        let (dispatcher, _target) = dispatcher();
        let id = dispatcher.send(Command::new(1, 1)).await.unwrap();

        let err = dispatcher
            .await_reply(id, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Timeout);
        assert!(!dispatcher.is_pending(id));

        // Late reply: logged and ignored
        dispatcher.complete(reply(id, 0, vec![]));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn target_error_code_is_surfaced() {
        let (dispatcher, _target) = dispatcher();
        let id = dispatcher.send(Command::new(15, 1)).await.unwrap();
        dispatcher.complete(reply(id, 103, vec![]));

        let err = dispatcher
            .await_reply(id, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.target_code(), Some(103));
        assert_eq!(err.to_string(), "JDWP error code 103: ILLEGAL_ARGUMENT");
    }

    #[tokio::test]
    async fn teardown_resolves_pending_and_blocks_new_sends() {
        let (dispatcher, _target) = dispatcher();
        let id = dispatcher.send(Command::new(1, 1)).await.unwrap();

        dispatcher.teardown(DispatchError::Disconnected);

        assert_eq!(
            dispatcher.await_reply(id, Duration::from_secs(1)).await,
            Err(DispatchError::Disconnected)
        );
        assert_eq!(
            dispatcher.send(Command::new(1, 1)).await,
            Err(DispatchError::Disconnected)
        );
        assert_eq!(dispatcher.closed_reason(), Some(DispatchError::Disconnected));
    }

    #[tokio::test]
    async fn await_on_unknown_id_is_not_pending() {
        let (dispatcher, _target) = dispatcher();
        assert_eq!(
            dispatcher.await_reply(42, Duration::from_millis(10)).await,
            Err(DispatchError::NotPending(42))
        );
    }

    #[tokio::test]
    async fn id_allocation_skips_ids_still_pending() {
        let (dispatcher, _target) = dispatcher();
        let first = dispatcher.send(Command::new(1, 1)).await.unwrap();

        dispatcher.next_id.store(first, Ordering::SeqCst);
        let second = dispatcher.send(Command::new(1, 1)).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(dispatcher.pending_count(), 2);
    }
}
