// Event delivery queue
//
// The reader task is the only producer. Consumers dequeue through
// Connection so step candidates are settled before a set is handed out.

use crate::connection::Connection;
use crate::events::EventSet;
use crate::protocol::JdwpResult;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Event queue closed")]
    Closed,

    #[error("Timed out waiting for an event")]
    Timeout,

    #[error("Wait for an event was cancelled")]
    Cancelled,
}

pub(crate) type EventSender = mpsc::UnboundedSender<EventSet>;

#[derive(Debug)]
pub struct EventQueue {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<EventSet>>,
}

pub(crate) fn event_channel() -> (EventSender, EventQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        tx,
        EventQueue {
            rx: tokio::sync::Mutex::new(rx),
        },
    )
}

impl EventQueue {
    async fn next(&self) -> Result<EventSet, QueueError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(QueueError::Closed)
    }

    fn try_next(&self) -> Result<Option<EventSet>, QueueError> {
        let Ok(mut rx) = self.rx.try_lock() else {
            // another consumer is mid-receive
            return Ok(None);
        };
        match rx.try_recv() {
            Ok(set) => Ok(Some(set)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(QueueError::Closed),
        }
    }
}

impl Connection {
    /// Wait for the next event set (FIFO)
    pub async fn recv_event(&self) -> Result<EventSet, QueueError> {
        loop {
            let set = self.ctx.events.next().await?;
            if let Some(set) = self.settle_steps(set).await {
                return Ok(set);
            }
        }
    }

    /// Like `recv_event`, but gives up after `timeout`. Only the wait for a
    /// set is bounded: once dequeued, a set is always settled and returned.
    pub async fn recv_event_timeout(&self, timeout: Duration) -> Result<EventSet, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let set = match tokio::time::timeout_at(deadline, self.ctx.events.next()).await {
                Ok(result) => result?,
                Err(_elapsed) => return Err(QueueError::Timeout),
            };
            if let Some(set) = self.settle_steps(set).await {
                return Ok(set);
            }
        }
    }

    /// Like `recv_event`, but stops waiting when `token` is cancelled. A set
    /// already dequeued is settled and returned even if the token fires.
    pub async fn recv_event_cancellable(
        &self,
        token: &CancellationToken,
    ) -> Result<EventSet, QueueError> {
        loop {
            let set = tokio::select! {
                _ = token.cancelled() => {
                    debug!("Event wait cancelled");
                    return Err(QueueError::Cancelled);
                }
                result = self.ctx.events.next() => result?,
            };
            if let Some(set) = self.settle_steps(set).await {
                return Ok(set);
            }
        }
    }

    /// Non-blocking dequeue. `Ok(None)` when nothing is queued.
    pub async fn try_recv_event(&self) -> Result<Option<EventSet>, QueueError> {
        while let Some(set) = self.ctx.events.try_next()? {
            if let Some(set) = self.settle_steps(set).await {
                return Ok(Some(set));
            }
        }
        Ok(None)
    }

    /// Undo exactly what the set's suspend policy suspended
    pub async fn resume_event_set(&self, set: &EventSet) -> JdwpResult<()> {
        self.resume_policy(set.suspend_policy, set.event_thread())
            .await
    }
}
