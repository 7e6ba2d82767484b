// JDWP connection management
//
// Handles transport setup, handshake, and reader task startup. All shared
// state lives in one EngineContext owned by the connection.

use crate::commands::{command_sets, vm_commands};
use crate::config::EngineConfig;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::eventloop::spawn_reader;
use crate::eventqueue::{event_channel, EventQueue};
use crate::poison::lock;
use crate::protocol::*;
use crate::registry::RequestTable;
use crate::suspend::SuspendTracker;
use crate::types::{SuspendPolicy, ThreadId};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything one debugging session shares between callers and the
/// reader task
#[derive(Debug)]
pub struct EngineContext {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) requests: Mutex<RequestTable>,
    pub(crate) threads: SuspendTracker,
    pub(crate) events: EventQueue,
    pub(crate) config: EngineConfig,
    pub(crate) shutdown: CancellationToken,
}

impl EngineContext {
    pub(crate) fn requests(&self) -> MutexGuard<'_, RequestTable> {
        lock(&self.requests, "engine.requests")
    }

    /// Close the session: fail pending and future sends, drop suspend state
    pub(crate) fn teardown(&self, reason: DispatchError) {
        self.dispatcher.teardown(reason);
        self.threads.clear();
        self.shutdown.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub(crate) ctx: Arc<EngineContext>,
}

impl Connection {
    pub(crate) fn from_context(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Connect to a JVM via JDWP
    pub async fn connect(host: &str, port: u16) -> JdwpResult<Self> {
        Self::connect_with_config(host, port, EngineConfig::default()).await
    }

    pub async fn connect_with_config(
        host: &str,
        port: u16,
        config: EngineConfig,
    ) -> JdwpResult<Self> {
        info!("Connecting to JDWP at {}:{}", host, port);

        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        Self::establish(stream, config).await
    }

    /// Run the handshake over an already-open stream and start the reader
    pub async fn establish<S>(mut stream: S, config: EngineConfig) -> JdwpResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        match tokio::time::timeout(config.handshake_timeout, handshake(&mut stream)).await {
            Ok(result) => result?,
            Err(_elapsed) => {
                warn!(
                    "JDWP handshake timed out after {:?}",
                    config.handshake_timeout
                );
                return Err(JdwpError::InvalidHandshake);
            }
        }

        let (reader, writer) = tokio::io::split(stream);
        let (event_tx, events) = event_channel();

        let ctx = Arc::new(EngineContext {
            dispatcher: Dispatcher::new(writer, config.reply_timeout),
            requests: Mutex::new(RequestTable::new()),
            threads: SuspendTracker::new(),
            events,
            config,
            shutdown: CancellationToken::new(),
        });

        spawn_reader(reader, Arc::clone(&ctx), event_tx);

        Ok(Self { ctx })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn is_connected(&self) -> bool {
        !self.ctx.shutdown.is_cancelled() && self.ctx.dispatcher.closed_reason().is_none()
    }

    /// Token cancelled when the session ends, for any reason
    pub fn closed(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    /// Send VirtualMachine.Dispose (best effort) and close the session
    pub async fn disconnect(&self) {
        if self.is_connected() {
            let dispose = Command::new(command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE);
            match self.ctx.dispatcher.send(dispose).await {
                Ok(id) => {
                    if let Err(e) = self
                        .ctx
                        .dispatcher
                        .await_reply(id, Duration::from_secs(1))
                        .await
                    {
                        debug!("Dispose not acknowledged: {}", e);
                    }
                }
                Err(e) => debug!("Dispose not sent: {}", e),
            }
        }

        info!("Disconnecting from target");
        self.ctx.teardown(DispatchError::Disconnected);
        self.ctx.dispatcher.shutdown_writer().await;
    }

    /// Register a command and write it; pair with `await_reply`
    pub async fn send(&self, command: Command) -> JdwpResult<u32> {
        Ok(self.ctx.dispatcher.send(command).await?)
    }

    pub async fn await_reply(&self, id: u32, timeout: Duration) -> JdwpResult<Vec<u8>> {
        Ok(self.ctx.dispatcher.await_reply(id, timeout).await?)
    }

    /// Send a command and wait for its reply payload
    pub async fn send_command(&self, command: Command) -> JdwpResult<Vec<u8>> {
        Ok(self.ctx.dispatcher.call(command).await?)
    }

    /// Resume whatever `policy` suspended for an event set
    pub(crate) async fn resume_policy(
        &self,
        policy: SuspendPolicy,
        thread: Option<ThreadId>,
    ) -> JdwpResult<()> {
        match (policy, thread) {
            (SuspendPolicy::None, _) | (SuspendPolicy::EventThread, None) => Ok(()),
            (SuspendPolicy::EventThread, Some(t)) if !self.ctx.threads.is_registered(t) => {
                // thread already reported dead; let the target finish it off
                debug!("Resuming forgotten thread {:#x} without accounting", t);
                if let Err(e) = self.send_thread_resume(t).await {
                    debug!("Resume of forgotten thread {:#x} failed: {}", t, e);
                }
                Ok(())
            }
            (SuspendPolicy::EventThread, Some(t)) => self.resume_thread(t).await,
            (SuspendPolicy::All, _) => self.resume_all().await,
        }
    }
}

/// Perform JDWP handshake
async fn handshake<S>(stream: &mut S) -> JdwpResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Performing JDWP handshake");

    stream.write_all(JDWP_HANDSHAKE).await?;
    stream.flush().await?;

    let mut buf = vec![0u8; JDWP_HANDSHAKE.len()];
    stream.read_exact(&mut buf).await?;

    if buf != JDWP_HANDSHAKE {
        warn!("Invalid handshake response: {:?}", buf);
        return Err(JdwpError::InvalidHandshake);
    }

    info!("JDWP handshake successful");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::event_request_commands;
    use crate::eventqueue::QueueError;
    use crate::mock::MockTarget;

    #[tokio::test]
    async fn rejects_bad_handshake() {
        let (client, mut target) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let mut buf = [0u8; 14];
            target.read_exact(&mut buf).await.unwrap();
            target.write_all(b"NOT-A-Handshak").await.unwrap();
            target
        });

        let result = Connection::establish(client, EngineConfig::default()).await;
        assert!(matches!(result, Err(JdwpError::InvalidHandshake)));
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn handshake_times_out() {
        let (client, _target) = tokio::io::duplex(1024);
        let config = EngineConfig {
            handshake_timeout: Duration::from_millis(20),
            ..EngineConfig::default()
        };

        let result = Connection::establish(client, config).await;
        assert!(matches!(result, Err(JdwpError::InvalidHandshake)));
    }

    #[tokio::test]
    async fn reply_scenario_over_the_wire() {
        let (conn, mut target) = MockTarget::connect().await;

        let id = conn
            .send(Command::new(command_sets::EVENT_REQUEST, event_request_commands::SET))
            .await
            .unwrap();
        let cmd = target.read_command().await;
        assert_eq!(cmd.id, id);
        assert_eq!((cmd.command_set, cmd.command), (15, 1));
        assert!(cmd.data.is_empty());

        target.reply(id, 0, &[]).await;
        let payload = conn.await_reply(id, Duration::from_secs(5)).await.unwrap();
        assert!(payload.is_empty());
        assert!(!conn.ctx.dispatcher.is_pending(id));
    }

    #[tokio::test]
    async fn eof_resolves_pending_and_closes_queue() {
        let (conn, mut target) = MockTarget::connect().await;

        let id = conn
            .send(Command::new(command_sets::VIRTUAL_MACHINE, vm_commands::VERSION))
            .await
            .unwrap();
        target.read_command().await;
        drop(target);

        let err = conn.await_reply(id, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            err,
            JdwpError::Dispatch(DispatchError::Disconnected)
        ));
        assert_eq!(conn.recv_event().await, Err(QueueError::Closed));
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.send(Command::new(1, 1)).await,
            Err(JdwpError::Dispatch(DispatchError::Disconnected))
        ));
    }

    #[tokio::test]
    async fn bad_length_tears_connection_down() {
        let (conn, mut target) = MockTarget::connect().await;

        let id = conn
            .send(Command::new(command_sets::VIRTUAL_MACHINE, vm_commands::VERSION))
            .await
            .unwrap();
        target.read_command().await;
        // declared length below the header size
        target.write_raw(&[0, 0, 0, 3, 0, 0, 0, 1, 0x80, 0, 0]).await;

        let err = conn.await_reply(id, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            err,
            JdwpError::Dispatch(DispatchError::Codec(CodecError::InvalidLength(3)))
        ));
        assert_eq!(conn.recv_event().await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn disconnect_sends_dispose_and_closes() {
        let (conn, mut target) = MockTarget::connect().await;

        let disconnect = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.disconnect().await })
        };

        let dispose = target.read_command().await;
        assert_eq!(
            (dispose.command_set, dispose.command),
            (command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE)
        );
        target.reply(dispose.id, 0, &[]).await;
        disconnect.await.unwrap();

        assert!(!conn.is_connected());
        assert_eq!(conn.recv_event().await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn concurrent_callers_get_their_own_replies() {
        let (conn, mut target) = MockTarget::connect().await;

        let callers: Vec<_> = (0u8..8)
            .map(|n| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    let command = Command::new(command_sets::VIRTUAL_MACHINE, vm_commands::VERSION)
                        .with_data(vec![n]);
                    let id = conn.send(command).await?;
                    let reply = conn.await_reply(id, Duration::from_secs(5)).await?;
                    Ok::<_, JdwpError>((n, reply))
                })
            })
            .collect();

        let mut received = Vec::new();
        for _ in 0..8 {
            received.push(
                target
                    .expect(command_sets::VIRTUAL_MACHINE, vm_commands::VERSION)
                    .await,
            );
        }
        let mut ids: Vec<_> = received.iter().map(|cmd| cmd.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);

        // answer newest first; each reply echoes the caller's tag
        for cmd in received.iter().rev() {
            target.reply(cmd.id, 0, &[cmd.data[0], 0xAA]).await;
        }

        for caller in callers {
            let (n, reply) = caller.await.unwrap().unwrap();
            assert_eq!(reply, vec![n, 0xAA]);
        }
        assert_eq!(conn.ctx.dispatcher.pending_count(), 0);
    }
}
