// JDWP reader task
//
// Sole consumer of the transport's read half. Replies are routed to the
// dispatcher; composite event packets are decoded, checked against the
// registry, applied to the suspend tracker and enqueued.

use crate::commands::event_kinds;
use crate::connection::{Connection, EngineContext};
use crate::dispatcher::DispatchError;
use crate::eventqueue::EventSender;
use crate::events::{parse_event_packet, EventKind, EventSet};
use crate::protocol::{CodecError, Packet, PacketCodec};
use crate::registry::Verdict;
use crate::types::{SuspendPolicy, ThreadId};
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, warn};

pub(crate) fn spawn_reader<R>(
    reader: R,
    ctx: Arc<EngineContext>,
    events: EventSender,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(reader_task(reader, ctx, events))
}

async fn reader_task<R>(mut reader: R, ctx: Arc<EngineContext>, events: EventSender)
where
    R: AsyncRead + Unpin,
{
    info!("Reader task started");

    let mut codec = PacketCodec::new(ctx.config.max_packet_size);
    let mut buf = BytesMut::with_capacity(ctx.config.read_buffer_size);

    let reason = loop {
        if let Err(e) = drain(&mut codec, &mut buf, &ctx, &events) {
            break DispatchError::Codec(e);
        }

        tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                debug!("Reader task cancelled");
                break DispatchError::Disconnected;
            }
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    break match codec.decode_eof(&mut buf) {
                        Ok(_) => DispatchError::Disconnected,
                        Err(e) => DispatchError::Codec(e),
                    };
                }
                Ok(n) => debug!("Read {} bytes", n),
                Err(e) => {
                    error!("Failed to read from transport: {}", e);
                    break DispatchError::Disconnected;
                }
            },
        }
    };

    match &reason {
        DispatchError::Codec(e) => error!("Tearing down connection: {}", e),
        other => info!("Connection closed: {}", other),
    }
    ctx.teardown(reason);
    drop(events);

    info!("Reader task shutting down");
}

/// Handle every complete packet currently buffered
fn drain(
    codec: &mut PacketCodec,
    buf: &mut BytesMut,
    ctx: &Arc<EngineContext>,
    events: &EventSender,
) -> Result<(), CodecError> {
    while let Some(packet) = codec.decode(buf)? {
        match packet {
            Packet::Reply(reply) => {
                debug!(
                    "Received reply id={} error={} len={}",
                    reply.id,
                    reply.error_code,
                    reply.data.len()
                );
                ctx.dispatcher.complete(reply);
            }
            Packet::Event(event) => {
                debug!("Received event packet id={} len={}", event.id, event.data.len());
                let set = parse_event_packet(&event.data)?;
                deliver(ctx, events, set);
            }
            Packet::Command(cmd) => {
                debug!(
                    "Ignoring target command id={} set={} cmd={}",
                    cmd.id, cmd.command_set, cmd.command
                );
            }
        }
    }
    Ok(())
}

/// Register, filter, apply the suspend policy, then enqueue. The policy is
/// applied before the set becomes visible to the consumer.
fn deliver(ctx: &Arc<EngineContext>, events: &EventSender, set: EventSet) {
    if set.is_empty() {
        warn!("Ignoring composite packet with no events");
        return;
    }

    let policy = set.suspend_policy;
    let event_thread = set.event_thread();

    for event in &set.events {
        if let Some(thread) = event.thread() {
            ctx.threads.register(thread);
        }
    }

    let mut expired = Vec::new();
    let kept: Vec<_> = {
        let mut requests = ctx.requests();
        for event in &set.events {
            if let EventKind::ClassPrepare {
                ref_type,
                signature,
                ..
            } = &event.details
            {
                requests.record_class(*ref_type, signature);
            }
        }

        set.events
            .into_iter()
            .filter(|event| match requests.classify(event) {
                Verdict::Deliver => true,
                Verdict::DeliverAndExpire(id) => {
                    expired.push(id);
                    true
                }
                Verdict::Stale | Verdict::Filtered => false,
            })
            .collect()
    };

    for id in expired {
        ctx.threads.disarm_request(id);
    }

    ctx.threads.apply_policy(policy, event_thread);

    for event in &kept {
        if event.kind == event_kinds::THREAD_DEATH {
            if let Some(thread) = event.thread() {
                ctx.threads.forget(thread);
            }
        }
    }

    if kept.is_empty() {
        debug!("Every event in the set was stale; resuming policy {:?}", policy);
        spawn_stale_resume(ctx, policy, event_thread);
        return;
    }

    debug!(
        "Enqueued event set: {} events, suspend_policy={:?}",
        kept.len(),
        policy
    );
    let set = EventSet {
        suspend_policy: policy,
        events: kept,
    };
    if events.send(set).is_err() {
        warn!("Event queue dropped, discarding event set");
    }
}

/// Must not run on the reader task: the resume's reply arrives through it
fn spawn_stale_resume(ctx: &Arc<EngineContext>, policy: SuspendPolicy, thread: Option<ThreadId>) {
    if policy == SuspendPolicy::None {
        return;
    }
    let conn = Connection::from_context(Arc::clone(ctx));
    tokio::spawn(async move {
        if let Err(e) = conn.resume_policy(policy, thread).await {
            warn!("Failed to resume after stale event set: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use crate::commands::{command_sets, event_request_commands, thread_commands, vm_commands};
    use crate::eventqueue::QueueError;
    use crate::events::EventKind;
    use crate::mock::{EventWriter, MockTarget};
    use crate::protocol::CommandPacket;
    use crate::suspend::SuspendTarget;
    use crate::types::{Location, SuspendPolicy};

    #[tokio::test]
    async fn policy_is_applied_before_the_set_is_visible() {
        let (conn, mut target) = MockTarget::connect().await;

        target
            .send_event(
                EventWriter::new(SuspendPolicy::All)
                    .breakpoint(0, 0x10, Location::new(1, 2, 3))
                    .finish(),
            )
            .await;

        let set = conn.recv_event().await.unwrap();
        assert_eq!(set.suspend_policy, SuspendPolicy::All);
        assert_eq!(conn.ctx.threads.suspend_count(SuspendTarget::All), 1);
        assert!(conn.ctx.threads.is_stopped(0x10));

        let resume = tokio::spawn({
            let conn = conn.clone();
            async move { conn.resume_event_set(&set).await }
        });
        let cmd = target
            .expect(command_sets::VIRTUAL_MACHINE, vm_commands::RESUME)
            .await;
        target.reply(cmd.id, 0, &[]).await;
        resume.await.unwrap().unwrap();

        assert_eq!(conn.ctx.threads.suspend_count(SuspendTarget::All), 0);
    }

    #[tokio::test]
    async fn sets_arrive_in_order_and_register_threads() {
        let (conn, mut target) = MockTarget::connect().await;

        for thread in [1, 2, 3] {
            target
                .send_event(
                    EventWriter::new(SuspendPolicy::None)
                        .thread_start(0, thread)
                        .finish(),
                )
                .await;
        }

        for thread in [1, 2, 3] {
            let set = conn.recv_event().await.unwrap();
            assert_eq!(set.event_thread(), Some(thread));
        }
        assert_eq!(conn.ctx.threads.threads(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn thread_death_forgets_thread() {
        let (conn, mut target) = MockTarget::connect().await;

        target
            .send_event(EventWriter::new(SuspendPolicy::None).thread_start(0, 4).finish())
            .await;
        target
            .send_event(EventWriter::new(SuspendPolicy::None).thread_death(0, 4).finish())
            .await;

        conn.recv_event().await.unwrap();
        let death = conn.recv_event().await.unwrap();
        assert_eq!(death.events[0].details, EventKind::ThreadDeath { thread: 4 });
        assert!(!conn.ctx.threads.is_registered(4));
    }

    #[tokio::test]
    async fn stale_set_is_dropped_and_resumed() {
        let (conn, mut target) = MockTarget::connect().await;
        let location = Location::new(1, 2, 3);

        let op = tokio::spawn({
            let conn = conn.clone();
            async move { conn.set_breakpoint(location, SuspendPolicy::EventThread).await }
        });
        let cmd = target
            .expect(command_sets::EVENT_REQUEST, event_request_commands::SET)
            .await;
        target.reply(cmd.id, 0, &5i32.to_be_bytes()).await;
        let id = op.await.unwrap().unwrap();

        let op = tokio::spawn({
            let conn = conn.clone();
            async move { conn.disable_request(id).await }
        });
        let cmd = target
            .expect(command_sets::EVENT_REQUEST, event_request_commands::CLEAR)
            .await;
        target.reply(cmd.id, 0, &[]).await;
        op.await.unwrap().unwrap();

        // hit that raced the Clear
        target
            .send_event(
                EventWriter::new(SuspendPolicy::EventThread)
                    .breakpoint(5, 9, location)
                    .finish(),
            )
            .await;

        let cmd = target
            .expect(command_sets::THREAD_REFERENCE, thread_commands::RESUME)
            .await;
        assert_eq!(cmd.data, 9u64.to_be_bytes());
        target.reply(cmd.id, 0, &[]).await;

        assert_eq!(conn.try_recv_event().await, Ok(None));
    }

    #[tokio::test]
    async fn count_filter_expires_after_first_delivery() {
        let (conn, mut target) = MockTarget::connect().await;
        let location = Location::new(1, 2, 3);
        let id = conn.create_request(crate::registry::RequestKind::Breakpoint { location });
        conn.set_suspend_policy(id, SuspendPolicy::None).unwrap();
        conn.add_count_filter(id, 1).unwrap();

        let op = tokio::spawn({
            let conn = conn.clone();
            async move { conn.enable_request(id).await }
        });
        let cmd = target
            .expect(command_sets::EVENT_REQUEST, event_request_commands::SET)
            .await;
        target.reply(cmd.id, 0, &6i32.to_be_bytes()).await;
        op.await.unwrap().unwrap();

        for _ in 0..2 {
            target
                .send_event(
                    EventWriter::new(SuspendPolicy::None)
                        .breakpoint(6, 1, location)
                        .finish(),
                )
                .await;
        }
        target
            .send_event(EventWriter::new(SuspendPolicy::None).thread_start(0, 2).finish())
            .await;

        let first = conn.recv_event().await.unwrap();
        assert_eq!(first.events[0].request_id, 6);
        let next = conn.recv_event().await.unwrap();
        assert_eq!(next.events[0].details, EventKind::ThreadStart { thread: 2 });
        assert!(!conn.request(id).unwrap().is_enabled());
    }

    #[tokio::test]
    async fn target_commands_other_than_events_are_ignored() {
        let (conn, mut target) = MockTarget::connect().await;

        let stray = CommandPacket {
            id: 77,
            command_set: 1,
            command: 1,
            data: vec![],
        };
        target.write_raw(&stray.encode()).await;
        target
            .send_event(EventWriter::new(SuspendPolicy::None).vm_death().finish())
            .await;

        let set = conn.recv_event().await.unwrap();
        assert_eq!(set.events[0].details, EventKind::VMDeath);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn malformed_event_payload_is_fatal() {
        let (conn, mut target) = MockTarget::connect().await;

        // suspend policy 9 does not exist
        target.send_event(vec![9, 0, 0, 0, 0]).await;

        assert_eq!(conn.recv_event().await, Err(QueueError::Closed));
        assert!(!conn.is_connected());
    }
}
