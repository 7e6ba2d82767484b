// Scripted in-memory target for connection-level tests
//
// Speaks the handshake and raw packets over a duplex stream; each test
// drives the target side by hand.

use crate::commands::{
    command_sets, event_commands, event_kinds, event_request_commands, thread_commands,
};
use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::protocol::{CommandPacket, Packet, PacketCodec, ReplyPacket, JDWP_HANDSHAKE};
use crate::registry::RequestId;
use crate::suspend::SuspendTarget;
use crate::types::{
    Location, ObjectId, ReferenceTypeId, StepDepth, StepSize, SuspendPolicy, ThreadId, TypeTag,
    Value,
};
use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Decoder;

pub(crate) struct MockTarget {
    stream: DuplexStream,
    buf: BytesMut,
    codec: PacketCodec,
    next_event_id: u32,
}

impl MockTarget {
    pub async fn connect() -> (Connection, MockTarget) {
        let config = EngineConfig {
            reply_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        Self::connect_with_config(config).await
    }

    pub async fn connect_with_config(config: EngineConfig) -> (Connection, MockTarget) {
        let (client, mut stream) = tokio::io::duplex(256 * 1024);

        let target = async move {
            let mut hello = vec![0u8; JDWP_HANDSHAKE.len()];
            stream.read_exact(&mut hello).await.expect("handshake read");
            assert_eq!(hello, JDWP_HANDSHAKE);
            stream
                .write_all(JDWP_HANDSHAKE)
                .await
                .expect("handshake write");
            stream
        };

        let (conn, stream) = tokio::join!(Connection::establish(client, config), target);
        let conn = conn.expect("connection established");

        (
            conn,
            MockTarget {
                stream,
                buf: BytesMut::new(),
                codec: PacketCodec::default(),
                next_event_id: 0x1000,
            },
        )
    }

    /// Next command the controller sent
    pub async fn read_command(&mut self) -> CommandPacket {
        loop {
            if let Some(packet) = self.codec.decode(&mut self.buf).expect("controller packet") {
                match packet {
                    Packet::Command(cmd) => return cmd,
                    other => panic!("controller sent a non-command packet: {:?}", other),
                }
            }
            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .expect("read from controller");
            assert!(n > 0, "controller closed the stream");
        }
    }

    /// Read the next command and check its (set, command) pair
    pub async fn expect(&mut self, command_set: u8, command: u8) -> CommandPacket {
        let cmd = tokio::time::timeout(Duration::from_secs(5), self.read_command())
            .await
            .expect("controller sent nothing");
        assert_eq!(
            (cmd.command_set, cmd.command),
            (command_set, command),
            "unexpected command {:?}",
            cmd
        );
        cmd
    }

    /// Assert the controller sends nothing for a short while
    pub async fn assert_quiet(&mut self) {
        if let Ok(cmd) = tokio::time::timeout(Duration::from_millis(50), self.read_command()).await
        {
            panic!("controller unexpectedly sent {:?}", cmd);
        }
    }

    pub async fn reply(&mut self, id: u32, error_code: u16, data: &[u8]) {
        let reply = ReplyPacket {
            id,
            error_code,
            data: data.to_vec(),
        };
        self.write_raw(&reply.encode()).await;
    }

    /// Send a composite event packet built with `EventWriter`
    pub async fn send_event(&mut self, data: Vec<u8>) {
        let packet = CommandPacket {
            id: self.next_event_id,
            command_set: command_sets::EVENT,
            command: event_commands::COMPOSITE,
            data,
        };
        self.next_event_id += 1;
        self.write_raw(&packet.encode()).await;
    }

    /// Answer the next ThreadReference.FrameCount with `depth`
    pub async fn reply_frame_count(&mut self, depth: i32) {
        let cmd = self
            .expect(command_sets::THREAD_REFERENCE, thread_commands::FRAME_COUNT)
            .await;
        self.reply(cmd.id, 0, &depth.to_be_bytes()).await;
    }

    /// Suspend `thread`, then create and enable a line step request on it,
    /// answering the arming round trips: frame count `stack_depth`, top
    /// frame at `start`, and target request id `target_id`.
    pub async fn arm_line_step(
        &mut self,
        conn: &Connection,
        thread: ThreadId,
        depth: StepDepth,
        stack_depth: i32,
        start: Location,
        target_id: i32,
    ) -> RequestId {
        conn.ctx.threads.suspend(SuspendTarget::Thread(thread));
        let id = conn
            .create_step_request(thread, StepSize::Line, depth)
            .await
            .expect("step request created");

        let op = tokio::spawn({
            let conn = conn.clone();
            async move { conn.enable_request(id).await }
        });
        self.reply_frame_count(stack_depth).await;
        let cmd = self
            .expect(command_sets::THREAD_REFERENCE, thread_commands::FRAMES)
            .await;
        let mut frames = 1i32.to_be_bytes().to_vec();
        frames.extend_from_slice(&0x900u64.to_be_bytes());
        start.write(&mut frames);
        self.reply(cmd.id, 0, &frames).await;
        let cmd = self
            .expect(command_sets::EVENT_REQUEST, event_request_commands::SET)
            .await;
        self.reply(cmd.id, 0, &target_id.to_be_bytes()).await;
        op.await.expect("enable task").expect("step enabled");
        id
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write to controller");
        self.stream.flush().await.expect("flush to controller");
    }
}

/// Builds the payload of a composite event packet
pub(crate) struct EventWriter {
    buf: Vec<u8>,
    count: u32,
}

impl EventWriter {
    pub fn new(policy: SuspendPolicy) -> Self {
        let mut buf = Vec::new();
        buf.put_u8(policy as u8);
        buf.put_u32(0);
        Self { buf, count: 0 }
    }

    fn header(mut self, kind: u8, request_id: i32) -> Self {
        self.buf.put_u8(kind);
        self.buf.put_i32(request_id);
        self.count += 1;
        self
    }

    fn located(self, kind: u8, request_id: i32, thread: ThreadId, location: Location) -> Self {
        let mut this = self.header(kind, request_id);
        this.buf.put_u64(thread);
        location.write(&mut this.buf);
        this
    }

    pub fn breakpoint(self, request_id: i32, thread: ThreadId, location: Location) -> Self {
        self.located(event_kinds::BREAKPOINT, request_id, thread, location)
    }

    pub fn step(self, request_id: i32, thread: ThreadId, location: Location) -> Self {
        self.located(event_kinds::SINGLE_STEP, request_id, thread, location)
    }

    pub fn method_entry(self, request_id: i32, thread: ThreadId, location: Location) -> Self {
        self.located(event_kinds::METHOD_ENTRY, request_id, thread, location)
    }

    pub fn exception(
        self,
        request_id: i32,
        thread: ThreadId,
        location: Location,
        exception: ObjectId,
        catch_location: Option<Location>,
    ) -> Self {
        let mut this = self.located(event_kinds::EXCEPTION, request_id, thread, location);
        this.buf.put_u8(TypeTag::Object as u8);
        this.buf.put_u64(exception);
        let catch = catch_location.unwrap_or(Location {
            type_tag: 0,
            class_id: 0,
            method_id: 0,
            index: 0,
        });
        catch.write(&mut this.buf);
        this
    }

    #[allow(clippy::too_many_arguments)]
    pub fn field_modification(
        self,
        request_id: i32,
        thread: ThreadId,
        location: Location,
        ref_type: ReferenceTypeId,
        field: u64,
        object: ObjectId,
        value: Value,
    ) -> Self {
        let mut this = self.located(event_kinds::FIELD_MODIFICATION, request_id, thread, location);
        this.buf.put_u8(1);
        this.buf.put_u64(ref_type);
        this.buf.put_u64(field);
        this.buf.put_u8(TypeTag::Object as u8);
        this.buf.put_u64(object);
        value.write_tagged(&mut this.buf);
        this
    }

    pub fn class_prepare(
        self,
        request_id: i32,
        thread: ThreadId,
        ref_type: ReferenceTypeId,
        signature: &str,
    ) -> Self {
        let mut this = self.header(event_kinds::CLASS_PREPARE, request_id);
        this.buf.put_u64(thread);
        this.buf.put_u8(1);
        this.buf.put_u64(ref_type);
        this.buf.put_u32(signature.len() as u32);
        this.buf.put_slice(signature.as_bytes());
        // VERIFIED | PREPARED | INITIALIZED
        this.buf.put_i32(7);
        this
    }

    pub fn class_unload(self, request_id: i32, signature: &str) -> Self {
        let mut this = self.header(event_kinds::CLASS_UNLOAD, request_id);
        this.buf.put_u32(signature.len() as u32);
        this.buf.put_slice(signature.as_bytes());
        this
    }

    pub fn thread_start(self, request_id: i32, thread: ThreadId) -> Self {
        let mut this = self.header(event_kinds::THREAD_START, request_id);
        this.buf.put_u64(thread);
        this
    }

    pub fn thread_death(self, request_id: i32, thread: ThreadId) -> Self {
        let mut this = self.header(event_kinds::THREAD_DEATH, request_id);
        this.buf.put_u64(thread);
        this
    }

    pub fn vm_death(self) -> Self {
        self.header(event_kinds::VM_DEATH, 0)
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf[1..5].copy_from_slice(&self.count.to_be_bytes());
        self.buf
    }
}
