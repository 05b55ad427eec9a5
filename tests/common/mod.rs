//! Fake head unit driving the far end of a `MemoryTransport`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use sdl_proxy::control::{self, ControlEvent};
use sdl_proxy::protocol::{
    build_frame, encode, frame_info, FrameBuffer, FrameSpec, FrameType, Header, LogicalMessage,
    Reassembler, ServiceType,
};
use sdl_proxy::rpc::{function_id, MessageKind, RpcEnvelope};
use sdl_proxy::transport::{MemoryPeer, MemoryTransport};
use sdl_proxy::{ChannelDelegate, Connection, ConnectionBuilder, ConnectionEvent, LifecycleState};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::UnboundedReceiver;

pub const RPC_SESSION_ID: u8 = 1;

/// Install a fmt subscriber once so `RUST_LOG` works in tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub connection: Connection,
    pub transport: MemoryTransport,
    pub peer: MemoryPeer,
    pub events: UnboundedReceiver<ConnectionEvent>,
}

/// Connection over a memory transport with a channel delegate attached.
pub fn harness(configure: impl FnOnce(ConnectionBuilder) -> ConnectionBuilder) -> Harness {
    init_tracing();
    let (transport, peer) = MemoryTransport::new(1024 * 1024);
    let (delegate, events) = ChannelDelegate::new();
    let builder = Connection::builder(transport.clone())
        .app(sdl_proxy::AppIdentity::new("Radio", "8675309"))
        .delegate(delegate);
    Harness {
        connection: configure(builder).build(),
        transport,
        peer,
        events,
    }
}

/// Drain events until a state change to `to` shows up.
pub async fn wait_for_state(events: &mut UnboundedReceiver<ConnectionEvent>, to: LifecycleState) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(event) = events.recv().await {
            if let ConnectionEvent::StateChanged { to: reached, .. } = event {
                if reached == to {
                    return;
                }
            }
        }
        panic!("event stream ended before reaching {to}");
    })
    .await
    .expect("state not reached in time");
}

/// All state transitions currently queued.
pub fn drain_states(events: &mut UnboundedReceiver<ConnectionEvent>) -> Vec<LifecycleState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ConnectionEvent::StateChanged { to, .. } = event {
            states.push(to);
        }
    }
    states
}

pub struct HeadUnit {
    stream: DuplexStream,
    frames: FrameBuffer,
    reassembler: Reassembler,
    queue: VecDeque<LogicalMessage>,
    pub version: u8,
    pub session_id: u8,
    message_id: u32,
}

impl HeadUnit {
    pub async fn accept(peer: &mut MemoryPeer) -> Self {
        let stream = tokio::time::timeout(Duration::from_secs(30), peer.accept())
            .await
            .expect("no connection attempt")
            .expect("transport dropped");
        Self {
            stream,
            frames: FrameBuffer::with_max_payload(u32::MAX),
            reassembler: Reassembler::new(u32::MAX),
            queue: VecDeque::new(),
            version: 5,
            session_id: RPC_SESSION_ID,
            message_id: 0,
        }
    }

    /// Next complete logical message sent by the app.
    pub async fn recv(&mut self) -> LogicalMessage {
        self.try_recv().await.expect("app closed the transport")
    }

    /// Next message, or `None` once the app closed the transport.
    pub async fn try_recv(&mut self) -> Option<LogicalMessage> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            if let Some(message) = self.queue.pop_front() {
                return Some(message);
            }
            let n = self.stream.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            for frame in self.frames.push(&buf[..n]) {
                if let Some(message) = self.reassembler.accept(frame.unwrap()).unwrap() {
                    self.queue.push_back(message);
                }
            }
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn write_frames(&mut self, frames: &[Bytes]) {
        for frame in frames {
            self.write(frame).await;
        }
    }

    pub async fn expect_start(&mut self, service: ServiceType) -> LogicalMessage {
        let message = self.recv().await;
        assert!(message.is_control(), "expected control frame");
        assert_eq!(message.frame_info, frame_info::START_SERVICE);
        assert_eq!(message.service_type, service);
        message
    }

    fn control(&self, service: ServiceType, info: u8, session_id: u8) -> Vec<u8> {
        let header = Header::new(self.version, FrameType::Control, service, info, session_id, 0, 0);
        build_frame(&header, &[])
    }

    pub async fn ack_start(&mut self, service: ServiceType, session_id: u8) {
        let frame = self.control(service, frame_info::START_SERVICE_ACK, session_id);
        self.write(&frame).await;
    }

    pub async fn nack_start(&mut self, service: ServiceType) {
        let frame = self.control(service, frame_info::START_SERVICE_NACK, 0);
        self.write(&frame).await;
    }

    pub async fn end_service(&mut self, service: ServiceType, session_id: u8) {
        let frame = self.control(service, frame_info::END_SERVICE, session_id);
        self.write(&frame).await;
    }

    pub async fn heartbeat(&mut self, message_id: u32) {
        let header = Header::new(
            self.version,
            FrameType::Control,
            ServiceType::Control,
            frame_info::HEARTBEAT,
            self.session_id,
            0,
            message_id,
        );
        self.write(&build_frame(&header, &[])).await;
    }

    /// Next RPC request from the app.
    pub async fn expect_request(&mut self) -> RpcEnvelope {
        loop {
            let message = self.recv().await;
            if message.is_control() {
                continue;
            }
            assert_eq!(message.service_type, ServiceType::Rpc);
            let envelope = RpcEnvelope::decode(&message.payload).unwrap();
            if envelope.kind == MessageKind::Request {
                return envelope;
            }
        }
    }

    /// Send an RPC envelope on the RPC session, fragmented to `max_frame_size`.
    pub async fn send_rpc(&mut self, envelope: &RpcEnvelope, max_frame_size: usize) {
        let payload = envelope.encode().unwrap();
        self.send_payload(ServiceType::Rpc, self.session_id, &payload, max_frame_size)
            .await;
    }

    pub async fn send_payload(
        &mut self,
        service: ServiceType,
        session_id: u8,
        payload: &[u8],
        max_frame_size: usize,
    ) {
        self.message_id += 1;
        let spec = FrameSpec::data(self.version, service, session_id, self.message_id);
        let frames = encode(&spec, payload, max_frame_size);
        self.write_frames(&frames).await;
    }

    pub async fn respond(&mut self, request: &RpcEnvelope, success: bool) {
        let correlation_id = request.correlation_id.expect("request without correlation id");
        let response = RpcEnvelope::response(request.function_id, correlation_id)
            .with_param("success", success)
            .with_param("resultCode", if success { "SUCCESS" } else { "REJECTED" });
        self.send_rpc(&response, 1500).await;
    }

    pub async fn hmi_status(&mut self, level: &str) {
        let notification = RpcEnvelope::notification(function_id::ON_HMI_STATUS)
            .with_param("hmiLevel", level)
            .with_param("audioStreamingState", "NOT_AUDIBLE")
            .with_param("systemContext", "MAIN");
        self.send_rpc(&notification, 1500).await;
    }

    /// Answer the RPC start and the registration request.
    pub async fn handshake(&mut self) -> RpcEnvelope {
        self.expect_start(ServiceType::Rpc).await;
        self.ack_start(ServiceType::Rpc, self.session_id).await;
        let registration = self.expect_request().await;
        assert_eq!(registration.function_id, function_id::REGISTER_APP_INTERFACE);
        self.respond(&registration, true).await;
        registration
    }

    /// Start the head unit's side of a session for a streaming service.
    pub async fn accept_service(&mut self, service: ServiceType, session_id: u8) {
        self.expect_start(service).await;
        self.ack_start(service, session_id).await;
    }

    pub fn classify(message: &LogicalMessage) -> ControlEvent {
        ControlEvent::parse(message)
    }

    pub fn heartbeat_bytes(version: u8) -> Bytes {
        control::heartbeat(version, RPC_SESSION_ID)
    }
}

/// Connect `harness.connection` against a head unit that completes the handshake.
pub async fn connect(harness: &mut Harness) -> HeadUnit {
    let connection = harness.connection.clone();
    let connecting = tokio::spawn(async move { connection.connect().await });
    let mut head_unit = HeadUnit::accept(&mut harness.peer).await;
    head_unit.handshake().await;
    connecting.await.unwrap().unwrap();
    head_unit
}
