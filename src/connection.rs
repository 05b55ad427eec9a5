//! Connection context: the caller-owned handle that ties the layers together.
//!
//! A [`Connection`] owns, behind one mutex, the session table, the pending
//! request table, the reassembly buffers, the router and the lifecycle
//! state. Three kinds of tasks run per transport link:
//!
//! ```text
//!                 ┌──────────── Connection (Arc<Shared>) ────────────┐
//! Transport ─► read loop ─► FrameBuffer ─► Reassembler ─► Router ─► effects
//!                 │                                                   │
//!                 │        sweeper (interval) ─► sweep_expired        ▼
//!                 │                                  delegate / subscribers
//! callers ─► send_request ─► CorrelationEngine ─► Router ─► writer task ─► Transport
//!                 └───────────────────────────────────────────────────┘
//! ```
//!
//! Table mutations happen under the lock. Delegate callbacks, subscriber
//! delivery and raw sinks run after the lock is released, in arrival order,
//! on the read loop task.
//!
//! # Example
//!
//! ```ignore
//! use sdl_proxy::{AppIdentity, Connection, RpcEnvelope};
//!
//! let connection = Connection::builder(transport)
//!     .app(AppIdentity::new("Radio", "8675309"))
//!     .build();
//!
//! connection.connect().await?;
//! let response = connection
//!     .request(RpcEnvelope::request(40).with_param("number", "5551234"))
//!     .await?;
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{AppIdentity, ConnectionConfig, ReconnectPolicy};
use crate::control::{self, ControlEvent};
use crate::delegate::{ConnectionDelegate, NoopDelegate};
use crate::error::{FramingError, ProxyError, Result};
use crate::lifecycle::{Lifecycle, LifecycleState, ReconnectDecision, Transition};
use crate::protocol::{
    Frame, FrameBuffer, Reassembler, ServiceType, HEADER_SIZE, MIN_PROTOCOL_VERSION,
};
use crate::router::{DropReason, MessageRouter, RawSink, Route};
use crate::rpc::{
    deliver, function_id, CorrelationEngine, FunctionRegistry, Handler, MessageKind,
    ResponseHandle, RpcEnvelope, SharedHandler, SubscriberRegistry, SubscriptionId,
};
use crate::session::{OpenTicket, Session, SessionManager};
use crate::transport::{BoxedReader, Transport};
use crate::writer::{spawn_writer_task, OutboundMessage, WriterHandle};

/// Read buffer size for the transport read loop.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Largest logical message accepted from the head unit.
const MAX_REASSEMBLED_SIZE: u32 = 16 * 1024 * 1024;

/// Builder for a [`Connection`].
pub struct ConnectionBuilder {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    delegate: Arc<dyn ConnectionDelegate>,
    functions: FunctionRegistry,
}

impl ConnectionBuilder {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            config: ConnectionConfig::default(),
            delegate: Arc::new(NoopDelegate),
            functions: FunctionRegistry::with_core_functions(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn app(mut self, app: AppIdentity) -> Self {
        self.config.app = app;
        self
    }

    pub fn delegate<D: ConnectionDelegate>(mut self, delegate: D) -> Self {
        self.delegate = Arc::new(delegate);
        self
    }

    /// Function vocabulary used to validate incoming and outgoing RPCs.
    ///
    /// Default: the functions the connection itself relies on.
    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Default: 10 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Default: 250 ms
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Default: 131084 bytes
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Default: 5
    pub fn max_protocol_version(mut self, version: u8) -> Self {
        self.config.max_protocol_version = version;
        self
    }

    pub fn max_correlation_id(mut self, max: u32) -> Self {
        self.config.max_correlation_id = max;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn build(self) -> Connection {
        let mut config = self.config;
        if let Some(limit) = self.transport.max_frame_size() {
            config.max_frame_size = config.max_frame_size.min(limit);
        }
        config.max_protocol_version = config.max_protocol_version.clamp(
            MIN_PROTOCOL_VERSION,
            crate::protocol::MAX_PROTOCOL_VERSION,
        );

        let core = Core {
            lifecycle: Lifecycle::new(),
            sessions: SessionManager::new(),
            correlation: CorrelationEngine::new(config.request_timeout, config.max_correlation_id),
            subscribers: SubscriberRegistry::new(),
            router: MessageRouter::new(
                self.functions,
                config.max_frame_size,
                config.max_protocol_version,
            ),
            reassembler: Reassembler::new(MAX_REASSEMBLED_SIZE),
            link: None,
            generation: 0,
            closing_requested: false,
            max_version: config.max_protocol_version,
        };

        Connection {
            shared: Arc::new(Shared {
                config,
                transport: self.transport,
                delegate: self.delegate,
                core: Mutex::new(core),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

/// Work to do after the core lock is released.
enum Effect {
    State(Transition),
    Response(RpcEnvelope),
    Notification(RpcEnvelope, Vec<SharedHandler>),
    Raw {
        sink: Arc<dyn RawSink>,
        service: ServiceType,
        session_id: u8,
        payload: Bytes,
    },
    Send(WriterHandle, OutboundMessage),
    Error(ProxyError),
    ForceLoss(u64),
}

/// Tasks and writer of the current transport link.
struct Link {
    writer: WriterHandle,
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Core {
    lifecycle: Lifecycle,
    sessions: SessionManager,
    correlation: CorrelationEngine,
    subscribers: SubscriberRegistry,
    router: MessageRouter,
    reassembler: Reassembler,
    link: Option<Link>,
    /// Bumped for every new link; stale tasks compare against it.
    generation: u64,
    closing_requested: bool,
    max_version: u8,
}

impl Core {
    fn is_current(&self, generation: u64) -> bool {
        self.link.as_ref().is_some_and(|l| l.generation == generation)
    }

    fn writer(&self) -> Result<WriterHandle> {
        self.link
            .as_ref()
            .map(|l| l.writer.clone())
            .ok_or(ProxyError::NotConnected)
    }

    fn advance(&mut self, to: LifecycleState, effects: &mut Vec<Effect>) {
        if let Some(transition) = self.lifecycle.advance(to) {
            effects.push(Effect::State(transition));
        }
    }

    /// Drop the link and clear every table.
    fn teardown(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.link = None;

        let sessions = self.sessions.close_all();
        let failed = self.correlation.fail_all();
        let partial = self.reassembler.in_flight();
        self.reassembler.clear();
        self.router.reset();
        self.router.set_version(self.max_version);

        tracing::info!(
            sessions = sessions.len(),
            failed_requests = failed,
            partial_messages = partial,
            "connection torn down"
        );

        if let Some(transition) = self.lifecycle.disconnected() {
            effects.push(Effect::State(transition));
        }
        effects
    }

    /// Close one session and invalidate the work scoped to it.
    fn close_session(&mut self, service: ServiceType) -> Option<Session> {
        let session = self.sessions.close(service)?;
        if service == ServiceType::Rpc {
            let failed = self.correlation.fail_session(session.id);
            if failed > 0 {
                tracing::debug!(session_id = session.id, failed, "failed requests of closed session");
            }
        }
        self.reassembler.discard_session(session.id, service);
        Some(session)
    }

    fn on_control(&mut self, event: ControlEvent, effects: &mut Vec<Effect>) {
        match event {
            ControlEvent::StartServiceAck {
                service,
                session_id,
                version,
            } => {
                let version = version.clamp(MIN_PROTOCOL_VERSION, self.max_version);
                if self.sessions.on_start_ack(service, session_id, version).is_some()
                    && service == ServiceType::Rpc
                {
                    self.router.set_version(version);
                    self.advance(LifecycleState::VersionNegotiated, effects);
                }
            }
            ControlEvent::StartServiceNack { service } => {
                if self.sessions.on_start_nack(service) {
                    tracing::warn!(?service, "head unit rejected service start");
                }
            }
            ControlEvent::EndService {
                service,
                session_id,
            } => {
                tracing::info!(?service, session_id, "head unit ended service");
                self.close_session(service);
                if let Ok(writer) = self.writer() {
                    let ack = control::end_service_ack(self.router.version(), service, session_id);
                    effects.push(Effect::Send(writer, OutboundMessage::single(ack)));
                }
            }
            ControlEvent::Heartbeat {
                session_id,
                message_id,
            } => {
                if let Ok(writer) = self.writer() {
                    let ack = control::heartbeat_ack(self.router.version(), session_id, message_id);
                    effects.push(Effect::Send(writer, OutboundMessage::single(ack)));
                }
            }
            ControlEvent::EndServiceAck { .. }
            | ControlEvent::EndServiceNack { .. }
            | ControlEvent::HeartbeatAck
            | ControlEvent::ServiceDataAck => {
                tracing::trace!(?event, "control frame");
            }
            ControlEvent::Unhandled(code) => {
                tracing::debug!(code, "ignoring unhandled control frame");
            }
        }
    }

    fn on_route(&mut self, route: Route, generation: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        match route {
            Route::Control(event) => self.on_control(event, &mut effects),
            Route::Response(response) => {
                let registered = response.function_id == function_id::REGISTER_APP_INTERFACE
                    && response.is_success();
                if self.correlation.complete(response.clone()) {
                    if registered {
                        self.advance(LifecycleState::Registered, &mut effects);
                    }
                    effects.push(Effect::Response(response));
                }
            }
            Route::Notification(notification) => {
                match notification.function_id {
                    function_id::ON_HMI_STATUS
                        if self.lifecycle.state() == LifecycleState::Registered =>
                    {
                        self.advance(LifecycleState::Ready, &mut effects);
                    }
                    function_id::ON_APP_INTERFACE_UNREGISTERED => {
                        tracing::warn!(
                            reason = ?notification.params.get("reason"),
                            "head unit unregistered the app"
                        );
                        effects.push(Effect::ForceLoss(generation));
                    }
                    _ => {}
                }
                let handlers = self.subscribers.handlers_for(notification.function_id);
                effects.push(Effect::Notification(notification, handlers));
            }
            Route::Request(request) => {
                tracing::debug!(
                    function_id = request.function_id,
                    "head unit request delivered to subscribers"
                );
                let handlers = self.subscribers.handlers_for(request.function_id);
                effects.push(Effect::Notification(request, handlers));
            }
            Route::Raw {
                sink,
                service,
                session_id,
                payload,
            } => effects.push(Effect::Raw {
                sink,
                service,
                session_id,
                payload,
            }),
            Route::Dropped(DropReason::InvalidRpc {
                reason,
                correlation_id: Some(correlation_id),
            }) if self.correlation.contains(correlation_id) => {
                self.correlation
                    .abandon(correlation_id, ProxyError::InvalidPayload(reason));
            }
            Route::Dropped(reason) => effects.push(Effect::Error(ProxyError::Dropped(reason))),
        }
        // ForceLoss must run after the notification has been delivered.
        effects.sort_by_key(|e| matches!(e, Effect::ForceLoss(_)));
        effects
    }
}

struct Shared {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    delegate: Arc<dyn ConnectionDelegate>,
    core: Mutex<Core>,
    /// Serializes connect, reconnect attempts and disconnect.
    connect_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn run(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::State(t) => self.delegate.on_state_change(t.from, t.to),
                Effect::Response(response) => self.delegate.on_response(&response),
                Effect::Notification(envelope, handlers) => {
                    self.delegate.on_notification(&envelope);
                    deliver(&handlers, &envelope);
                }
                Effect::Raw {
                    sink,
                    service,
                    session_id,
                    payload,
                } => sink.on_data(service, session_id, payload),
                Effect::Send(writer, message) => {
                    if let Err(e) = writer.try_send(message) {
                        tracing::warn!(error = %e, "failed to queue control reply");
                    }
                }
                Effect::Error(error) => self.delegate.on_error(error),
                Effect::ForceLoss(generation) => self.on_transport_lost(generation),
            }
        }
    }

    fn on_frame(self: &Arc<Self>, frame: Frame, generation: u64) {
        let effects = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            if !core.is_current(generation) {
                return;
            }
            match core.reassembler.accept(frame) {
                Ok(Some(message)) => {
                    let route = core.router.dispatch(message, &core.sessions);
                    core.on_route(route, generation)
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed fragment");
                    vec![Effect::Error(ProxyError::Framing(e))]
                }
            }
        };
        self.run(effects);
    }

    /// Report a decoder error seen by the read loop of `generation`.
    fn on_framing_error(self: &Arc<Self>, error: FramingError, generation: u64) {
        if !self.core.lock().is_current(generation) {
            return;
        }
        self.delegate.on_error(ProxyError::Framing(error));
    }

    /// Unexpected loss of the link identified by `generation`.
    fn on_transport_lost(self: &Arc<Self>, generation: u64) {
        let (mut effects, reconnect) = {
            let mut core = self.core.lock();
            if !core.is_current(generation) {
                return;
            }
            let was_registered = core.lifecycle.state().is_registered();
            let closing = core.closing_requested;
            (core.teardown(), was_registered && !closing)
        };
        tracing::warn!(reconnect, "transport lost");
        effects.push(Effect::Error(ProxyError::ConnectionLost));
        self.run(effects);

        if reconnect && self.config.reconnect.enabled {
            tokio::spawn(reconnect_loop(Arc::downgrade(self)));
        }
    }

    /// Tear down a link that failed while being established.
    fn abort_link(self: &Arc<Self>, generation: u64) {
        let effects = {
            let mut core = self.core.lock();
            if !core.is_current(generation) {
                return;
            }
            core.teardown()
        };
        self.run(effects);
    }

    /// Open the transport, negotiate the RPC session and register the app.
    async fn establish(self: &Arc<Self>) -> Result<()> {
        let link = self.transport.connect().await?;
        let (writer, _writer_task) = spawn_writer_task(link.writer, &self.config.writer);

        let (generation, effects) = {
            let mut core = self.core.lock();
            core.generation += 1;
            let generation = core.generation;
            let max_payload = self.config.max_frame_size.saturating_sub(HEADER_SIZE) as u32;

            let read = tokio::spawn(read_loop(
                Arc::downgrade(self),
                link.reader,
                generation,
                max_payload,
            ));
            let sweep = tokio::spawn(sweep_loop(
                Arc::downgrade(self),
                generation,
                self.config.sweep_interval,
            ));
            core.link = Some(Link {
                writer,
                generation,
                tasks: vec![read, sweep],
            });

            let mut effects = Vec::new();
            core.advance(LifecycleState::TransportConnected, &mut effects);
            (generation, effects)
        };
        self.run(effects);

        match self.negotiate_and_register().await {
            Ok(()) => {
                let effects = {
                    let mut core = self.core.lock();
                    core.lifecycle.reset_attempts();
                    let mut effects = Vec::new();
                    core.advance(LifecycleState::Registered, &mut effects);
                    effects
                };
                self.run(effects);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "connection setup failed");
                self.abort_link(generation);
                Err(e)
            }
        }
    }

    async fn negotiate_and_register(self: &Arc<Self>) -> Result<()> {
        let session = self.open_session(ServiceType::Rpc).await?;
        tracing::debug!(
            session_id = session.id,
            version = session.protocol_version,
            "RPC session negotiated"
        );

        let request = self.config.app.registration_request();
        let response = self.send_request(request, None).await?.await?;
        if !response.is_success() {
            return Err(ProxyError::RegistrationRejected {
                result_code: response.result_code().unwrap_or("UNKNOWN").to_string(),
            });
        }
        Ok(())
    }

    async fn open_session(self: &Arc<Self>, service: ServiceType) -> Result<Session> {
        let (ticket, writer, frame) = {
            let mut core = self.core.lock();
            let writer = core.writer()?;
            let session_id = core
                .sessions
                .established(ServiceType::Rpc)
                .map_or(0, |s| s.id);
            let frame = control::start_service(core.router.version(), service, session_id);
            (core.sessions.begin_open(service), writer, frame)
        };

        let rx = match ticket {
            OpenTicket::Ready(session) => return Ok(session),
            OpenTicket::Joined(rx) => rx,
            OpenTicket::Start(rx) => {
                tracing::debug!(?service, "starting service");
                if let Err(e) = writer.send(OutboundMessage::single(frame)).await {
                    self.core
                        .lock()
                        .sessions
                        .fail_pending(service, || ProxyError::NotConnected);
                    return Err(e);
                }
                rx
            }
        };

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProxyError::ConnectionLost),
            Err(_) => {
                self.core
                    .lock()
                    .sessions
                    .fail_pending(service, || ProxyError::ServiceTimeout { service });
                Err(ProxyError::ServiceTimeout { service })
            }
        }
    }

    async fn send_request(
        self: &Arc<Self>,
        mut envelope: RpcEnvelope,
        timeout: Option<Duration>,
    ) -> Result<ResponseHandle> {
        let (writer, message, handle) = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let writer = core.writer()?;
            let session = core
                .sessions
                .established(ServiceType::Rpc)
                .ok_or(ProxyError::NotConnected)?;
            core.router.functions().validate(&envelope)?;

            let handle = core
                .correlation
                .register(&mut envelope, session.id, timeout, Instant::now())?;
            let payload = match envelope.encode() {
                Ok(payload) => payload,
                Err(e) => {
                    core.correlation.abandon(handle.correlation_id(), ProxyError::NotConnected);
                    return Err(e);
                }
            };
            let message = core.router.prepare(ServiceType::Rpc, session.id, &payload);
            (writer, message, handle)
        };

        if let Err(e) = writer.send(message).await {
            self.core
                .lock()
                .correlation
                .abandon(handle.correlation_id(), ProxyError::NotConnected);
            return Err(e);
        }
        Ok(handle)
    }

    /// Frame and queue a payload on an established session.
    async fn send_on(self: &Arc<Self>, service: ServiceType, payload: &[u8]) -> Result<()> {
        let (writer, message) = {
            let mut core = self.core.lock();
            let writer = core.writer()?;
            let session = core
                .sessions
                .established(service)
                .ok_or(ProxyError::NotConnected)?;
            (writer, core.router.prepare(service, session.id, payload))
        };
        writer.send(message).await
    }
}

async fn read_loop(weak: Weak<Shared>, mut reader: BoxedReader, generation: u64, max_payload: u32) {
    let mut frames = FrameBuffer::with_max_payload(max_payload);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(generation, "transport closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(generation, error = %e, "transport read failed");
                break;
            }
        };

        let Some(shared) = weak.upgrade() else {
            return;
        };
        for result in frames.push(&buf[..n]) {
            match result {
                Ok(frame) => shared.on_frame(frame, generation),
                Err(e) => {
                    tracing::debug!(error = %e, "framing error, resynchronizing");
                    shared.on_framing_error(e, generation);
                }
            }
        }
    }

    if let Some(shared) = weak.upgrade() {
        shared.on_transport_lost(generation);
    }
}

async fn sweep_loop(weak: Weak<Shared>, generation: u64, period: Duration) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let mut core = shared.core.lock();
        if !core.is_current(generation) {
            return;
        }
        core.correlation.sweep_expired(Instant::now());
    }
}

async fn reconnect_loop(weak: Weak<Shared>) {
    loop {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let decision = {
            let mut core = shared.core.lock();
            if core.closing_requested {
                return;
            }
            core.lifecycle.next_reconnect(&shared.config.reconnect)
        };

        let delay = match decision {
            ReconnectDecision::Disabled => return,
            ReconnectDecision::GiveUp { attempts } => {
                tracing::error!(attempts, "reconnect attempts exhausted");
                shared
                    .delegate
                    .on_error(ProxyError::ConnectionFailed { attempts });
                return;
            }
            ReconnectDecision::Retry { attempt, delay } => {
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                delay
            }
        };
        drop(shared);

        tokio::time::sleep(delay).await;

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let _guard = shared.connect_lock.lock().await;
        {
            let core = shared.core.lock();
            if core.closing_requested || core.lifecycle.state() != LifecycleState::Disconnected {
                return;
            }
        }
        match shared.establish().await {
            Ok(()) => {
                tracing::info!("reconnected");
                return;
            }
            Err(e) => tracing::warn!(error = %e, "reconnect attempt failed"),
        }
    }
}

/// Caller-owned connection to one head unit.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn builder<T: Transport>(transport: T) -> ConnectionBuilder {
        ConnectionBuilder::new(transport)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Connect, negotiate the protocol version and register the app.
    ///
    /// Resolves once the connection is `Registered`. `Ready` is reported
    /// later through the delegate. Does nothing if already registered.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.shared.connect_lock.lock().await;
        {
            let mut core = self.shared.core.lock();
            if core.lifecycle.state().is_registered() {
                return Ok(());
            }
            core.closing_requested = false;
            core.lifecycle.reset_attempts();
        }
        self.shared.establish().await
    }

    /// User-initiated shutdown. Never triggers a reconnect.
    ///
    /// Unregisters the app and ends every session on a best-effort basis,
    /// then fails everything still pending with `ConnectionLost`.
    pub async fn disconnect(&self) -> Result<()> {
        self.shared.core.lock().closing_requested = true;
        let _guard = self.shared.connect_lock.lock().await;

        let registered = {
            let mut core = self.shared.core.lock();
            if core.link.is_none() {
                return Ok(());
            }
            let registered = core.lifecycle.state().is_registered();
            let mut effects = Vec::new();
            core.advance(LifecycleState::Closing, &mut effects);
            drop(core);
            self.shared.run(effects);
            registered
        };

        if registered {
            let unregister = RpcEnvelope::request(function_id::UNREGISTER_APP_INTERFACE);
            match self.shared.send_request(unregister, None).await {
                Ok(handle) => {
                    if let Err(e) = handle.await {
                        tracing::debug!(error = %e, "unregister did not complete");
                    }
                }
                Err(e) => tracing::debug!(error = %e, "unregister not sent"),
            }
        }

        let effects = {
            let mut core = self.shared.core.lock();
            let version = core.router.version();
            if let Ok(writer) = core.writer() {
                for service in [
                    ServiceType::Audio,
                    ServiceType::Video,
                    ServiceType::BulkData,
                    ServiceType::Rpc,
                ] {
                    if let Some(session) = core.close_session(service) {
                        let end = control::end_service(version, service, session.id);
                        if let Err(e) = writer.try_send(OutboundMessage::single(end)) {
                            tracing::debug!(?service, error = %e, "end service not queued");
                        }
                    }
                }
            }
            core.teardown()
        };
        self.shared.run(effects);

        self.shared.transport.disconnect().await
    }

    pub fn current_state(&self) -> LifecycleState {
        self.shared.core.lock().lifecycle.state()
    }

    /// Send a request and return a handle that resolves to its response.
    ///
    /// `timeout` overrides the configured default deadline.
    pub async fn send_request(
        &self,
        envelope: RpcEnvelope,
        timeout: Option<Duration>,
    ) -> Result<ResponseHandle> {
        self.shared.send_request(envelope, timeout).await
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, envelope: RpcEnvelope) -> Result<RpcEnvelope> {
        self.send_request(envelope, None).await?.await
    }

    /// Fire-and-forget notification to the head unit.
    pub async fn send_notification(&self, envelope: RpcEnvelope) -> Result<()> {
        if envelope.kind != MessageKind::Notification {
            return Err(ProxyError::InvalidPayload(format!(
                "expected a notification, got {:?}",
                envelope.kind
            )));
        }
        self.shared.core.lock().router.functions().validate(&envelope)?;
        let payload = envelope.encode()?;
        self.shared.send_on(ServiceType::Rpc, &payload).await
    }

    /// Complete a pending request locally with `Cancelled`.
    pub fn cancel(&self, correlation_id: u32) -> bool {
        self.shared.core.lock().correlation.cancel(correlation_id)
    }

    pub fn subscribe<H: Handler>(&self, function_id: u32, handler: H) -> SubscriptionId {
        self.shared.core.lock().subscribers.subscribe(function_id, handler)
    }

    /// Subscribe with parameters deserialized into `T`.
    pub fn subscribe_typed<F, T>(&self, function_id: u32, handler: F) -> SubscriptionId
    where
        F: Fn(T) + Send + Sync + 'static,
        T: DeserializeOwned + 'static,
    {
        self.shared
            .core
            .lock()
            .subscribers
            .subscribe_typed(function_id, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.core.lock().subscribers.unsubscribe(id)
    }

    /// Open (or join) the session for a service.
    pub async fn open_session(&self, service: ServiceType) -> Result<Session> {
        self.shared.open_session(service).await
    }

    /// End a service. Local state changes immediately; the end-service frame
    /// is best-effort.
    pub async fn close_session(&self, service: ServiceType) -> Result<()> {
        let (writer, frame) = {
            let mut core = self.shared.core.lock();
            let Some(session) = core.close_session(service) else {
                return Ok(());
            };
            let frame = control::end_service(core.router.version(), service, session.id);
            (core.writer(), frame)
        };

        if let Ok(writer) = writer {
            if let Err(e) = writer.send(OutboundMessage::single(frame)).await {
                tracing::debug!(?service, error = %e, "end service not sent");
            }
        }
        Ok(())
    }

    /// Route incoming audio, video or bulk traffic to `sink`.
    pub fn register_raw_sink<S: RawSink>(&self, service: ServiceType, sink: S) {
        self.shared
            .core
            .lock()
            .router
            .register_sink(service, Arc::new(sink));
    }

    /// Send raw bytes on an established streaming session.
    pub async fn send_raw(&self, service: ServiceType, payload: &[u8]) -> Result<()> {
        self.shared.send_on(service, payload).await
    }

    pub fn pending_count(&self) -> usize {
        self.shared.core.lock().correlation.pending_count()
    }

    /// Current session for a service, if any.
    pub fn session(&self, service: ServiceType) -> Option<Session> {
        self.shared.core.lock().sessions.get(service)
    }

    /// Protocol version in use for outbound frames.
    pub fn protocol_version(&self) -> u8 {
        self.shared.core.lock().router.version()
    }
}
