//! Message router: outbound framing and inbound dispatch.
//!
//! Outbound, a payload is fragmented into frames and packed into one
//! [`OutboundMessage`] so the writer task emits it contiguously. Inbound,
//! every reassembled [`LogicalMessage`] is classified into a [`Route`]:
//!
//! ```text
//! control service / control frame ─► Route::Control
//! RPC service, known session      ─► Route::Response | Route::Notification | Route::Request
//! audio/video/bulk, known session ─► Route::Raw (registered sink)
//! anything else                   ─► Route::Dropped (reported to the delegate)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::control::ControlEvent;
use crate::protocol::{encode, FrameSpec, LogicalMessage, ServiceType, DEFAULT_MAX_FRAME_SIZE};
use crate::rpc::{FunctionRegistry, MessageKind, RpcEnvelope};
use crate::session::SessionManager;
use crate::writer::OutboundMessage;

/// Consumer of raw audio, video or bulk-data traffic.
pub trait RawSink: Send + Sync + 'static {
    fn on_data(&self, service: ServiceType, session_id: u8, payload: Bytes);
}

impl<F> RawSink for F
where
    F: Fn(ServiceType, u8, Bytes) + Send + Sync + 'static,
{
    fn on_data(&self, service: ServiceType, session_id: u8, payload: Bytes) {
        self(service, session_id, payload)
    }
}

/// Where an inbound logical message goes.
pub enum Route {
    Control(ControlEvent),
    Response(RpcEnvelope),
    Notification(RpcEnvelope),
    /// Request initiated by the head unit.
    Request(RpcEnvelope),
    Raw {
        sink: Arc<dyn RawSink>,
        service: ServiceType,
        session_id: u8,
        payload: Bytes,
    },
    Dropped(DropReason),
}

/// Why a message was not routed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DropReason {
    #[error("no {service:?} session with id {session_id}")]
    UnknownSession { service: ServiceType, session_id: u8 },
    #[error("no sink registered for {0:?}")]
    NoSink(ServiceType),
    /// `correlation_id` is set when a response decoded but broke its schema.
    #[error("invalid RPC message: {reason}")]
    InvalidRpc {
        reason: String,
        correlation_id: Option<u32>,
    },
}

/// Per-connection routing state.
pub struct MessageRouter {
    functions: FunctionRegistry,
    sinks: HashMap<ServiceType, Arc<dyn RawSink>>,
    message_ids: HashMap<u8, u32>,
    max_frame_size: usize,
    version: u8,
}

impl MessageRouter {
    pub fn new(functions: FunctionRegistry, max_frame_size: usize, version: u8) -> Self {
        Self {
            functions,
            sinks: HashMap::new(),
            message_ids: HashMap::new(),
            max_frame_size,
            version,
        }
    }

    /// Protocol version used for outbound frames.
    #[inline]
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn set_version(&mut self, version: u8) {
        self.version = version;
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Register the sink for a streaming service, replacing any previous one.
    pub fn register_sink(&mut self, service: ServiceType, sink: Arc<dyn RawSink>) {
        self.sinks.insert(service, sink);
    }

    /// Frame a payload for `service` on `session_id`.
    ///
    /// Allocates the next message id for the session; every frame of the
    /// message carries it.
    pub fn prepare(&mut self, service: ServiceType, session_id: u8, payload: &[u8]) -> OutboundMessage {
        let message_id = self.next_message_id(session_id);
        let spec = FrameSpec::data(self.version, service, session_id, message_id);
        let frames = encode(&spec, payload, self.max_frame_size);
        tracing::trace!(
            ?service,
            session_id,
            message_id,
            frames = frames.len(),
            len = payload.len(),
            "framed outbound message"
        );
        OutboundMessage::new(frames)
    }

    fn next_message_id(&mut self, session_id: u8) -> u32 {
        let counter = self.message_ids.entry(session_id).or_insert(0);
        *counter = counter.wrapping_add(1).max(1);
        *counter
    }

    /// Forget per-session message counters, e.g. after teardown.
    pub fn reset(&mut self) {
        self.message_ids.clear();
    }

    /// Classify an inbound logical message.
    pub fn dispatch(&self, message: LogicalMessage, sessions: &SessionManager) -> Route {
        if message.is_control() || message.service_type == ServiceType::Control {
            return Route::Control(ControlEvent::parse(&message));
        }

        let service = message.service_type;
        let session_id = message.session_id;
        if sessions.lookup(session_id, service).is_none() {
            tracing::warn!(?service, session_id, "dropping traffic for unknown session");
            return Route::Dropped(DropReason::UnknownSession {
                service,
                session_id,
            });
        }

        if service == ServiceType::Rpc {
            return self.dispatch_rpc(&message.payload);
        }

        match self.sinks.get(&service) {
            Some(sink) => Route::Raw {
                sink: sink.clone(),
                service,
                session_id,
                payload: message.payload,
            },
            None => {
                tracing::warn!(?service, session_id, "no sink registered, dropping payload");
                Route::Dropped(DropReason::NoSink(service))
            }
        }
    }

    fn dispatch_rpc(&self, payload: &Bytes) -> Route {
        let envelope = match RpcEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable RPC message");
                return Route::Dropped(DropReason::InvalidRpc {
                    reason: e.to_string(),
                    correlation_id: None,
                });
            }
        };
        if let Err(e) = self.functions.validate(&envelope) {
            tracing::warn!(
                error = %e,
                function_id = envelope.function_id,
                correlation_id = ?envelope.correlation_id,
                "dropping RPC message that breaks its schema"
            );
            let correlation_id = match envelope.kind {
                MessageKind::Response => envelope.correlation_id,
                _ => None,
            };
            return Route::Dropped(DropReason::InvalidRpc {
                reason: e.to_string(),
                correlation_id,
            });
        }

        match envelope.kind {
            MessageKind::Response => Route::Response(envelope),
            MessageKind::Notification => Route::Notification(envelope),
            MessageKind::Request => Route::Request(envelope),
        }
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new(
            FunctionRegistry::with_core_functions(),
            DEFAULT_MAX_FRAME_SIZE,
            crate::protocol::MAX_PROTOCOL_VERSION,
        )
    }
}
