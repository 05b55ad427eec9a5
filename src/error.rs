//! Error types for sdl-proxy.

use thiserror::Error;

use crate::protocol::ServiceType;
use crate::router::DropReason;

/// Malformed input seen by the frame decoder or reassembler.
///
/// Always recoverable: the decoder resynchronizes and keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Header carries a protocol version this implementation cannot parse.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Header carries a service type byte outside the known set.
    #[error("unknown service type 0x{0:02x}")]
    UnknownServiceType(u8),

    /// Header carries a frame type outside control/single/first/consecutive.
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// Declared payload size exceeds the configured maximum.
    #[error("declared payload size {size} exceeds maximum {max}")]
    Oversized { size: u32, max: u32 },

    /// First frame payload is not the 8-byte size/count pair.
    #[error("first frame payload must be 8 bytes, got {0}")]
    MalformedFirstFrame(usize),

    /// Consecutive frame arrived for a message that never had a first frame.
    #[error("consecutive frame for unknown message {message_id} on session {session_id}")]
    OrphanConsecutive { session_id: u8, message_id: u32 },

    /// Consecutive frame names a different service than its first frame.
    #[error("message {message_id} started on {expected:?} but continued on {found:?}")]
    ServiceMismatch {
        message_id: u32,
        expected: ServiceType,
        found: ServiceType,
    },

    /// Accumulated fragments exceed the size declared by the first frame.
    #[error("message {message_id} overflowed declared size {declared}")]
    Overflow { message_id: u32, declared: u32 },
}

/// Main error type for all proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed frame on the wire (recoverable).
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Head unit declined a start-service request.
    #[error("service {service:?} rejected by head unit")]
    ServiceRejected { service: ServiceType },

    /// Head unit never answered a start-service request.
    #[error("no answer to start of service {service:?}")]
    ServiceTimeout { service: ServiceType },

    /// No response arrived before the request deadline.
    #[error("request {correlation_id} timed out")]
    Timeout { correlation_id: u32 },

    /// Request was cancelled locally before a response arrived.
    #[error("request {correlation_id} cancelled")]
    Cancelled { correlation_id: u32 },

    /// Pending work was invalidated because its session closed.
    #[error("session {session_id} closed")]
    ServiceClosed { session_id: u8 },

    /// Transport dropped; every session and pending request was torn down.
    #[error("connection lost")]
    ConnectionLost,

    /// Reconnect attempts exhausted. Terminal.
    #[error("connection failed after {attempts} reconnect attempts")]
    ConnectionFailed { attempts: u32 },

    /// Correlation id is still owned by an outstanding request.
    #[error("correlation id {0} is already outstanding")]
    IdCollision(u32),

    /// RPC payload failed to decode or violated the function schema.
    #[error("invalid RPC payload: {0}")]
    InvalidPayload(String),

    /// Inbound message could not be routed and was discarded.
    #[error("inbound message dropped: {0}")]
    Dropped(DropReason),

    /// Operation needs an active transport.
    #[error("not connected")]
    NotConnected,

    /// Outbound queue stayed full past the backpressure timeout.
    #[error("backpressure timeout")]
    BackpressureTimeout,

    /// Registration RPC returned an unsuccessful result.
    #[error("registration rejected: {result_code}")]
    RegistrationRejected { result_code: String },

    /// I/O error from the transport adapter.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error in RPC parameters.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    /// True for failures that are resolved locally and never end the
    /// connection.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ProxyError::ConnectionLost
                | ProxyError::ConnectionFailed { .. }
                | ProxyError::NotConnected
                | ProxyError::Io(_)
        )
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
