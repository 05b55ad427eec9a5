//! Frame struct with typed accessors.
//!
//! Represents one unit of the wire protocol: header plus payload fragment.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use sdl_proxy::protocol::{Frame, FrameType, Header, ServiceType};
//! use bytes::Bytes;
//!
//! let header = Header::new(5, FrameType::Single, ServiceType::Rpc, 0, 1, 5, 42);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.session_id(), 1);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{FrameType, Header, ServiceType};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    #[inline]
    pub fn service_type(&self) -> ServiceType {
        self.header.service_type
    }

    #[inline]
    pub fn session_id(&self) -> u8 {
        self.header.session_id
    }

    #[inline]
    pub fn message_id(&self) -> u32 {
        self.header.message_id
    }

    #[inline]
    pub fn frame_info(&self) -> u8 {
        self.header.frame_info
    }

    /// Serialize header and payload into one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(build_frame(&self.header, &self.payload))
    }
}

/// Build a complete frame as a single byte vector.
///
/// # Example
///
/// ```
/// use sdl_proxy::protocol::{build_frame, FrameType, Header, ServiceType, HEADER_SIZE};
///
/// let header = Header::new(5, FrameType::Single, ServiceType::Rpc, 0, 1, 5, 42);
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), HEADER_SIZE + 5);
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let header_len = header.encoded_len();
    let mut buf = vec![0u8; header_len + payload.len()];
    header.encode_into(&mut buf[..header_len]);
    buf[header_len..].copy_from_slice(payload);
    buf
}
