//! Wire format encoding and decoding.
//!
//! Implements the frame header:
//! ```text
//! ┌─────────────────────┬─────────┬────────────┬─────────┬───────────┬────────────┐
//! │ Ver │ E │ FrameType │ Service │ Frame Info │ Session │ Data Size │ Message ID │
//! │ 4b  │1b │ 3b        │ 1 byte  │ 1 byte     │ 1 byte  │ u32 BE    │ u32 BE     │
//! └─────────────────────┴─────────┴────────────┴─────────┴───────────┴────────────┘
//! ```
//!
//! Version 1 headers stop after the data size (8 bytes). Versions 2 and up
//! append the message id (12 bytes). All multi-byte integers are Big Endian.

use crate::error::FramingError;

/// Header size for protocol version 1.
pub const V1_HEADER_SIZE: usize = 8;

/// Header size for protocol versions 2 and later.
pub const HEADER_SIZE: usize = 12;

/// Lowest protocol version understood by the decoder.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Highest protocol version understood by the decoder.
pub const MAX_PROTOCOL_VERSION: u8 = 5;

/// Default maximum frame size on the wire (128 KiB payload + header).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 128 * 1024 + HEADER_SIZE;

/// Payload size of a first frame: total size + consecutive frame count.
pub const FIRST_FRAME_PAYLOAD_SIZE: usize = 8;

/// Frame info values carried by control frames.
pub mod frame_info {
    pub const HEARTBEAT: u8 = 0x00;
    pub const START_SERVICE: u8 = 0x01;
    pub const START_SERVICE_ACK: u8 = 0x02;
    pub const START_SERVICE_NACK: u8 = 0x03;
    pub const END_SERVICE: u8 = 0x04;
    pub const END_SERVICE_ACK: u8 = 0x05;
    pub const END_SERVICE_NACK: u8 = 0x06;
    pub const SERVICE_DATA_ACK: u8 = 0xFE;
    pub const HEARTBEAT_ACK: u8 = 0xFF;

    /// Frame info of the last consecutive frame of a message.
    pub const FINAL_CONSECUTIVE: u8 = 0x00;
}

/// Kind of frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Control = 0x00,
    Single = 0x01,
    First = 0x02,
    Consecutive = 0x03,
}

impl TryFrom<u8> for FrameType {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Control),
            0x01 => Ok(Self::Single),
            0x02 => Ok(Self::First),
            0x03 => Ok(Self::Consecutive),
            other => Err(FramingError::UnknownFrameType(other)),
        }
    }
}

/// Category of traffic carried by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ServiceType {
    Control = 0x00,
    Rpc = 0x07,
    Audio = 0x0A,
    Video = 0x0B,
    BulkData = 0x0F,
}

impl ServiceType {
    /// Streaming services carry raw bytes instead of RPC envelopes.
    #[inline]
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Audio | Self::Video)
    }
}

impl TryFrom<u8> for ServiceType {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Control),
            0x07 => Ok(Self::Rpc),
            0x0A => Ok(Self::Audio),
            0x0B => Ok(Self::Video),
            0x0F => Ok(Self::BulkData),
            other => Err(FramingError::UnknownServiceType(other)),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version (1-5).
    pub version: u8,
    /// Payload is encrypted.
    pub encrypted: bool,
    pub frame_type: FrameType,
    pub service_type: ServiceType,
    /// Control code, consecutive sequence number, or 0.
    pub frame_info: u8,
    pub session_id: u8,
    /// Declared payload length in bytes.
    pub payload_length: u32,
    /// Message id (always 0 for version 1).
    pub message_id: u32,
}

impl Header {
    /// Create a new unencrypted header.
    pub fn new(
        version: u8,
        frame_type: FrameType,
        service_type: ServiceType,
        frame_info: u8,
        session_id: u8,
        payload_length: u32,
        message_id: u32,
    ) -> Self {
        Self {
            version,
            encrypted: false,
            frame_type,
            service_type,
            frame_info,
            session_id,
            payload_length,
            message_id,
        }
    }

    /// Number of bytes this header occupies on the wire.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        header_size(self.version)
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use sdl_proxy::protocol::{FrameType, Header, ServiceType};
    ///
    /// let header = Header::new(5, FrameType::Single, ServiceType::Rpc, 0, 1, 100, 7);
    /// assert_eq!(header.encode().len(), 12);
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `encoded_len()`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= self.encoded_len());
        let encryption = if self.encrypted { 0b0000_1000 } else { 0 };
        buf[0] = (self.version << 4) | encryption | (self.frame_type as u8 & 0b0000_0111);
        buf[1] = self.service_type as u8;
        buf[2] = self.frame_info;
        buf[3] = self.session_id;
        buf[4..8].copy_from_slice(&self.payload_length.to_be_bytes());
        if self.version > 1 {
            buf[8..12].copy_from_slice(&self.message_id.to_be_bytes());
        }
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `Ok(None)` if the buffer does not yet hold a full header.
    ///
    /// # Example
    ///
    /// ```
    /// use sdl_proxy::protocol::{FrameType, Header, ServiceType};
    ///
    /// let bytes = [0x51, 0x07, 0x00, 0x03, 0, 0, 0, 4, 0, 0, 0, 9];
    /// let header = Header::decode(&bytes).unwrap().unwrap();
    /// assert_eq!(header.version, 5);
    /// assert_eq!(header.frame_type, FrameType::Single);
    /// assert_eq!(header.service_type, ServiceType::Rpc);
    /// assert_eq!(header.session_id, 3);
    /// assert_eq!(header.message_id, 9);
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Option<Self>, FramingError> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        let version = first >> 4;
        if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&version) {
            return Err(FramingError::UnsupportedVersion(version));
        }

        let size = header_size(version);
        if buf.len() < size {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(first & 0b0000_0111)?;
        let service_type = ServiceType::try_from(buf[1])?;
        let message_id = if version > 1 {
            u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]])
        } else {
            0
        };

        Ok(Some(Self {
            version,
            encrypted: first & 0b0000_1000 != 0,
            frame_type,
            service_type,
            frame_info: buf[2],
            session_id: buf[3],
            payload_length: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            message_id,
        }))
    }

    /// Validate the declared payload size against a maximum.
    pub fn validate(&self, max_payload_size: u32) -> Result<(), FramingError> {
        if self.payload_length > max_payload_size {
            return Err(FramingError::Oversized {
                size: self.payload_length,
                max: max_payload_size,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.frame_type == FrameType::Control
    }

    /// Check if this consecutive frame closes its message.
    #[inline]
    pub fn is_final_consecutive(&self) -> bool {
        self.frame_type == FrameType::Consecutive
            && self.frame_info == frame_info::FINAL_CONSECUTIVE
    }
}

/// Header size in bytes for a protocol version.
#[inline]
pub fn header_size(version: u8) -> usize {
    if version <= 1 {
        V1_HEADER_SIZE
    } else {
        HEADER_SIZE
    }
}
