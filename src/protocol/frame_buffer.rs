//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: need a full header (8 or 12 bytes, by version)
//! - `WaitingForPayload`: header parsed, need N more payload bytes
//!
//! Transport reads may split a frame anywhere, so unconsumed bytes are kept
//! across calls. A header that fails validation is reported once as a
//! [`FramingError`]; the buffer then drops bytes one at a time until the
//! next plausible header lines up.
//!
//! # Example
//!
//! ```
//! use sdl_proxy::protocol::{build_frame, FrameBuffer, FrameType, Header, ServiceType};
//!
//! let header = Header::new(5, FrameType::Single, ServiceType::Rpc, 0, 1, 2, 1);
//! let bytes = build_frame(&header, b"hi");
//!
//! let mut buffer = FrameBuffer::new();
//! buffer.extend(&bytes[..5]);
//! assert!(buffer.frames().next().is_none());
//!
//! buffer.extend(&bytes[5..]);
//! let frame = buffer.frames().next().unwrap().unwrap();
//! assert_eq!(frame.payload(), b"hi");
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::FramingError;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: Header, remaining: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_payload_size: u32,
    /// Set while skipping garbage after a reported framing error.
    resyncing: bool,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    pub fn new() -> Self {
        Self::with_max_payload((DEFAULT_MAX_FRAME_SIZE - HEADER_SIZE) as u32)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
            resyncing: false,
        }
    }

    /// Append data to the buffer without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Lazily pull complete frames out of the buffer.
    ///
    /// The iterator ends when the buffered bytes no longer hold a complete
    /// frame; whatever remains is kept for the next call.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { buffer: self }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Convenience wrapper over [`extend`](Self::extend) +
    /// [`frames`](Self::frames).
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<Frame, FramingError>> {
        self.extend(data);
        self.frames().collect()
    }

    fn try_extract_one(&mut self) -> Option<Result<Frame, FramingError>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let header = match Header::decode(&self.buffer) {
                        Ok(None) => return None,
                        Ok(Some(header)) => match header.validate(self.max_payload_size) {
                            Ok(()) => header,
                            Err(e) => {
                                if let Some(err) = self.skip_garbage(e) {
                                    return Some(Err(err));
                                }
                                continue;
                            }
                        },
                        Err(e) => {
                            if let Some(err) = self.skip_garbage(e) {
                                return Some(Err(err));
                            }
                            continue;
                        }
                    };

                    self.resyncing = false;
                    let _ = self.buffer.split_to(header.encoded_len());

                    if header.payload_length == 0 {
                        return Some(Ok(Frame::new(header, Bytes::new())));
                    }

                    self.state = State::WaitingForPayload {
                        header,
                        remaining: header.payload_length,
                    };
                }

                State::WaitingForPayload { header, remaining } => {
                    let remaining = *remaining as usize;
                    if self.buffer.len() < remaining {
                        return None;
                    }

                    let payload = self.buffer.split_to(remaining).freeze();
                    let header = *header;
                    self.state = State::WaitingForHeader;

                    return Some(Ok(Frame::new(header, payload)));
                }
            }
        }
    }

    /// Drop one byte and report the error if this starts a new garbage run.
    fn skip_garbage(&mut self, err: FramingError) -> Option<FramingError> {
        let _ = self.buffer.split_to(1);
        if self.resyncing {
            return None;
        }
        self.resyncing = true;
        tracing::warn!(error = %err, "framing error, resynchronizing");
        Some(err)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
        self.resyncing = false;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over complete frames in a [`FrameBuffer`].
pub struct Frames<'a> {
    buffer: &'a mut FrameBuffer,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buffer.try_extract_one()
    }
}
