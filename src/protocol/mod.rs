//! Protocol module - wire format, framing, fragmentation and reassembly.
//!
//! This module implements the binary frame codec:
//! - 8/12-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads, with resync on garbage
//! - Fragmentation into first/consecutive frames and keyed reassembly

mod fragment;
mod frame;
mod frame_buffer;
mod wire_format;

pub use fragment::{encode, FrameSpec, LogicalMessage, Reassembler};
pub use frame::{build_frame, Frame};
pub use frame_buffer::{FrameBuffer, Frames};
pub use wire_format::{
    frame_info, header_size, FrameType, Header, ServiceType, DEFAULT_MAX_FRAME_SIZE,
    FIRST_FRAME_PAYLOAD_SIZE, HEADER_SIZE, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION,
    V1_HEADER_SIZE,
};
