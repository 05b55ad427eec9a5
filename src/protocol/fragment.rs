//! Fragmentation of large logical messages and their reassembly.
//!
//! A payload that does not fit the transport's maximum frame size is split
//! into a first frame followed by consecutive frames:
//!
//! ```text
//! First        info=0      [total size u32][frame count u32]
//! Consecutive  info=1      payload part 1
//! Consecutive  info=2      payload part 2
//! ...
//! Consecutive  info=0      payload part N (final)
//! ```
//!
//! Sequence numbers wrap from 255 back to 1; 0 always marks the final frame.
//! The receiver keys partial messages by (session id, service, message id).

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use super::wire_format::{
    frame_info, header_size, FrameType, Header, ServiceType, FIRST_FRAME_PAYLOAD_SIZE,
};
use super::{build_frame, Frame};
use crate::error::FramingError;

/// Addressing for one outbound logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    pub version: u8,
    pub session_id: u8,
    pub service_type: ServiceType,
    /// `Control` or `Single`; `Single` is promoted to first/consecutive
    /// frames when the payload is too large.
    pub frame_type: FrameType,
    /// Control code for control frames, ignored otherwise.
    pub frame_info: u8,
    pub message_id: u32,
    pub encrypted: bool,
}

impl FrameSpec {
    /// Parameters for a data message on a session.
    pub fn data(version: u8, service_type: ServiceType, session_id: u8, message_id: u32) -> Self {
        Self {
            version,
            session_id,
            service_type,
            frame_type: FrameType::Single,
            frame_info: 0,
            message_id,
            encrypted: false,
        }
    }

    /// Parameters for a control frame.
    pub fn control(
        version: u8,
        service_type: ServiceType,
        session_id: u8,
        info: u8,
        message_id: u32,
    ) -> Self {
        Self {
            version,
            session_id,
            service_type,
            frame_type: FrameType::Control,
            frame_info: info,
            message_id,
            encrypted: false,
        }
    }

    fn header(&self, frame_type: FrameType, info: u8, len: usize) -> Header {
        let mut header = Header::new(
            self.version,
            frame_type,
            self.service_type,
            info,
            self.session_id,
            len as u32,
            self.message_id,
        );
        header.encrypted = self.encrypted;
        header
    }
}

/// Encode a logical payload into an ordered sequence of wire frames.
///
/// Pure function. Control frames are never fragmented.
///
/// # Example
///
/// ```
/// use sdl_proxy::protocol::{encode, FrameSpec, ServiceType, HEADER_SIZE};
///
/// let spec = FrameSpec::data(5, ServiceType::Rpc, 1, 1);
/// let frames = encode(&spec, &[7u8; 100], HEADER_SIZE + 40);
/// // first frame + ceil(100 / 40) consecutive frames
/// assert_eq!(frames.len(), 4);
/// ```
pub fn encode(spec: &FrameSpec, payload: &[u8], max_frame_size: usize) -> Vec<Bytes> {
    let header_len = header_size(spec.version);
    let capacity = max_frame_size.saturating_sub(header_len).max(1);

    if spec.frame_type == FrameType::Control || payload.len() <= capacity {
        let header = spec.header(spec.frame_type, spec.frame_info, payload.len());
        return vec![Bytes::from(build_frame(&header, payload))];
    }

    let chunks: Vec<&[u8]> = payload.chunks(capacity).collect();
    let total = chunks.len();

    let mut first_payload = [0u8; FIRST_FRAME_PAYLOAD_SIZE];
    first_payload[..4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    first_payload[4..].copy_from_slice(&(total as u32).to_be_bytes());

    let mut frames = Vec::with_capacity(total + 1);
    let first = spec.header(FrameType::First, 0, FIRST_FRAME_PAYLOAD_SIZE);
    frames.push(Bytes::from(build_frame(&first, &first_payload)));

    for (i, chunk) in chunks.into_iter().enumerate() {
        let info = if i + 1 == total {
            frame_info::FINAL_CONSECUTIVE
        } else {
            (i % 255) as u8 + 1
        };
        let header = spec.header(FrameType::Consecutive, info, chunk.len());
        frames.push(Bytes::from(build_frame(&header, chunk)));
    }

    frames
}

/// A complete logical message, reassembled from one or more frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    pub version: u8,
    pub encrypted: bool,
    /// `Control` for control frames, `Single` for data of any size.
    pub frame_type: FrameType,
    pub service_type: ServiceType,
    pub frame_info: u8,
    pub session_id: u8,
    pub message_id: u32,
    pub payload: Bytes,
}

impl LogicalMessage {
    fn from_frame(frame: Frame) -> Self {
        let Frame { header, payload } = frame;
        Self {
            version: header.version,
            encrypted: header.encrypted,
            frame_type: header.frame_type,
            service_type: header.service_type,
            frame_info: header.frame_info,
            session_id: header.session_id,
            message_id: header.message_id,
            payload,
        }
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.frame_type == FrameType::Control
    }
}

struct Partial {
    first: Header,
    declared: u32,
    buffer: BytesMut,
}

/// Partial messages are keyed by session id, service and message id.
type Key = (u8, ServiceType, u32);

/// Reassembly table for incoming multi-frame messages.
pub struct Reassembler {
    partial: HashMap<Key, Partial>,
    max_message_size: u32,
}

impl Reassembler {
    pub fn new(max_message_size: u32) -> Self {
        Self {
            partial: HashMap::new(),
            max_message_size,
        }
    }

    /// Feed one decoded frame.
    ///
    /// Returns `Ok(Some(message))` exactly once per logical message, when the
    /// accumulated size reaches the declared size or the final frame lands.
    pub fn accept(&mut self, frame: Frame) -> Result<Option<LogicalMessage>, FramingError> {
        match frame.header.frame_type {
            FrameType::Control | FrameType::Single => Ok(Some(LogicalMessage::from_frame(frame))),
            FrameType::First => self.start(frame),
            FrameType::Consecutive => self.append(frame),
        }
    }

    fn start(&mut self, frame: Frame) -> Result<Option<LogicalMessage>, FramingError> {
        if frame.payload.len() != FIRST_FRAME_PAYLOAD_SIZE {
            return Err(FramingError::MalformedFirstFrame(frame.payload.len()));
        }
        let p = &frame.payload;
        let declared = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
        let frame_count = u32::from_be_bytes([p[4], p[5], p[6], p[7]]);
        if declared > self.max_message_size {
            return Err(FramingError::Oversized {
                size: declared,
                max: self.max_message_size,
            });
        }

        let mut first = frame.header;
        first.frame_type = FrameType::Single;

        if declared == 0 {
            return Ok(Some(Self::finish(first, BytesMut::new())));
        }

        let key = (first.session_id, first.service_type, first.message_id);
        tracing::trace!(
            session_id = first.session_id,
            service = ?first.service_type,
            message_id = first.message_id,
            declared,
            frame_count,
            "reassembly started"
        );
        let replaced = self.partial.insert(
            key,
            Partial {
                first,
                declared,
                buffer: BytesMut::with_capacity(declared as usize),
            },
        );
        if replaced.is_some() {
            tracing::warn!(
                session_id = key.0,
                service = ?key.1,
                message_id = key.2,
                "first frame restarted an unfinished message"
            );
        }
        Ok(None)
    }

    fn append(&mut self, frame: Frame) -> Result<Option<LogicalMessage>, FramingError> {
        let (session_id, service, message_id) = (
            frame.header.session_id,
            frame.header.service_type,
            frame.header.message_id,
        );
        let key = (session_id, service, message_id);
        let Some(partial) = self.partial.get_mut(&key) else {
            let started_as = self
                .partial
                .keys()
                .find(|(sid, _, mid)| *sid == session_id && *mid == message_id)
                .map(|(_, s, _)| *s);
            return Err(match started_as {
                Some(expected) => FramingError::ServiceMismatch {
                    message_id,
                    expected,
                    found: service,
                },
                None => FramingError::OrphanConsecutive {
                    session_id,
                    message_id,
                },
            });
        };

        partial.buffer.extend_from_slice(&frame.payload);
        let accumulated = partial.buffer.len();

        if accumulated > partial.declared as usize {
            let declared = partial.declared;
            self.partial.remove(&key);
            return Err(FramingError::Overflow {
                message_id,
                declared,
            });
        }

        if accumulated == partial.declared as usize || frame.header.is_final_consecutive() {
            if let Some(done) = self.partial.remove(&key) {
                if done.buffer.len() != done.declared as usize {
                    tracing::warn!(
                        session_id,
                        ?service,
                        message_id,
                        declared = done.declared,
                        received = done.buffer.len(),
                        "final frame arrived before declared size was reached"
                    );
                }
                return Ok(Some(Self::finish(done.first, done.buffer)));
            }
        }

        Ok(None)
    }

    fn finish(first: Header, buffer: BytesMut) -> LogicalMessage {
        LogicalMessage {
            version: first.version,
            encrypted: first.encrypted,
            frame_type: FrameType::Single,
            service_type: first.service_type,
            frame_info: 0,
            session_id: first.session_id,
            message_id: first.message_id,
            payload: buffer.freeze(),
        }
    }

    /// Drop every partial message of one service on a session.
    pub fn discard_session(&mut self, session_id: u8, service: ServiceType) -> usize {
        let before = self.partial.len();
        self.partial
            .retain(|(sid, svc, _), _| !(*sid == session_id && *svc == service));
        before - self.partial.len()
    }

    /// Number of messages currently being reassembled.
    pub fn in_flight(&self) -> usize {
        self.partial.len()
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameBuffer, HEADER_SIZE};

    fn decode_all(frames: &[Bytes]) -> Vec<Frame> {
        let mut buffer = FrameBuffer::with_max_payload(u32::MAX);
        let mut out = Vec::new();
        for f in frames {
            out.extend(buffer.push(f).into_iter().map(|r| r.unwrap()));
        }
        out
    }

    #[test]
    fn test_small_payload_single_frame() {
        let spec = FrameSpec::data(5, ServiceType::Rpc, 1, 9);
        let frames = encode(&spec, b"small", 1500);
        assert_eq!(frames.len(), 1);

        let decoded = decode_all(&frames);
        assert_eq!(decoded[0].frame_type(), FrameType::Single);
        assert_eq!(decoded[0].payload(), b"small");
    }

    #[test]
    fn test_large_payload_fragment_layout() {
        let spec = FrameSpec::data(5, ServiceType::BulkData, 2, 3);
        let data = vec![0xAA; 250];
        let frames = decode_all(&encode(&spec, &data, HEADER_SIZE + 100));

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].frame_type(), FrameType::First);
        assert_eq!(&frames[0].payload()[..4], &250u32.to_be_bytes());
        assert_eq!(&frames[0].payload()[4..], &3u32.to_be_bytes());
        assert_eq!(frames[1].frame_info(), 1);
        assert_eq!(frames[2].frame_info(), 2);
        assert_eq!(frames[3].frame_info(), frame_info::FINAL_CONSECUTIVE);
        assert!(frames[1..].iter().all(|f| f.message_id() == 3));
    }

    #[test]
    fn test_sequence_number_wraps_to_one() {
        let spec = FrameSpec::data(5, ServiceType::BulkData, 1, 1);
        let data = vec![1u8; 300];
        let frames = decode_all(&encode(&spec, &data, HEADER_SIZE + 1));

        assert_eq!(frames[255].frame_info(), 255);
        assert_eq!(frames[256].frame_info(), 1);
        assert_eq!(frames.last().unwrap().frame_info(), 0);
    }

    #[test]
    fn test_control_frames_never_fragment() {
        let spec = FrameSpec::control(5, ServiceType::Rpc, 0, frame_info::START_SERVICE, 1);
        let frames = encode(&spec, &[0u8; 64], HEADER_SIZE + 8);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_reassembly_roundtrip() {
        let spec = FrameSpec::data(5, ServiceType::Rpc, 7, 12);
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let frames = decode_all(&encode(&spec, &data, HEADER_SIZE + 64));

        let mut reassembler = Reassembler::new(u32::MAX);
        let mut done = Vec::new();
        for frame in frames {
            if let Some(msg) = reassembler.accept(frame).unwrap() {
                done.push(msg);
            }
        }

        assert_eq!(done.len(), 1);
        assert_eq!(&done[0].payload[..], &data[..]);
        assert_eq!(done[0].session_id, 7);
        assert_eq!(reassembler.in_flight(), 0);
    }

    #[test]
    fn test_interleaved_messages_on_different_keys() {
        let a = FrameSpec::data(5, ServiceType::Rpc, 1, 1);
        let b = FrameSpec::data(5, ServiceType::Rpc, 1, 2);
        let fa = decode_all(&encode(&a, &[1u8; 30], HEADER_SIZE + 10));
        let fb = decode_all(&encode(&b, &[2u8; 30], HEADER_SIZE + 10));

        let mut reassembler = Reassembler::new(u32::MAX);
        let mut done = Vec::new();
        for (x, y) in fa.into_iter().zip(fb) {
            done.extend(reassembler.accept(x).unwrap());
            done.extend(reassembler.accept(y).unwrap());
        }

        assert_eq!(done.len(), 2);
        assert!(done[0].payload.iter().all(|&b| b == 1));
        assert!(done[1].payload.iter().all(|&b| b == 2));
    }

    #[test]
    fn test_orphan_consecutive_is_error() {
        let header = Header::new(5, FrameType::Consecutive, ServiceType::Rpc, 1, 3, 2, 99);
        let mut reassembler = Reassembler::new(u32::MAX);
        assert_eq!(
            reassembler.accept(Frame::new(header, Bytes::from_static(b"zz"))),
            Err(FramingError::OrphanConsecutive { session_id: 3, message_id: 99 })
        );
    }

    #[test]
    fn test_malformed_first_frame() {
        let header = Header::new(5, FrameType::First, ServiceType::Rpc, 0, 1, 3, 1);
        let mut reassembler = Reassembler::new(u32::MAX);
        assert_eq!(
            reassembler.accept(Frame::new(header, Bytes::from_static(b"abc"))),
            Err(FramingError::MalformedFirstFrame(3))
        );
    }

    #[test]
    fn test_overflow_discards_partial() {
        let spec = FrameSpec::data(5, ServiceType::Rpc, 1, 5);
        let mut frames = decode_all(&encode(&spec, &[0u8; 20], HEADER_SIZE + 10));
        // Lie about the total size in the first frame.
        let mut first = frames[0].payload.to_vec();
        first[..4].copy_from_slice(&5u32.to_be_bytes());
        frames[0].payload = Bytes::from(first);

        let mut reassembler = Reassembler::new(u32::MAX);
        assert!(reassembler.accept(frames[0].clone()).unwrap().is_none());
        assert_eq!(
            reassembler.accept(frames[1].clone()),
            Err(FramingError::Overflow { message_id: 5, declared: 5 })
        );
        assert_eq!(reassembler.in_flight(), 0);
    }

    #[test]
    fn test_discard_session() {
        let mut reassembler = Reassembler::new(u32::MAX);
        for (sid, mid) in [(1u8, 1u32), (1, 2), (2, 1)] {
            let spec = FrameSpec::data(5, ServiceType::Rpc, sid, mid);
            let frames = decode_all(&encode(&spec, &[0u8; 20], HEADER_SIZE + 10));
            reassembler.accept(frames[0].clone()).unwrap();
        }

        let video = FrameSpec::data(5, ServiceType::Video, 1, 1);
        let frames = decode_all(&encode(&video, &[0u8; 20], HEADER_SIZE + 10));
        reassembler.accept(frames[0].clone()).unwrap();

        assert_eq!(reassembler.discard_session(1, ServiceType::Rpc), 2);
        assert_eq!(reassembler.in_flight(), 2);
        assert_eq!(reassembler.discard_session(1, ServiceType::Video), 1);
        assert_eq!(reassembler.in_flight(), 1);
    }

    #[test]
    fn test_services_sharing_session_and_message_id() {
        let rpc = FrameSpec::data(5, ServiceType::Rpc, 1, 5);
        let video = FrameSpec::data(5, ServiceType::Video, 1, 5);
        let fr = decode_all(&encode(&rpc, &[0xAA; 30], HEADER_SIZE + 10));
        let fv = decode_all(&encode(&video, &[0xBB; 30], HEADER_SIZE + 10));

        let mut reassembler = Reassembler::new(u32::MAX);
        let mut done = Vec::new();
        for (r, v) in fr.into_iter().zip(fv) {
            done.extend(reassembler.accept(r).unwrap());
            done.extend(reassembler.accept(v).unwrap());
        }

        assert_eq!(done.len(), 2);
        assert_eq!(done[0].service_type, ServiceType::Rpc);
        assert!(done[0].payload.iter().all(|&b| b == 0xAA));
        assert_eq!(done[1].service_type, ServiceType::Video);
        assert!(done[1].payload.iter().all(|&b| b == 0xBB));
        assert_eq!(reassembler.in_flight(), 0);
    }

    #[test]
    fn test_consecutive_from_other_service_rejected() {
        let spec = FrameSpec::data(5, ServiceType::Rpc, 1, 8);
        let frames = decode_all(&encode(&spec, &[0u8; 20], HEADER_SIZE + 10));

        let mut reassembler = Reassembler::new(u32::MAX);
        reassembler.accept(frames[0].clone()).unwrap();

        let mut stray = frames[1].clone();
        stray.header.service_type = ServiceType::Audio;
        assert_eq!(
            reassembler.accept(stray),
            Err(FramingError::ServiceMismatch {
                message_id: 8,
                expected: ServiceType::Rpc,
                found: ServiceType::Audio,
            })
        );
        // The original message still completes.
        assert!(reassembler.accept(frames[1].clone()).unwrap().is_none());
        assert!(reassembler.accept(frames[2].clone()).unwrap().is_some());
    }
}
