//! Control-service frames: start/end service and heartbeat.
//!
//! Builders produce single encoded control frames. [`ControlEvent::parse`]
//! classifies an incoming control frame by its frame info byte.

use bytes::Bytes;

use crate::protocol::{build_frame, frame_info, FrameType, Header, LogicalMessage, ServiceType};

fn control_frame(
    version: u8,
    service: ServiceType,
    session_id: u8,
    info: u8,
    message_id: u32,
) -> Bytes {
    let header = Header::new(
        version,
        FrameType::Control,
        service,
        info,
        session_id,
        0,
        message_id,
    );
    Bytes::from(build_frame(&header, &[]))
}

/// Ask the head unit to start `service`.
pub fn start_service(version: u8, service: ServiceType, session_id: u8) -> Bytes {
    control_frame(version, service, session_id, frame_info::START_SERVICE, 0)
}

/// End `service` on a session. Fire-and-forget.
pub fn end_service(version: u8, service: ServiceType, session_id: u8) -> Bytes {
    control_frame(version, service, session_id, frame_info::END_SERVICE, 0)
}

/// Acknowledge an end-service request from the head unit.
pub fn end_service_ack(version: u8, service: ServiceType, session_id: u8) -> Bytes {
    control_frame(version, service, session_id, frame_info::END_SERVICE_ACK, 0)
}

pub fn heartbeat(version: u8, session_id: u8) -> Bytes {
    control_frame(version, ServiceType::Control, session_id, frame_info::HEARTBEAT, 0)
}

/// Answer a heartbeat, echoing its message id.
pub fn heartbeat_ack(version: u8, session_id: u8, message_id: u32) -> Bytes {
    control_frame(
        version,
        ServiceType::Control,
        session_id,
        frame_info::HEARTBEAT_ACK,
        message_id,
    )
}

/// Incoming control frame, classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    StartServiceAck {
        service: ServiceType,
        session_id: u8,
        version: u8,
    },
    StartServiceNack {
        service: ServiceType,
    },
    /// Head unit ended a service.
    EndService {
        service: ServiceType,
        session_id: u8,
    },
    EndServiceAck {
        service: ServiceType,
        session_id: u8,
    },
    EndServiceNack {
        service: ServiceType,
        session_id: u8,
    },
    Heartbeat {
        session_id: u8,
        message_id: u32,
    },
    HeartbeatAck,
    ServiceDataAck,
    /// Start-service request from the head unit, or an unknown code.
    Unhandled(u8),
}

impl ControlEvent {
    pub fn parse(message: &LogicalMessage) -> Self {
        let service = message.service_type;
        let session_id = message.session_id;
        match message.frame_info {
            frame_info::HEARTBEAT => ControlEvent::Heartbeat {
                session_id,
                message_id: message.message_id,
            },
            frame_info::START_SERVICE_ACK => ControlEvent::StartServiceAck {
                service,
                session_id,
                version: message.version,
            },
            frame_info::START_SERVICE_NACK => ControlEvent::StartServiceNack { service },
            frame_info::END_SERVICE => ControlEvent::EndService {
                service,
                session_id,
            },
            frame_info::END_SERVICE_ACK => ControlEvent::EndServiceAck {
                service,
                session_id,
            },
            frame_info::END_SERVICE_NACK => ControlEvent::EndServiceNack {
                service,
                session_id,
            },
            frame_info::HEARTBEAT_ACK => ControlEvent::HeartbeatAck,
            frame_info::SERVICE_DATA_ACK => ControlEvent::ServiceDataAck,
            other => ControlEvent::Unhandled(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, FrameBuffer, Reassembler, HEADER_SIZE};

    fn roundtrip(bytes: &Bytes) -> LogicalMessage {
        let mut buffer = FrameBuffer::new();
        let frame: Frame = buffer.push(bytes).remove(0).unwrap();
        Reassembler::new(u32::MAX).accept(frame).unwrap().unwrap()
    }

    #[test]
    fn test_start_service_layout() {
        let bytes = start_service(5, ServiceType::Rpc, 0);
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(bytes[0], 0x50);
        assert_eq!(bytes[1], 0x07);
        assert_eq!(bytes[2], frame_info::START_SERVICE);
    }

    #[test]
    fn test_v1_control_frame_is_short() {
        let bytes = end_service(1, ServiceType::Rpc, 2);
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[0], 0x10);
        assert_eq!(bytes[3], 2);
    }

    #[test]
    fn test_heartbeat_ack_echoes_message_id() {
        let msg = roundtrip(&heartbeat_ack(5, 1, 77));
        assert_eq!(msg.message_id, 77);
        assert_eq!(ControlEvent::parse(&msg), ControlEvent::HeartbeatAck);
    }

    #[test]
    fn test_parse_heartbeat() {
        let msg = roundtrip(&heartbeat(4, 6));
        assert_eq!(
            ControlEvent::parse(&msg),
            ControlEvent::Heartbeat {
                session_id: 6,
                message_id: 0
            }
        );
    }

    #[test]
    fn test_parse_ack_carries_version() {
        let header = Header::new(
            3,
            FrameType::Control,
            ServiceType::Rpc,
            frame_info::START_SERVICE_ACK,
            9,
            0,
            0,
        );
        let msg = roundtrip(&Bytes::from(build_frame(&header, &[])));
        assert_eq!(
            ControlEvent::parse(&msg),
            ControlEvent::StartServiceAck {
                service: ServiceType::Rpc,
                session_id: 9,
                version: 3
            }
        );
    }

    #[test]
    fn test_parse_start_request_is_unhandled() {
        let msg = roundtrip(&start_service(5, ServiceType::Audio, 1));
        assert_eq!(
            ControlEvent::parse(&msg),
            ControlEvent::Unhandled(frame_info::START_SERVICE)
        );
    }
}
