//! Session table: one logical session per service type.
//!
//! ```text
//!            start ack                   end ack / transport loss
//! Pending ─────────────► Established ─────────────────────────────► Closed
//!    │
//!    └── start nack ──► (entry discarded, waiters get ServiceRejected)
//! ```
//!
//! Session ids are assigned by the head unit in the start-service ACK. The
//! manager only tracks state; sending the control frames is the caller's job,
//! signalled through [`OpenTicket::Start`].

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::{ProxyError, Result};
use crate::protocol::ServiceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Pending,
    Established,
    Closed,
}

/// A logical channel for one service type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub id: u8,
    pub service: ServiceType,
    pub state: SessionState,
    /// Protocol version the head unit acknowledged with.
    pub protocol_version: u8,
}

type Waiter = oneshot::Sender<Result<Session>>;

struct Entry {
    session: Session,
    waiters: Vec<Waiter>,
}

/// Result of asking the manager to open a session.
#[derive(Debug)]
pub enum OpenTicket {
    /// Already established; nothing to send.
    Ready(Session),
    /// Another caller already sent the start frame; wait for its outcome.
    Joined(oneshot::Receiver<Result<Session>>),
    /// A new pending entry was created; the caller must send the start frame.
    Start(oneshot::Receiver<Result<Session>>),
}

/// Session table keyed by service type.
#[derive(Default)]
pub struct SessionManager {
    entries: HashMap<ServiceType, Entry>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin opening a session for `service`.
    ///
    /// Concurrent callers for the same service share one pending entry.
    pub fn begin_open(&mut self, service: ServiceType) -> OpenTicket {
        let (tx, rx) = oneshot::channel();
        match self.entries.get_mut(&service) {
            Some(entry) if entry.session.state == SessionState::Established => {
                OpenTicket::Ready(entry.session)
            }
            Some(entry) => {
                entry.waiters.push(tx);
                OpenTicket::Joined(rx)
            }
            None => {
                self.entries.insert(
                    service,
                    Entry {
                        session: Session {
                            id: 0,
                            service,
                            state: SessionState::Pending,
                            protocol_version: 0,
                        },
                        waiters: vec![tx],
                    },
                );
                tracing::debug!(?service, "session pending");
                OpenTicket::Start(rx)
            }
        }
    }

    /// Start-service ACK: transition Pending to Established.
    ///
    /// Returns the established session, or `None` if nothing was pending for
    /// that service.
    pub fn on_start_ack(
        &mut self,
        service: ServiceType,
        session_id: u8,
        protocol_version: u8,
    ) -> Option<Session> {
        let entry = self.entries.get_mut(&service)?;
        if entry.session.state != SessionState::Pending {
            tracing::debug!(?service, session_id, "ignoring ACK for non-pending session");
            return None;
        }

        entry.session.id = session_id;
        entry.session.protocol_version = protocol_version;
        entry.session.state = SessionState::Established;
        let session = entry.session;
        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(Ok(session));
        }
        tracing::info!(?service, session_id, protocol_version, "session established");
        Some(session)
    }

    /// Start-service NACK: discard the pending entry.
    pub fn on_start_nack(&mut self, service: ServiceType) -> bool {
        self.fail_pending(service, || ProxyError::ServiceRejected { service })
    }

    /// Fail a pending open with a caller-supplied error.
    pub fn fail_pending(&mut self, service: ServiceType, error: impl Fn() -> ProxyError) -> bool {
        match self.entries.get(&service) {
            Some(entry) if entry.session.state == SessionState::Pending => {}
            _ => return false,
        }
        if let Some(entry) = self.entries.remove(&service) {
            for waiter in entry.waiters {
                let _ = waiter.send(Err(error()));
            }
        }
        true
    }

    /// Close the session for `service` and free its id.
    ///
    /// Returns the session as it was closed. Pending openers are failed with
    /// `ServiceClosed`.
    pub fn close(&mut self, service: ServiceType) -> Option<Session> {
        let entry = self.entries.remove(&service)?;
        let mut session = entry.session;
        for waiter in entry.waiters {
            let _ = waiter.send(Err(ProxyError::ServiceClosed {
                session_id: session.id,
            }));
        }
        session.state = SessionState::Closed;
        tracing::debug!(?service, session_id = session.id, "session closed");
        Some(session)
    }

    /// Close every session, failing pending openers with `ConnectionLost`.
    pub fn close_all(&mut self) -> Vec<Session> {
        self.entries
            .drain()
            .map(|(_, entry)| {
                for waiter in entry.waiters {
                    let _ = waiter.send(Err(ProxyError::ConnectionLost));
                }
                let mut session = entry.session;
                session.state = SessionState::Closed;
                session
            })
            .collect()
    }

    /// Current session for a service, in whatever state it is.
    pub fn get(&self, service: ServiceType) -> Option<Session> {
        self.entries.get(&service).map(|e| e.session)
    }

    /// Established session for a service.
    pub fn established(&self, service: ServiceType) -> Option<Session> {
        self.get(service)
            .filter(|s| s.state == SessionState::Established)
    }

    /// Look up an established session by its wire identity.
    pub fn lookup(&self, session_id: u8, service: ServiceType) -> Option<Session> {
        self.established(service).filter(|s| s.id == session_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_then_ack() {
        let mut sessions = SessionManager::new();
        let OpenTicket::Start(rx) = sessions.begin_open(ServiceType::Rpc) else {
            panic!("expected start ticket");
        };
        assert_eq!(sessions.get(ServiceType::Rpc).unwrap().state, SessionState::Pending);

        let session = sessions.on_start_ack(ServiceType::Rpc, 3, 5).unwrap();
        assert_eq!(session.id, 3);
        assert_eq!(rx.await.unwrap().unwrap(), session);
        assert_eq!(sessions.lookup(3, ServiceType::Rpc), Some(session));
    }

    #[tokio::test]
    async fn test_concurrent_open_shares_pending_entry() {
        let mut sessions = SessionManager::new();
        let first = sessions.begin_open(ServiceType::Audio);
        let second = sessions.begin_open(ServiceType::Audio);
        assert!(matches!(first, OpenTicket::Start(_)));
        let OpenTicket::Joined(rx) = second else {
            panic!("second opener should join");
        };

        sessions.on_start_ack(ServiceType::Audio, 1, 5);
        assert_eq!(rx.await.unwrap().unwrap().id, 1);
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn test_open_is_idempotent_once_established() {
        let mut sessions = SessionManager::new();
        let _ = sessions.begin_open(ServiceType::Rpc);
        sessions.on_start_ack(ServiceType::Rpc, 9, 4);

        match sessions.begin_open(ServiceType::Rpc) {
            OpenTicket::Ready(session) => assert_eq!(session.id, 9),
            other => panic!("unexpected ticket {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nack_discards_entry() {
        let mut sessions = SessionManager::new();
        let OpenTicket::Start(rx) = sessions.begin_open(ServiceType::Video) else {
            panic!("expected start ticket");
        };

        assert!(sessions.on_start_nack(ServiceType::Video));
        assert!(matches!(
            rx.await.unwrap(),
            Err(ProxyError::ServiceRejected { service: ServiceType::Video })
        ));
        assert!(sessions.get(ServiceType::Video).is_none());
    }

    #[test]
    fn test_close_frees_entry() {
        let mut sessions = SessionManager::new();
        let _ = sessions.begin_open(ServiceType::BulkData);
        sessions.on_start_ack(ServiceType::BulkData, 2, 5);

        let closed = sessions.close(ServiceType::BulkData).unwrap();
        assert_eq!(closed.state, SessionState::Closed);
        assert!(sessions.is_empty());
        assert!(sessions.close(ServiceType::BulkData).is_none());
        assert!(matches!(
            sessions.begin_open(ServiceType::BulkData),
            OpenTicket::Start(_)
        ));
    }

    #[tokio::test]
    async fn test_close_all_fails_pending() {
        let mut sessions = SessionManager::new();
        let _ = sessions.begin_open(ServiceType::Rpc);
        sessions.on_start_ack(ServiceType::Rpc, 1, 5);
        let OpenTicket::Start(rx) = sessions.begin_open(ServiceType::Audio) else {
            panic!("expected start ticket");
        };

        let closed = sessions.close_all();
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|s| s.state == SessionState::Closed));
        assert!(matches!(rx.await.unwrap(), Err(ProxyError::ConnectionLost)));
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_lookup_requires_matching_id() {
        let mut sessions = SessionManager::new();
        let _ = sessions.begin_open(ServiceType::Rpc);
        assert!(sessions.lookup(0, ServiceType::Rpc).is_none());

        sessions.on_start_ack(ServiceType::Rpc, 4, 5);
        assert!(sessions.lookup(5, ServiceType::Rpc).is_none());
        assert!(sessions.lookup(4, ServiceType::Audio).is_none());
    }

    #[test]
    fn test_ack_without_pending_ignored() {
        let mut sessions = SessionManager::new();
        assert!(sessions.on_start_ack(ServiceType::Rpc, 1, 5).is_none());
    }
}
