//! Request/response correlation with per-request deadlines.
//!
//! The engine owns the pending-request table. Every path that finishes a
//! request (response, timeout sweep, cancel, session or connection teardown)
//! first removes the entry from the table; only the caller that removed it
//! completes it. A late response or a second sweep finds nothing and does
//! nothing, so each request completes exactly once.
//!
//! ```text
//!  register ──► pending[id] ──┬── complete(response) ──► Ok(envelope)
//!                             ├── sweep_expired(now) ──► Err(Timeout)
//!                             ├── cancel(id)         ──► Err(Cancelled)
//!                             ├── fail_session(sid)  ──► Err(ServiceClosed)
//!                             └── fail_all()         ──► Err(ConnectionLost)
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::envelope::{MessageKind, RpcEnvelope};
use crate::error::{ProxyError, Result};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest deadline a request may be given.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Default upper bound for correlation ids before wrapping back to 1.
pub const DEFAULT_MAX_CORRELATION_ID: u32 = i32::MAX as u32;

/// Outcome delivered to a request's completion sink.
pub type Completion = std::result::Result<RpcEnvelope, ProxyError>;

/// A request waiting for its response.
#[derive(Debug)]
pub struct PendingRequest {
    pub correlation_id: u32,
    pub function_id: u32,
    pub session_id: u8,
    pub issued_at: Instant,
    pub deadline: Instant,
    sink: oneshot::Sender<Completion>,
}

impl PendingRequest {
    fn finish(self, outcome: Completion) {
        // The caller may have dropped the handle; nothing to deliver then.
        let _ = self.sink.send(outcome);
    }
}

/// Caller-side handle for an outstanding request.
///
/// Resolves to the response envelope or to the reason the request ended.
/// Dropping the handle abandons the result; the pending entry is still
/// cleaned up by its response or deadline.
#[derive(Debug)]
pub struct ResponseHandle {
    correlation_id: u32,
    rx: oneshot::Receiver<Completion>,
}

impl ResponseHandle {
    pub fn correlation_id(&self) -> u32 {
        self.correlation_id
    }
}

impl Future for ResponseHandle {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ProxyError::ConnectionLost)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Connection-scoped correlation id allocator.
///
/// Ids increase monotonically from 1 and wrap back to 1 after `max`.
#[derive(Debug, Clone)]
pub struct CorrelationIds {
    next: u32,
    max: u32,
}

impl CorrelationIds {
    pub fn new(max: u32) -> Self {
        Self {
            next: 1,
            max: max.max(1),
        }
    }

    /// Hand out the next id.
    pub fn allocate(&mut self) -> u32 {
        let id = self.next;
        self.next = if id >= self.max { 1 } else { id + 1 };
        id
    }

    pub fn reset(&mut self) {
        self.next = 1;
    }
}

/// Pending-request table plus id allocation.
#[derive(Debug)]
pub struct CorrelationEngine {
    ids: CorrelationIds,
    pending: HashMap<u32, PendingRequest>,
    default_timeout: Duration,
}

impl CorrelationEngine {
    pub fn new(default_timeout: Duration, max_correlation_id: u32) -> Self {
        Self {
            ids: CorrelationIds::new(max_correlation_id),
            pending: HashMap::new(),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register an outgoing request.
    ///
    /// Assigns a correlation id if the envelope has none and writes it back
    /// into the envelope. Fails with `IdCollision` if the id is still owned
    /// by an outstanding request; nothing is registered in that case.
    pub fn register(
        &mut self,
        envelope: &mut RpcEnvelope,
        session_id: u8,
        timeout: Option<Duration>,
        now: Instant,
    ) -> Result<ResponseHandle> {
        if envelope.kind != MessageKind::Request {
            return Err(ProxyError::InvalidPayload(format!(
                "only requests are correlated, got {:?}",
                envelope.kind
            )));
        }

        let timeout = timeout
            .unwrap_or(self.default_timeout)
            .min(MAX_REQUEST_TIMEOUT);
        let deadline = now.checked_add(timeout).ok_or_else(|| {
            ProxyError::InvalidPayload(format!("request timeout {timeout:?} is out of range"))
        })?;

        let correlation_id = match envelope.correlation_id {
            Some(id) => id,
            None => self.ids.allocate(),
        };
        if self.pending.contains_key(&correlation_id) {
            tracing::warn!(correlation_id, "correlation id still outstanding");
            return Err(ProxyError::IdCollision(correlation_id));
        }
        envelope.correlation_id = Some(correlation_id);

        let (sink, rx) = oneshot::channel();
        self.pending.insert(
            correlation_id,
            PendingRequest {
                correlation_id,
                function_id: envelope.function_id,
                session_id,
                issued_at: now,
                deadline,
                sink,
            },
        );

        tracing::debug!(
            correlation_id,
            function_id = envelope.function_id,
            session_id,
            timeout_ms = timeout.as_millis() as u64,
            "registered pending request"
        );

        Ok(ResponseHandle { correlation_id, rx })
    }

    /// Complete the request matching a response.
    ///
    /// Returns false (and logs) for duplicate, late or foreign responses.
    pub fn complete(&mut self, response: RpcEnvelope) -> bool {
        let Some(correlation_id) = response.correlation_id else {
            return false;
        };
        match self.pending.remove(&correlation_id) {
            Some(entry) => {
                tracing::debug!(
                    correlation_id,
                    function_id = response.function_id,
                    elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
                    "response matched pending request"
                );
                entry.finish(Ok(response));
                true
            }
            None => {
                tracing::debug!(
                    correlation_id,
                    function_id = response.function_id,
                    "discarding response with no pending request"
                );
                false
            }
        }
    }

    /// Cancel one request locally.
    pub fn cancel(&mut self, correlation_id: u32) -> bool {
        match self.pending.remove(&correlation_id) {
            Some(entry) => {
                entry.finish(Err(ProxyError::Cancelled { correlation_id }));
                true
            }
            None => false,
        }
    }

    /// Drop a request whose send failed, handing the error to its caller.
    pub fn abandon(&mut self, correlation_id: u32, error: ProxyError) -> bool {
        match self.pending.remove(&correlation_id) {
            Some(entry) => {
                entry.finish(Err(error));
                true
            }
            None => false,
        }
    }

    /// Time out every request whose deadline is at or before `now`.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<u32> = self
            .pending
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.correlation_id)
            .collect();

        for correlation_id in &expired {
            if let Some(entry) = self.pending.remove(correlation_id) {
                tracing::warn!(
                    correlation_id,
                    function_id = entry.function_id,
                    "request timed out"
                );
                entry.finish(Err(ProxyError::Timeout {
                    correlation_id: *correlation_id,
                }));
            }
        }
        expired.len()
    }

    /// Fail every request scoped to a session with `ServiceClosed`.
    pub fn fail_session(&mut self, session_id: u8) -> usize {
        let ids: Vec<u32> = self
            .pending
            .values()
            .filter(|p| p.session_id == session_id)
            .map(|p| p.correlation_id)
            .collect();

        for id in &ids {
            if let Some(entry) = self.pending.remove(id) {
                entry.finish(Err(ProxyError::ServiceClosed { session_id }));
            }
        }
        ids.len()
    }

    /// Fail every outstanding request with `ConnectionLost` and reset ids.
    pub fn fail_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, entry) in self.pending.drain() {
            entry.finish(Err(ProxyError::ConnectionLost));
        }
        self.ids.reset();
        count
    }

    /// Earliest deadline among outstanding requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn contains(&self, correlation_id: u32) -> bool {
        self.pending.contains_key(&correlation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
