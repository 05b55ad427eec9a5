//! App-facing delegate.
//!
//! The connection reports lifecycle changes, responses, notifications and
//! terminal errors through a [`ConnectionDelegate`]. Callbacks run on the
//! connection's tasks outside any internal lock, so they may call back into
//! the connection, but they should not block.

use tokio::sync::mpsc;

use crate::error::ProxyError;
use crate::lifecycle::LifecycleState;
use crate::rpc::RpcEnvelope;

/// Receiver of connection events. Every method defaults to a no-op.
pub trait ConnectionDelegate: Send + Sync + 'static {
    fn on_state_change(&self, _from: LifecycleState, _to: LifecycleState) {}

    /// A response completed one of this app's requests.
    fn on_response(&self, _response: &RpcEnvelope) {}

    /// Any notification from the head unit, before subscriber fan-out.
    fn on_notification(&self, _notification: &RpcEnvelope) {}

    /// Connection-level failures, including the terminal `ConnectionFailed`.
    fn on_error(&self, _error: ProxyError) {}
}

/// Delegate that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl ConnectionDelegate for NoopDelegate {}

/// One delegate callback, as a value.
#[derive(Debug)]
pub enum ConnectionEvent {
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    Response(RpcEnvelope),
    Notification(RpcEnvelope),
    Error(ProxyError),
}

/// Delegate that forwards every callback into an unbounded channel.
///
/// # Example
///
/// ```
/// use sdl_proxy::delegate::{ChannelDelegate, ConnectionDelegate, ConnectionEvent};
/// use sdl_proxy::lifecycle::LifecycleState;
///
/// let (delegate, mut events) = ChannelDelegate::new();
/// delegate.on_state_change(LifecycleState::Disconnected, LifecycleState::TransportConnected);
///
/// assert!(matches!(
///     events.try_recv(),
///     Ok(ConnectionEvent::StateChanged { to: LifecycleState::TransportConnected, .. })
/// ));
/// ```
#[derive(Debug, Clone)]
pub struct ChannelDelegate {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelDelegate {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: ConnectionEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl ConnectionDelegate for ChannelDelegate {
    fn on_state_change(&self, from: LifecycleState, to: LifecycleState) {
        self.emit(ConnectionEvent::StateChanged { from, to });
    }

    fn on_response(&self, response: &RpcEnvelope) {
        self.emit(ConnectionEvent::Response(response.clone()));
    }

    fn on_notification(&self, notification: &RpcEnvelope) {
        self.emit(ConnectionEvent::Notification(notification.clone()));
    }

    fn on_error(&self, error: ProxyError) {
        self.emit(ConnectionEvent::Error(error));
    }
}
