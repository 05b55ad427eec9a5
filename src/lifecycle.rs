//! Connection lifecycle state machine.
//!
//! ```text
//! Disconnected ─► TransportConnected ─► VersionNegotiated ─► Registered ─► Ready
//!      ▲                                                                    │
//!      └──────────────── transport loss (from any state) ◄──────────────────┘
//!
//! Closing: user-initiated disconnect, from any connected state, then Disconnected.
//! ```
//!
//! Transitions move one step at a time. The coordinator also counts reconnect
//! attempts against the configured [`ReconnectPolicy`].

use std::fmt;
use std::time::Duration;

use crate::config::ReconnectPolicy;

/// Overall connection progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Disconnected,
    TransportConnected,
    VersionNegotiated,
    Registered,
    Ready,
    Closing,
}

impl LifecycleState {
    /// True while a transport link is up.
    pub fn is_connected(self) -> bool {
        !matches!(self, LifecycleState::Disconnected)
    }

    /// The state that directly follows this one on the way to `Ready`.
    pub fn next(self) -> Option<LifecycleState> {
        match self {
            LifecycleState::Disconnected => Some(LifecycleState::TransportConnected),
            LifecycleState::TransportConnected => Some(LifecycleState::VersionNegotiated),
            LifecycleState::VersionNegotiated => Some(LifecycleState::Registered),
            LifecycleState::Registered => Some(LifecycleState::Ready),
            LifecycleState::Ready | LifecycleState::Closing => None,
        }
    }

    /// True once the app is registered with the head unit.
    pub fn is_registered(self) -> bool {
        matches!(self, LifecycleState::Registered | LifecycleState::Ready)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::TransportConnected => "transport-connected",
            LifecycleState::VersionNegotiated => "version-negotiated",
            LifecycleState::Registered => "registered",
            LifecycleState::Ready => "ready",
            LifecycleState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// A state change, emitted to the delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// What to do after an unexpected loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted; terminal.
    GiveUp { attempts: u32 },
    /// Reconnect is disabled.
    Disabled,
}

/// Lifecycle coordinator.
#[derive(Debug)]
pub struct Lifecycle {
    state: LifecycleState,
    attempts: u32,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Disconnected,
            attempts: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Move one step forward to `to`.
    ///
    /// Returns `None` (no change) unless `to` directly follows the current
    /// state. `Closing` is reachable from every connected state.
    pub fn advance(&mut self, to: LifecycleState) -> Option<Transition> {
        let from = self.state;
        let allowed = match to {
            LifecycleState::Disconnected => false,
            LifecycleState::Closing => from.is_connected() && from != LifecycleState::Closing,
            _ => from.next() == Some(to),
        };
        if !allowed {
            if to > from && from != LifecycleState::Closing {
                tracing::warn!(%from, %to, "refusing to skip lifecycle states");
            } else {
                tracing::trace!(%from, %to, "ignoring non-forward transition");
            }
            return None;
        }
        self.state = to;
        tracing::info!(%from, %to, "lifecycle transition");
        Some(Transition { from, to })
    }

    /// Universal transition to `Disconnected`.
    pub fn disconnected(&mut self) -> Option<Transition> {
        let from = self.state;
        if from == LifecycleState::Disconnected {
            return None;
        }
        self.state = LifecycleState::Disconnected;
        tracing::info!(%from, to = %LifecycleState::Disconnected, "lifecycle transition");
        Some(Transition {
            from,
            to: LifecycleState::Disconnected,
        })
    }

    /// Count one more reconnect attempt and decide whether to make it.
    pub fn next_reconnect(&mut self, policy: &ReconnectPolicy) -> ReconnectDecision {
        if !policy.enabled {
            return ReconnectDecision::Disabled;
        }
        if self.attempts >= policy.max_attempts {
            return ReconnectDecision::GiveUp {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: policy.delay_for(self.attempts),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Clear the attempt counter after a successful (re)connect.
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    #[test]
    fn test_forward_progression() {
        let mut lifecycle = Lifecycle::new();
        for to in [TransportConnected, VersionNegotiated, Registered, Ready] {
            let t = lifecycle.advance(to).unwrap();
            assert_eq!(t.to, to);
        }
        assert_eq!(lifecycle.state(), Ready);
    }

    #[test]
    fn test_backward_rejected() {
        let mut lifecycle = Lifecycle::new();
        for to in [TransportConnected, VersionNegotiated, Registered] {
            lifecycle.advance(to);
        }
        assert!(lifecycle.advance(VersionNegotiated).is_none());
        assert!(lifecycle.advance(Registered).is_none());
        assert_eq!(lifecycle.state(), Registered);
    }

    #[test]
    fn test_skipping_states_rejected() {
        let mut lifecycle = Lifecycle::new();
        assert!(lifecycle.advance(Registered).is_none());
        lifecycle.advance(TransportConnected);
        assert!(lifecycle.advance(Registered).is_none());
        assert!(lifecycle.advance(Ready).is_none());
        assert_eq!(lifecycle.state(), TransportConnected);
        assert!(lifecycle.advance(VersionNegotiated).is_some());
    }

    #[test]
    fn test_loss_from_any_state() {
        let path = [TransportConnected, VersionNegotiated, Registered, Ready];
        for steps in 1..=path.len() {
            let mut lifecycle = Lifecycle::new();
            for to in &path[..steps] {
                lifecycle.advance(*to).unwrap();
            }
            let t = lifecycle.disconnected().unwrap();
            assert_eq!(t.to, Disconnected);
        }

        let mut closing = Lifecycle::new();
        closing.advance(TransportConnected);
        closing.advance(Closing).unwrap();
        assert_eq!(closing.disconnected().unwrap().from, Closing);
        assert!(Lifecycle::new().disconnected().is_none());
    }

    #[test]
    fn test_closing_is_terminal_until_disconnected() {
        let mut lifecycle = Lifecycle::new();
        assert!(lifecycle.advance(Closing).is_none());
        lifecycle.advance(TransportConnected);
        assert!(lifecycle.advance(Closing).is_some());
        assert!(lifecycle.advance(Ready).is_none());
        assert!(lifecycle.advance(Closing).is_none());
    }

    #[test]
    fn test_reconnect_attempts_bounded() {
        let policy = ReconnectPolicy {
            max_attempts: 2,
            ..ReconnectPolicy::default()
        };
        let mut lifecycle = Lifecycle::new();

        assert!(matches!(
            lifecycle.next_reconnect(&policy),
            ReconnectDecision::Retry { attempt: 1, .. }
        ));
        assert!(matches!(
            lifecycle.next_reconnect(&policy),
            ReconnectDecision::Retry { attempt: 2, .. }
        ));
        assert_eq!(
            lifecycle.next_reconnect(&policy),
            ReconnectDecision::GiveUp { attempts: 2 }
        );

        lifecycle.reset_attempts();
        assert_eq!(lifecycle.attempts(), 0);
    }

    #[test]
    fn test_reconnect_disabled() {
        let policy = ReconnectPolicy {
            enabled: false,
            ..ReconnectPolicy::default()
        };
        assert_eq!(
            Lifecycle::new().next_reconnect(&policy),
            ReconnectDecision::Disabled
        );
    }
}
