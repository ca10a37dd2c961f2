use std::time::{Duration, Instant};

use thiserror::Error;

/// Connection lifecycle of one [`Session`](super::Session).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// TCP connect in flight.
    Connecting,
    /// AUTH queued or sent, waiting for ACK.
    AuthSent,
    /// Inbound connection waiting for AUTH.
    AwaitingAuth,
    /// Secrets installed, waiting for the peer's hello.
    AwaitingHello,
    Ready,
    /// Disconnect queued, closing once it is flushed.
    Disconnecting,
    Closed,
    Failed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct SessionStateError {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    pub fn transition(self, next: SessionState) -> Result<SessionState, SessionStateError> {
        use SessionState::*;
        let allowed = match (self, next) {
            (_, Failed) | (_, Closed) => true,
            (Closed | Failed, Idle) => true,
            (Idle, Connecting | AuthSent | AwaitingAuth) => true,
            (Connecting, AuthSent) => true,
            (AuthSent | AwaitingAuth, AwaitingHello) => true,
            (AwaitingHello, Ready) => true,
            (AwaitingHello | Ready, Disconnecting) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(SessionStateError {
                from: self,
                to: next,
            })
        }
    }

    /// Still negotiating: the handshake timeout applies.
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::AuthSent
                | SessionState::AwaitingAuth
                | SessionState::AwaitingHello
        )
    }

    /// No socket in use; the slot can be reconnected or reused.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Closed | SessionState::Failed
        )
    }

    pub fn check_timeout(self, timeout: Duration, since: Instant, now: Instant) -> bool {
        self.is_handshaking() && now.saturating_duration_since(since) > timeout
    }
}
