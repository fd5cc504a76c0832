//! Security error taxonomy.

use proactive_id::{BodyId, SessionId};
use thiserror::Error;

use crate::policy::CommunicationKind;
use crate::session::SessionState;

/// Errors raised by certificate validation, policy lookup and session negotiation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// The body has no security manager attached.
    #[error("security not available")]
    SecurityNotAvailable,

    /// A peer certificate or signature failed validation.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The key exchange produced mismatching or unusable key material.
    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    /// Policy denies this kind of communication between the two parties.
    #[error("communication '{kind}' forbidden from [{from}] to [{to}]")]
    CommunicationForbidden {
        kind: CommunicationKind,
        from: String,
        to: String,
    },

    /// The session is unknown, expired or was replaced; a fresh handshake is needed.
    #[error("session must be renegotiated ({reason})")]
    RenegotiateSession {
        session_id: Option<SessionId>,
        reason: String,
    },

    /// A session operation was attempted in a state that does not allow it.
    #[error("session in state {state} cannot {operation}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },

    /// Both parties started a handshake at the same time and this one lost.
    #[error("handshake collision with {remote}")]
    HandshakeCollision { remote: BodyId },

    /// The handshake did not complete in time.
    #[error("handshake with {remote} timed out")]
    HandshakeTimeout { remote: BodyId },

    /// A sealed payload failed authenticated decryption.
    #[error("sealed payload failed integrity check")]
    Integrity,

    /// Key material could not be loaded or used.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

impl SecurityError {
    /// Shorthand for a renegotiation signal.
    pub fn renegotiate(session_id: Option<SessionId>, reason: impl Into<String>) -> Self {
        SecurityError::RenegotiateSession {
            session_id,
            reason: reason.into(),
        }
    }

    /// Returns true for the control signal asking for a fresh handshake.
    pub fn is_renegotiate(&self) -> bool {
        matches!(self, SecurityError::RenegotiateSession { .. })
    }

    /// Returns true if the handshake must not be retried automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SecurityError::Authentication(_)
                | SecurityError::KeyExchange(_)
                | SecurityError::CommunicationForbidden { .. }
                | SecurityError::SecurityNotAvailable
        )
    }
}
