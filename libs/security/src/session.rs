//! Per-pair security session state machine.
//!
//! ```text
//! Uninitialized --begin--> Negotiating --establish--> Established
//! Established --begin--> Renegotiating --establish--> Established
//! Established --expire--> Expired --begin--> Renegotiating
//! any --fail--> Failed --begin--> Negotiating
//! ```
//!
//! While renegotiating, the current keys keep sealing traffic. Once the new
//! keys are established the old ones are kept for opening in-flight messages.

use std::fmt;
use std::time::{Duration, Instant};

use proactive_id::{BodyId, SessionId};
use serde::{Deserialize, Serialize};

use crate::certificate::Certificate;
use crate::crypto::{self, DerivedKeys, KEY_BYTES};
use crate::error::SecurityError;

/// Lifecycle state of a session between two bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Negotiating,
    Established,
    Renegotiating,
    Expired,
    Failed,
}

impl SessionState {
    /// True while a handshake is running.
    pub fn is_negotiating(&self) -> bool {
        matches!(self, SessionState::Negotiating | SessionState::Renegotiating)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Negotiating => "negotiating",
            SessionState::Established => "established",
            SessionState::Renegotiating => "renegotiating",
            SessionState::Expired => "expired",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Which side of the handshake a party played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Initiator,
    Responder,
}

impl SessionRole {
    pub fn peer(&self) -> SessionRole {
        match self {
            SessionRole::Initiator => SessionRole::Responder,
            SessionRole::Responder => SessionRole::Initiator,
        }
    }

    pub(crate) fn label(&self) -> &'static [u8] {
        match self {
            SessionRole::Initiator => b"initiator",
            SessionRole::Responder => b"responder",
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Initiator => write!(f, "initiator"),
            SessionRole::Responder => write!(f, "responder"),
        }
    }
}

/// Thresholds after which an established session must be renegotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_messages: u64,
    pub max_lifetime: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_messages: 1_000_000,
            max_lifetime: Duration::from_secs(3600),
        }
    }
}

/// A payload encrypted under a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    pub session_id: SessionId,
    pub counter: u64,
    pub ciphertext: Vec<u8>,
}

/// Traffic keys of one established session.
struct SessionKeys {
    id: SessionId,
    role: SessionRole,
    send: [u8; KEY_BYTES],
    recv: [u8; KEY_BYTES],
    fingerprint: String,
    established_at: Instant,
    sent: u64,
}

impl SessionKeys {
    fn new(id: SessionId, role: SessionRole, keys: &DerivedKeys) -> Self {
        let (send, recv) = keys.for_role(role);
        Self {
            id,
            role,
            send,
            recv,
            fingerprint: keys.fingerprint(),
            established_at: Instant::now(),
            sent: 0,
        }
    }

    fn exhausted(&self, limits: &SessionLimits) -> bool {
        self.sent >= limits.max_messages || self.established_at.elapsed() >= limits.max_lifetime
    }

    fn open(&self, sealed: &SealedPayload, aad: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let nonce = crypto::counter_nonce(self.role.peer(), sealed.counter);
        let bound = bind_aad(sealed.session_id, sealed.counter, aad);
        crypto::open(&self.recv, &nonce, &sealed.ciphertext, &bound)
    }
}

fn bind_aad(session_id: SessionId, counter: u64, aad: &[u8]) -> Vec<u8> {
    let mut bound = Vec::with_capacity(16 + aad.len());
    bound.extend_from_slice(&session_id.to_be_bytes());
    bound.extend_from_slice(&counter.to_be_bytes());
    bound.extend_from_slice(aad);
    bound
}

/// Material accumulated while a handshake runs.
#[derive(Debug)]
pub(crate) struct Handshake {
    pub(crate) role: SessionRole,
    pub(crate) session_id: Option<SessionId>,
    pub(crate) initiator_random: Option<[u8; 32]>,
    pub(crate) responder_random: Option<[u8; 32]>,
    pub(crate) remote_certificate: Option<Certificate>,
    pub(crate) keys: Option<DerivedKeys>,
    pub(crate) transcript_hash: Option<[u8; 32]>,
}

impl Handshake {
    fn new(role: SessionRole) -> Self {
        Self {
            role,
            session_id: None,
            initiator_random: None,
            responder_random: None,
            remote_certificate: None,
            keys: None,
            transcript_hash: None,
        }
    }
}

/// Session between `local` and `remote`, as seen from `local`.
pub struct SecuritySession {
    local: BodyId,
    remote: BodyId,
    state: SessionState,
    attempt: u64,
    handshake: Option<Handshake>,
    current: Option<SessionKeys>,
    previous: Option<SessionKeys>,
    remote_certificate: Option<Certificate>,
    limits: SessionLimits,
}

impl SecuritySession {
    pub fn new(local: BodyId, remote: BodyId, limits: SessionLimits) -> Self {
        Self {
            local,
            remote,
            state: SessionState::Uninitialized,
            attempt: 0,
            handshake: None,
            current: None,
            previous: None,
            remote_certificate: None,
            limits,
        }
    }

    pub fn local(&self) -> BodyId {
        self.local
    }

    pub fn remote(&self) -> BodyId {
        self.remote
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Id of the session whose keys currently seal traffic.
    pub fn session_id(&self) -> Option<SessionId> {
        self.current.as_ref().map(|k| k.id)
    }

    /// Id being negotiated by the running handshake, once known.
    pub fn pending_session_id(&self) -> Option<SessionId> {
        self.handshake.as_ref().and_then(|h| h.session_id)
    }

    pub fn remote_certificate(&self) -> Option<&Certificate> {
        self.remote_certificate.as_ref()
    }

    /// Digest of the current traffic keys; equal on both ends of a session.
    pub fn key_fingerprint(&self) -> Option<&str> {
        self.current.as_ref().map(|k| k.fingerprint.as_str())
    }

    /// Counter bumped by every `begin`/`restart`, used to detect takeovers.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// True if `session_id` is the current, previous or pending session.
    pub(crate) fn holds(&self, session_id: SessionId) -> bool {
        self.session_id() == Some(session_id)
            || self.pending_session_id() == Some(session_id)
            || self.previous.as_ref().map(|k| k.id) == Some(session_id)
    }

    pub(crate) fn handshake_role(&self) -> Option<SessionRole> {
        self.handshake.as_ref().map(|h| h.role)
    }

    /// Starts a handshake from an idle state.
    pub(crate) fn begin(&mut self, role: SessionRole) -> Result<u64, SecurityError> {
        self.state = match self.state {
            SessionState::Uninitialized | SessionState::Failed => SessionState::Negotiating,
            SessionState::Established | SessionState::Expired => SessionState::Renegotiating,
            state => {
                return Err(SecurityError::InvalidState {
                    state,
                    operation: "begin handshake",
                })
            }
        };
        Ok(self.start_attempt(role))
    }

    /// Replaces a running handshake with a fresh one.
    pub(crate) fn restart(&mut self, role: SessionRole) -> Result<u64, SecurityError> {
        if !self.state.is_negotiating() {
            return Err(SecurityError::InvalidState {
                state: self.state,
                operation: "restart handshake",
            });
        }
        Ok(self.start_attempt(role))
    }

    fn start_attempt(&mut self, role: SessionRole) -> u64 {
        self.attempt += 1;
        self.handshake = Some(Handshake::new(role));
        self.attempt
    }

    /// The running handshake, whatever its session id.
    pub(crate) fn handshake_mut(&mut self) -> Result<&mut Handshake, SecurityError> {
        let state = self.state;
        self.handshake
            .as_mut()
            .filter(|_| state.is_negotiating())
            .ok_or(SecurityError::InvalidState {
                state,
                operation: "continue handshake",
            })
    }

    /// The running handshake for `session_id`.
    pub(crate) fn handshake_for(&mut self, session_id: SessionId) -> Result<&mut Handshake, SecurityError> {
        match self.handshake.as_mut() {
            Some(handshake) if handshake.session_id == Some(session_id) => Ok(handshake),
            _ => Err(SecurityError::renegotiate(
                Some(session_id),
                "no handshake in progress for this session",
            )),
        }
    }

    /// Installs the keys of the running handshake.
    pub(crate) fn establish(&mut self) -> Result<SessionId, SecurityError> {
        let state = self.state;
        let ready = self
            .handshake
            .as_ref()
            .is_some_and(|h| h.session_id.is_some() && h.keys.is_some());
        let invalid = || SecurityError::InvalidState {
            state,
            operation: "establish",
        };
        if !state.is_negotiating() || !ready {
            return Err(invalid());
        }

        let Some(Handshake {
            role,
            session_id: Some(id),
            keys: Some(derived),
            remote_certificate,
            ..
        }) = self.handshake.take()
        else {
            return Err(invalid());
        };

        self.previous = self.current.replace(SessionKeys::new(id, role, &derived));
        if remote_certificate.is_some() {
            self.remote_certificate = remote_certificate;
        }
        self.state = SessionState::Established;
        Ok(id)
    }

    pub(crate) fn expire(&mut self) -> Result<(), SecurityError> {
        if self.state != SessionState::Established {
            return Err(SecurityError::InvalidState {
                state: self.state,
                operation: "expire",
            });
        }
        self.state = SessionState::Expired;
        Ok(())
    }

    /// Discards every key and any running handshake.
    pub(crate) fn fail(&mut self) {
        self.state = SessionState::Failed;
        self.handshake = None;
        self.current = None;
        self.previous = None;
    }

    /// Ends `session_id`. Returns true if nothing is left and the slot can go.
    pub(crate) fn terminate(&mut self, session_id: SessionId) -> bool {
        if self.pending_session_id() == Some(session_id) {
            self.handshake = None;
            if self.current.is_some() {
                self.state = SessionState::Established;
                return false;
            }
            self.state = SessionState::Uninitialized;
            return true;
        }

        if self.session_id() == Some(session_id) {
            self.handshake = None;
            self.current = None;
            self.previous = None;
            self.state = SessionState::Uninitialized;
            return true;
        }

        if self.previous.as_ref().map(|k| k.id) == Some(session_id) {
            self.previous = None;
        }
        false
    }

    /// Encrypts `plaintext` under the current keys.
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<SealedPayload, SecurityError> {
        match self.state {
            SessionState::Established | SessionState::Renegotiating => {}
            SessionState::Expired => {
                return Err(SecurityError::renegotiate(self.session_id(), "session expired"))
            }
            state => {
                return Err(SecurityError::InvalidState {
                    state,
                    operation: "seal",
                })
            }
        }

        let limits = self.limits;
        let established = self.state == SessionState::Established;
        let Some(keys) = self.current.as_mut() else {
            return Err(SecurityError::renegotiate(None, "no session keys"));
        };

        if established && keys.exhausted(&limits) {
            let id = keys.id;
            self.state = SessionState::Expired;
            return Err(SecurityError::renegotiate(Some(id), "session limits reached"));
        }

        let counter = keys.sent;
        let nonce = crypto::counter_nonce(keys.role, counter);
        let ciphertext = crypto::seal(&keys.send, &nonce, plaintext, &bind_aad(keys.id, counter, aad))?;
        keys.sent += 1;

        Ok(SealedPayload {
            session_id: keys.id,
            counter,
            ciphertext,
        })
    }

    /// Decrypts a payload sealed by the peer under the current, previous or
    /// just-negotiated keys.
    pub fn open(&self, sealed: &SealedPayload, aad: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if matches!(
            self.state,
            SessionState::Uninitialized | SessionState::Failed
        ) {
            return Err(SecurityError::renegotiate(
                Some(sealed.session_id),
                format!("session is {}", self.state),
            ));
        }

        if let Some(keys) = [self.current.as_ref(), self.previous.as_ref()]
            .into_iter()
            .flatten()
            .find(|k| k.id == sealed.session_id)
        {
            return keys.open(sealed, aad);
        }

        if let Some(handshake) = self.handshake.as_ref() {
            if let (Some(id), Some(derived)) = (handshake.session_id, handshake.keys.as_ref()) {
                if id == sealed.session_id {
                    return SessionKeys::new(id, handshake.role, derived).open(sealed, aad);
                }
            }
        }

        Err(SecurityError::renegotiate(
            Some(sealed.session_id),
            "unknown session",
        ))
    }
}

impl fmt::Debug for SecuritySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecuritySession")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("session_id", &self.session_id())
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SecuritySession, SecuritySession) {
        let a = BodyId::new();
        let b = BodyId::new();
        (
            SecuritySession::new(a, b, SessionLimits::default()),
            SecuritySession::new(b, a, SessionLimits::default()),
        )
    }

    fn establish(session: &mut SecuritySession, role: SessionRole, id: u64, secret: u8) {
        session.begin(role).unwrap();
        let handshake = session.handshake_mut().unwrap();
        handshake.session_id = Some(SessionId::new(id));
        handshake.keys = Some(DerivedKeys::derive(&[secret; 32], &[id as u8; 32]).unwrap());
        session.establish().unwrap();
    }

    #[test]
    fn test_lifecycle() {
        let (mut a, _) = pair();
        assert_eq!(a.state(), SessionState::Uninitialized);

        a.begin(SessionRole::Initiator).unwrap();
        assert_eq!(a.state(), SessionState::Negotiating);
        assert!(a.begin(SessionRole::Initiator).is_err());

        a.handshake_mut().unwrap().session_id = Some(SessionId::new(1));
        // no keys yet
        assert!(matches!(a.establish(), Err(SecurityError::InvalidState { .. })));

        a.handshake_mut().unwrap().keys = Some(DerivedKeys::derive(&[1; 32], &[1; 32]).unwrap());
        assert_eq!(a.establish().unwrap(), SessionId::new(1));
        assert_eq!(a.state(), SessionState::Established);

        a.begin(SessionRole::Responder).unwrap();
        assert_eq!(a.state(), SessionState::Renegotiating);
    }

    #[test]
    fn test_illegal_transitions() {
        let (mut a, _) = pair();
        assert!(a.expire().is_err());
        assert!(a.establish().is_err());
        assert!(a.restart(SessionRole::Initiator).is_err());
        assert!(matches!(
            a.seal(b"x", b""),
            Err(SecurityError::InvalidState { operation: "seal", .. })
        ));
    }

    #[test]
    fn test_seal_open_between_peers() {
        let (mut a, mut b) = pair();
        establish(&mut a, SessionRole::Initiator, 7, 3);
        establish(&mut b, SessionRole::Responder, 7, 3);
        assert_eq!(a.key_fingerprint(), b.key_fingerprint());

        let sealed = a.seal(b"hello", b"req").unwrap();
        assert_eq!(sealed.session_id, SessionId::new(7));
        assert_eq!(b.open(&sealed, b"req").unwrap(), b"hello");

        let back = b.seal(b"world", b"rep").unwrap();
        assert_eq!(a.open(&back, b"rep").unwrap(), b"world");

        // a party cannot open its own traffic
        assert_eq!(a.open(&sealed, b"req"), Err(SecurityError::Integrity));
    }

    #[test]
    fn test_renegotiated_session_still_opens_old_messages() {
        let (mut a, mut b) = pair();
        establish(&mut a, SessionRole::Initiator, 1, 3);
        establish(&mut b, SessionRole::Responder, 1, 3);
        let in_flight = a.seal(b"old", b"").unwrap();

        establish(&mut a, SessionRole::Initiator, 2, 4);
        establish(&mut b, SessionRole::Responder, 2, 4);

        assert_eq!(b.session_id(), Some(SessionId::new(2)));
        assert_eq!(b.open(&in_flight, b"").unwrap(), b"old");
        let fresh = a.seal(b"new", b"").unwrap();
        assert_eq!(fresh.session_id, SessionId::new(2));
        assert_eq!(b.open(&fresh, b"").unwrap(), b"new");
    }

    #[test]
    fn test_unknown_session_asks_for_renegotiation() {
        let (mut a, mut b) = pair();
        establish(&mut a, SessionRole::Initiator, 1, 3);
        establish(&mut b, SessionRole::Responder, 9, 3);

        let sealed = a.seal(b"x", b"").unwrap();
        assert!(b.open(&sealed, b"").unwrap_err().is_renegotiate());
    }

    #[test]
    fn test_message_limit_expires_session() {
        let a_id = BodyId::new();
        let limits = SessionLimits {
            max_messages: 2,
            max_lifetime: Duration::from_secs(60),
        };
        let mut a = SecuritySession::new(a_id, BodyId::new(), limits);
        establish(&mut a, SessionRole::Initiator, 1, 3);

        a.seal(b"1", b"").unwrap();
        a.seal(b"2", b"").unwrap();
        let err = a.seal(b"3", b"").unwrap_err();
        assert!(err.is_renegotiate());
        assert_eq!(a.state(), SessionState::Expired);

        a.begin(SessionRole::Initiator).unwrap();
        assert_eq!(a.state(), SessionState::Renegotiating);
    }

    #[test]
    fn test_fail_discards_keys() {
        let (mut a, _) = pair();
        establish(&mut a, SessionRole::Initiator, 1, 3);
        a.fail();
        assert_eq!(a.state(), SessionState::Failed);
        assert_eq!(a.session_id(), None);
        assert!(a.seal(b"x", b"").is_err());

        a.begin(SessionRole::Initiator).unwrap();
        assert_eq!(a.state(), SessionState::Negotiating);
    }

    #[test]
    fn test_terminate_pending_handshake_restores_established() {
        let (mut a, _) = pair();
        establish(&mut a, SessionRole::Initiator, 1, 3);
        a.begin(SessionRole::Responder).unwrap();
        a.handshake_mut().unwrap().session_id = Some(SessionId::new(2));

        assert!(!a.terminate(SessionId::new(2)));
        assert_eq!(a.state(), SessionState::Established);
        assert!(a.terminate(SessionId::new(1)));
        assert_eq!(a.state(), SessionState::Uninitialized);
    }
}
