//! Handshake messages and the capability a body exposes to negotiate sessions.

use async_trait::async_trait;
use proactive_id::{BodyId, SessionId};
use serde::{Deserialize, Serialize};

use crate::certificate::Certificate;
use crate::crypto::Transcript;
use crate::error::SecurityError;
use crate::policy::{Communication, CommunicationKind, Entity, SecurityContext};
use crate::session::SessionRole;

/// Step 1: the initiator asks for a session and states its policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOffer {
    pub initiator: BodyId,
    pub kind: CommunicationKind,
    pub entities: Vec<Entity>,
    pub communication: Communication,
}

/// Step 2: fresh randoms, one from each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidentialityTicket {
    pub nonce: [u8; 32],
}

/// Step 3: certificate plus an ephemeral key signed over the handshake so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOffer {
    pub certificate: Certificate,
    pub ephemeral_public: [u8; 32],
    pub signature: Vec<u8>,
}

/// Step 4: proof of possession of the derived keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfirmation {
    pub mac: Vec<u8>,
}

/// Values both parties agree on once the randoms are exchanged.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Exchange {
    pub(crate) session_id: SessionId,
    pub(crate) initiator: BodyId,
    pub(crate) responder: BodyId,
    pub(crate) initiator_random: [u8; 32],
    pub(crate) responder_random: [u8; 32],
}

impl Exchange {
    fn base(&self, label: &[u8]) -> Transcript {
        Transcript::new(label)
            .append(b"session_id", &self.session_id.to_be_bytes())
            .append(b"initiator", self.initiator.to_string().as_bytes())
            .append(b"responder", self.responder.to_string().as_bytes())
            .append(b"initiator_random", &self.initiator_random)
            .append(b"responder_random", &self.responder_random)
    }

    /// What `signer` signs in its [`KeyOffer`].
    pub(crate) fn offer_digest(&self, signer: SessionRole, ephemeral_public: &[u8; 32]) -> [u8; 32] {
        self.base(b"proactive-key-offer-v1")
            .append(b"signer", signer.label())
            .append(b"ephemeral", ephemeral_public)
            .finish()
    }

    /// Full transcript hash, salts the key derivation and is confirmed by both MACs.
    pub(crate) fn session_digest(
        &self,
        initiator_ephemeral: &[u8; 32],
        responder_ephemeral: &[u8; 32],
        initiator_certificate: &Certificate,
        responder_certificate: &Certificate,
    ) -> [u8; 32] {
        self.base(b"proactive-handshake-v1")
            .append(b"initiator_ephemeral", initiator_ephemeral)
            .append(b"responder_ephemeral", responder_ephemeral)
            .append(b"initiator_certificate", initiator_certificate.fingerprint().as_bytes())
            .append(b"responder_certificate", responder_certificate.fingerprint().as_bytes())
            .finish()
    }
}

/// Security operations a body answers for its peers.
///
/// The responder half of the handshake plus certificate and policy queries.
/// A body with no security manager answers every call with
/// [`SecurityError::SecurityNotAvailable`].
#[async_trait]
pub trait SecurityNegotiable: Send + Sync {
    /// Checks policy and opens a responder-side handshake. Returns the new session id.
    async fn start_new_session(&self, offer: SessionOffer) -> Result<SessionId, SecurityError>;

    /// Exchanges raw randoms for `session_id`.
    async fn random_value(
        &self,
        session_id: SessionId,
        client_random: [u8; 32],
    ) -> Result<[u8; 32], SecurityError>;

    async fn negotiate_key_receiver_side(
        &self,
        session_id: SessionId,
        ticket: ConfidentialityTicket,
    ) -> Result<ConfidentialityTicket, SecurityError>;

    /// Validates the initiator's certificate and signed ephemeral key, answers with its own.
    async fn public_key_exchange(
        &self,
        session_id: SessionId,
        offer: KeyOffer,
    ) -> Result<KeyOffer, SecurityError>;

    /// Verifies the initiator's key confirmation, establishes, answers with its own.
    async fn secret_key_exchange(
        &self,
        session_id: SessionId,
        confirmation: KeyConfirmation,
    ) -> Result<KeyConfirmation, SecurityError>;

    /// Ends a session or abandons a handshake. Unknown ids are ignored.
    async fn terminate_session(&self, session_id: SessionId) -> Result<(), SecurityError>;

    async fn certificate(&self) -> Result<Certificate, SecurityError>;

    async fn certificate_encoded(&self) -> Result<Vec<u8>, SecurityError>;

    async fn public_key(&self) -> Result<[u8; 32], SecurityError>;

    /// Policy applied to requests coming from the holder of `certificate`.
    async fn policy_from(&self, certificate: &Certificate) -> Result<Communication, SecurityError>;

    /// Policy for `kind` from this body to the `to` entities.
    async fn policy_to(
        &self,
        kind: &CommunicationKind,
        to: &[Entity],
    ) -> Result<Communication, SecurityError>;

    async fn policy(&self, context: SecurityContext) -> Result<SecurityContext, SecurityError>;

    async fn vn_name(&self) -> Result<Option<String>, SecurityError>;

    async fn entities(&self) -> Result<Vec<Entity>, SecurityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> Exchange {
        Exchange {
            session_id: SessionId::new(3),
            initiator: BodyId::new(),
            responder: BodyId::new(),
            initiator_random: [1; 32],
            responder_random: [2; 32],
        }
    }

    #[test]
    fn test_offer_digest_binds_signer_role() {
        let ex = exchange();
        let eph = [9; 32];
        assert_ne!(
            ex.offer_digest(SessionRole::Initiator, &eph),
            ex.offer_digest(SessionRole::Responder, &eph)
        );
    }

    #[test]
    fn test_offer_digest_binds_randoms() {
        let ex = exchange();
        let mut other = ex;
        other.responder_random[0] ^= 1;
        let eph = [9; 32];
        assert_ne!(
            ex.offer_digest(SessionRole::Initiator, &eph),
            other.offer_digest(SessionRole::Initiator, &eph)
        );
    }
}
