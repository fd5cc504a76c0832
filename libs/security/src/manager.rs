//! Per-body security manager.
//!
//! A [`SecurityProfile`] holds what a runtime's bodies share (key, certificate,
//! trust anchors, policies). [`SecurityProfile::manager_for`] binds it to one
//! body and the process session table. The manager drives the initiator side
//! of the handshake itself and answers the responder side through
//! [`SecurityNegotiable`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use proactive_id::{BodyId, SessionId};
use tracing::{debug, info, warn};

use crate::certificate::{verify_signature, Certificate, EntityKeys, TrustStore};
use crate::crypto::{hmac_sha256, random_bytes, verify_hmac, DerivedKeys, EphemeralKey, RANDOM_BYTES};
use crate::error::SecurityError;
use crate::negotiation::{
    ConfidentialityTicket, Exchange, KeyConfirmation, KeyOffer, SecurityNegotiable, SessionOffer,
};
use crate::policy::{
    describe, Communication, CommunicationKind, Entity, EntityKind, PolicyServer, SecurityContext,
};
use crate::session::{SealedPayload, SecuritySession, SessionRole, SessionState};
use crate::table::{SessionKey, SessionSlot, SessionTable};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Security material shared by the bodies of one runtime.
#[derive(Clone)]
pub struct SecurityProfile {
    keys: EntityKeys,
    certificate: Certificate,
    trust: TrustStore,
    policies: PolicyServer,
    entities: Vec<Entity>,
    vn_name: Option<String>,
    handshake_timeout: Duration,
}

impl SecurityProfile {
    /// The certificate's subject becomes the runtime entity of every body.
    pub fn new(
        keys: EntityKeys,
        certificate: Certificate,
        trust: TrustStore,
    ) -> Result<Self, SecurityError> {
        if certificate.public_key != keys.public_key() {
            return Err(SecurityError::InvalidKey(format!(
                "certificate for '{}' does not match the entity key",
                certificate.subject
            )));
        }

        let entities = vec![Entity::new(EntityKind::Runtime, certificate.subject.clone())];
        Ok(Self {
            keys,
            certificate,
            trust,
            policies: PolicyServer::default(),
            entities,
            vn_name: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_policies(mut self, policies: PolicyServer) -> Self {
        self.policies = policies;
        self
    }

    #[must_use]
    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    /// Sets the virtual node name and adds it as an entity.
    #[must_use]
    pub fn with_vn_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.entities
            .push(Entity::new(EntityKind::VirtualNode, name.clone()));
        self.vn_name = Some(name);
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn policies(&self) -> &PolicyServer {
        &self.policies
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// A manager for `body`, with `body` itself added as an object entity.
    pub fn manager_for(&self, body: BodyId, sessions: Arc<SessionTable>) -> SecurityManager {
        let mut entities = self.entities.clone();
        entities.push(Entity::new(EntityKind::Object, body.to_string()));

        SecurityManager {
            body,
            keys: self.keys.clone(),
            certificate: self.certificate.clone(),
            trust: self.trust.clone(),
            policies: self.policies.clone(),
            entities,
            vn_name: self.vn_name.clone(),
            handshake_timeout: self.handshake_timeout,
            sessions,
        }
    }
}

impl std::fmt::Debug for SecurityProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityProfile")
            .field("subject", &self.certificate.subject)
            .field("entities", &self.entities)
            .field("rules", &self.policies.rules().len())
            .finish_non_exhaustive()
    }
}

/// Security state and operations of one body.
#[derive(Clone)]
pub struct SecurityManager {
    body: BodyId,
    keys: EntityKeys,
    certificate: Certificate,
    trust: TrustStore,
    policies: PolicyServer,
    entities: Vec<Entity>,
    vn_name: Option<String>,
    handshake_timeout: Duration,
    sessions: Arc<SessionTable>,
}

impl SecurityManager {
    pub fn body_id(&self) -> BodyId {
        self.body
    }

    #[must_use]
    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// This body's policy for `kind` towards the `remote` entities.
    pub fn communication_to(&self, kind: &CommunicationKind, remote: &[Entity]) -> Communication {
        self.policies.policy_to(kind, &self.entities, remote)
    }

    /// Checks whether an unsealed `kind` message from `remote` may be accepted.
    ///
    /// `remote` is `None` when the sender has no security manager.
    pub fn admit_plain(
        &self,
        kind: &CommunicationKind,
        remote: Option<&[Entity]>,
    ) -> Result<(), SecurityError> {
        let from = remote.unwrap_or_default();
        let policy = self.policies.policy_to(kind, from, &self.entities);
        if policy.allowed && !policy.requires_session() {
            return Ok(());
        }
        if policy.allowed && remote.is_none() {
            return Err(SecurityError::SecurityNotAvailable);
        }
        Err(SecurityError::CommunicationForbidden {
            kind: kind.clone(),
            from: describe(from),
            to: describe(&self.entities),
        })
    }

    fn key(&self, remote: BodyId) -> SessionKey {
        SessionKey::new(self.body, remote)
    }

    pub fn session_state(&self, remote: BodyId) -> Option<SessionState> {
        self.sessions.state(&self.key(remote))
    }

    pub fn session_id(&self, remote: BodyId) -> Option<SessionId> {
        self.sessions.session_id(&self.key(remote))
    }

    pub fn key_fingerprint(&self, remote: BodyId) -> Option<String> {
        self.sessions
            .get(&self.key(remote))
            .and_then(|slot| slot.read(|s| s.key_fingerprint().map(str::to_string)))
    }

    pub fn remote_certificate(&self, remote: BodyId) -> Option<Certificate> {
        self.sessions
            .get(&self.key(remote))
            .and_then(|slot| slot.read(|s| s.remote_certificate().cloned()))
    }

    /// Runs the handshake with `remote` as initiator.
    ///
    /// If a handshake for the pair is already running, waits for it instead.
    pub async fn initiate_session(
        &self,
        remote_id: BodyId,
        remote: &dyn SecurityNegotiable,
        kind: CommunicationKind,
    ) -> Result<SessionId, SecurityError> {
        self.run_initiator(remote_id, remote, kind).await
    }

    /// Returns a usable session with `remote`, negotiating one if needed.
    pub async fn ensure_session(
        &self,
        remote_id: BodyId,
        remote: &dyn SecurityNegotiable,
        kind: CommunicationKind,
    ) -> Result<SessionId, SecurityError> {
        if let Some(slot) = self.sessions.get(&self.key(remote_id)) {
            let (state, current) = slot.read(|s| (s.state(), s.session_id()));
            match (state, current) {
                (SessionState::Established | SessionState::Renegotiating, Some(id)) => return Ok(id),
                (SessionState::Negotiating, _) => {
                    return self.wait_established(&slot, remote_id).await
                }
                _ => {}
            }
        }
        self.run_initiator(remote_id, remote, kind).await
    }

    /// Forces a fresh handshake; the old keys keep opening in-flight messages.
    pub async fn renegotiate(
        &self,
        remote_id: BodyId,
        remote: &dyn SecurityNegotiable,
        kind: CommunicationKind,
    ) -> Result<SessionId, SecurityError> {
        info!(local = %self.body, remote = %remote_id, "renegotiating security session");
        self.run_initiator(remote_id, remote, kind).await
    }

    /// Ends the session on both sides.
    pub async fn close_session(
        &self,
        remote_id: BodyId,
        remote: &dyn SecurityNegotiable,
    ) -> Result<(), SecurityError> {
        if let Some(id) = self.session_id(remote_id) {
            remote.terminate_session(id).await?;
        }
        self.sessions.remove(&self.key(remote_id));
        Ok(())
    }

    pub fn seal(
        &self,
        remote: BodyId,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<SealedPayload, SecurityError> {
        let slot = self
            .sessions
            .get(&self.key(remote))
            .ok_or_else(|| SecurityError::renegotiate(None, "no session with peer"))?;
        slot.update(|s| s.seal(plaintext, aad))
    }

    pub fn open(
        &self,
        remote: BodyId,
        sealed: &SealedPayload,
        aad: &[u8],
    ) -> Result<Vec<u8>, SecurityError> {
        let slot = self.sessions.get(&self.key(remote)).ok_or_else(|| {
            SecurityError::renegotiate(Some(sealed.session_id), "no session with peer")
        })?;
        slot.read(|s| s.open(sealed, aad))
    }

    async fn run_initiator(
        &self,
        remote_id: BodyId,
        remote: &dyn SecurityNegotiable,
        kind: CommunicationKind,
    ) -> Result<SessionId, SecurityError> {
        if remote_id == self.body {
            return Err(SecurityError::KeyExchange(
                "a body cannot open a session with itself".to_string(),
            ));
        }

        let remote_entities = remote.entities().await?;
        let communication = self.communication_to(&kind, &remote_entities);
        if !communication.allowed {
            warn!(local = %self.body, remote = %remote_id, kind = %kind, "communication forbidden by local policy");
            return Err(SecurityError::CommunicationForbidden {
                kind,
                from: describe(&self.entities),
                to: describe(&remote_entities),
            });
        }

        let slot = self.sessions.get_or_create(self.key(remote_id));
        let attempt = match slot.update(|s| s.begin(SessionRole::Initiator)) {
            Ok(attempt) => attempt,
            Err(SecurityError::InvalidState { .. }) => {
                return self.wait_established(&slot, remote_id).await
            }
            Err(err) => return Err(err),
        };
        debug!(local = %self.body, remote = %remote_id, attempt, "handshake started");

        let offer = SessionOffer {
            initiator: self.body,
            kind,
            entities: self.entities.clone(),
            communication,
        };
        let mut pending = None;
        let outcome = match tokio::time::timeout(
            self.handshake_timeout,
            self.drive_initiator(&slot, attempt, remote_id, remote, offer, &mut pending),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(SecurityError::HandshakeTimeout { remote: remote_id }),
        };

        match outcome {
            Ok(session_id) => {
                info!(
                    local = %self.body,
                    remote = %remote_id,
                    session_id = %session_id,
                    role = "initiator",
                    "security session established"
                );
                Ok(session_id)
            }
            Err(SecurityError::HandshakeCollision { .. }) => {
                debug!(local = %self.body, remote = %remote_id, "handshake collision, deferring to peer");
                if let Some(session_id) = pending {
                    self.abandon_remote(remote, session_id).await;
                }
                self.wait_established(&slot, remote_id).await
            }
            Err(err) => {
                warn!(local = %self.body, remote = %remote_id, error = %err, "handshake failed");
                let discard = slot.update(|s| {
                    if s.attempt() == attempt {
                        s.fail();
                    }
                    s.state() == SessionState::Failed
                });
                // A refused pair keeps no session entry.
                if discard && matches!(err, SecurityError::CommunicationForbidden { .. }) {
                    self.sessions.remove(&self.key(remote_id));
                }
                if let Some(session_id) = pending {
                    self.abandon_remote(remote, session_id).await;
                }
                Err(err)
            }
        }
    }

    async fn drive_initiator(
        &self,
        slot: &SessionSlot,
        attempt: u64,
        remote_id: BodyId,
        remote: &dyn SecurityNegotiable,
        offer: SessionOffer,
        pending: &mut Option<SessionId>,
    ) -> Result<SessionId, SecurityError> {
        let session_id = remote.start_new_session(offer).await?;
        *pending = Some(session_id);
        initiator_step(slot, attempt, |s| {
            s.handshake_mut()?.session_id = Some(session_id);
            Ok(())
        })?;

        let initiator_random = random_bytes::<RANDOM_BYTES>();
        let ticket = remote
            .negotiate_key_receiver_side(session_id, ConfidentialityTicket { nonce: initiator_random })
            .await?;
        let exchange = Exchange {
            session_id,
            initiator: self.body,
            responder: remote_id,
            initiator_random,
            responder_random: ticket.nonce,
        };

        let ephemeral = EphemeralKey::generate();
        let offer = KeyOffer {
            certificate: self.certificate.clone(),
            ephemeral_public: ephemeral.public(),
            signature: self
                .keys
                .sign(&exchange.offer_digest(SessionRole::Initiator, &ephemeral.public())),
        };
        let answer = remote.public_key_exchange(session_id, offer).await?;
        self.authenticate(
            &answer.certificate,
            &exchange.offer_digest(SessionRole::Responder, &answer.ephemeral_public),
            &answer.signature,
        )?;

        let shared = ephemeral.agree(&answer.ephemeral_public)?;
        let transcript = exchange.session_digest(
            &ephemeral.public(),
            &answer.ephemeral_public,
            &self.certificate,
            &answer.certificate,
        );
        let keys = DerivedKeys::derive(&shared, &transcript)?;
        let confirmation_key = keys.confirmation;
        let mac = hmac_sha256(&confirmation_key, &[SessionRole::Initiator.label(), &transcript[..]])?;

        initiator_step(slot, attempt, |s| {
            let handshake = s.handshake_mut()?;
            handshake.initiator_random = Some(initiator_random);
            handshake.responder_random = Some(ticket.nonce);
            handshake.remote_certificate = Some(answer.certificate);
            handshake.keys = Some(keys);
            handshake.transcript_hash = Some(transcript);
            Ok(())
        })?;

        let reply = remote
            .secret_key_exchange(session_id, KeyConfirmation { mac: mac.to_vec() })
            .await?;
        let confirmed = verify_hmac(
            &confirmation_key,
            &[SessionRole::Responder.label(), &transcript[..]],
            &reply.mac,
        )?;
        if !confirmed {
            return Err(SecurityError::KeyExchange(
                "responder key confirmation mismatch".to_string(),
            ));
        }

        initiator_step(slot, attempt, SecuritySession::establish)
    }

    /// Waits for a handshake run by someone else to establish the pair's session.
    async fn wait_established(
        &self,
        slot: &SessionSlot,
        remote_id: BodyId,
    ) -> Result<SessionId, SecurityError> {
        let attempt = slot.read(SecuritySession::attempt);
        let mut states = slot.subscribe();

        let wait = async {
            loop {
                let state = *states.borrow_and_update();
                match state {
                    SessionState::Established => {
                        if let Some(id) = slot.read(SecuritySession::session_id) {
                            return Ok(id);
                        }
                    }
                    SessionState::Negotiating | SessionState::Renegotiating => {}
                    SessionState::Failed => {
                        return Err(SecurityError::renegotiate(None, "concurrent handshake failed"))
                    }
                    SessionState::Uninitialized | SessionState::Expired => {
                        return Err(SecurityError::renegotiate(
                            None,
                            format!("session {} while waiting for handshake", state),
                        ))
                    }
                }
                if states.changed().await.is_err() {
                    return Err(SecurityError::renegotiate(None, "session slot dropped"));
                }
            }
        };

        match tokio::time::timeout(self.handshake_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                slot.update(|s| {
                    if s.attempt() == attempt && s.state() == SessionState::Negotiating {
                        s.fail();
                    }
                });
                Err(SecurityError::HandshakeTimeout { remote: remote_id })
            }
        }
    }

    async fn abandon_remote(&self, remote: &dyn SecurityNegotiable, session_id: SessionId) {
        match tokio::time::timeout(self.handshake_timeout, remote.terminate_session(session_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(local = %self.body, session_id = %session_id, error = %err, "peer refused to abandon handshake")
            }
            Err(_) => {
                debug!(local = %self.body, session_id = %session_id, "peer did not answer handshake abandon")
            }
        }
    }

    fn authenticate(
        &self,
        certificate: &Certificate,
        digest: &[u8; 32],
        signature: &[u8],
    ) -> Result<(), SecurityError> {
        self.trust.validate(certificate, Utc::now())?;
        verify_signature(&certificate.public_key, digest, signature)
    }

    fn responder_slot(&self, session_id: SessionId) -> Result<(BodyId, Arc<SessionSlot>), SecurityError> {
        let initiator = self
            .sessions
            .lookup(self.body, session_id)
            .ok_or_else(|| SecurityError::renegotiate(Some(session_id), "unknown session"))?;
        let slot = self
            .sessions
            .get(&self.key(initiator))
            .ok_or_else(|| SecurityError::renegotiate(Some(session_id), "session was removed"))?;
        Ok((initiator, slot))
    }

    /// Runs a responder step; a failed step (other than a renegotiation
    /// signal) fails the pair's handshake.
    fn responder_step<R>(
        &self,
        slot: &SessionSlot,
        session_id: SessionId,
        f: impl FnOnce(&mut SecuritySession) -> Result<R, SecurityError>,
    ) -> Result<R, SecurityError> {
        let result = slot.update(|s| {
            let result = f(s);
            if let Err(err) = &result {
                if !err.is_renegotiate() && s.pending_session_id() == Some(session_id) {
                    s.fail();
                }
            }
            result
        });

        if let Err(err) = &result {
            warn!(local = %self.body, session_id = %session_id, error = %err, "handshake step rejected");
        }
        result
    }

    fn answer_key_offer(
        &self,
        exchange: &Exchange,
        offer: &KeyOffer,
    ) -> Result<(KeyOffer, DerivedKeys, [u8; 32]), SecurityError> {
        self.authenticate(
            &offer.certificate,
            &exchange.offer_digest(SessionRole::Initiator, &offer.ephemeral_public),
            &offer.signature,
        )?;

        let ephemeral = EphemeralKey::generate();
        let shared = ephemeral.agree(&offer.ephemeral_public)?;
        let transcript = exchange.session_digest(
            &offer.ephemeral_public,
            &ephemeral.public(),
            &offer.certificate,
            &self.certificate,
        );
        let keys = DerivedKeys::derive(&shared, &transcript)?;

        let answer = KeyOffer {
            certificate: self.certificate.clone(),
            ephemeral_public: ephemeral.public(),
            signature: self
                .keys
                .sign(&exchange.offer_digest(SessionRole::Responder, &ephemeral.public())),
        };
        Ok((answer, keys, transcript))
    }
}

/// Applies `f` only if the initiator's attempt still owns the slot.
fn initiator_step<R>(
    slot: &SessionSlot,
    attempt: u64,
    f: impl FnOnce(&mut SecuritySession) -> Result<R, SecurityError>,
) -> Result<R, SecurityError> {
    slot.update(|s| {
        if s.attempt() != attempt || s.handshake_role() != Some(SessionRole::Initiator) {
            return Err(SecurityError::HandshakeCollision { remote: s.remote() });
        }
        f(s)
    })
}

#[async_trait]
impl SecurityNegotiable for SecurityManager {
    async fn start_new_session(&self, offer: SessionOffer) -> Result<SessionId, SecurityError> {
        if offer.initiator == self.body {
            return Err(SecurityError::KeyExchange(
                "a body cannot open a session with itself".to_string(),
            ));
        }

        let local_view = self
            .policies
            .policy_to(&offer.kind, &offer.entities, &self.entities);
        if !offer.communication.combine(&local_view).allowed {
            warn!(
                local = %self.body,
                remote = %offer.initiator,
                kind = %offer.kind,
                "communication forbidden by policy"
            );
            return Err(SecurityError::CommunicationForbidden {
                kind: offer.kind,
                from: describe(&offer.entities),
                to: describe(&self.entities),
            });
        }

        let local = self.body;
        let initiator = offer.initiator;
        let slot = self.sessions.get_or_create(self.key(initiator));
        let session_id = self.sessions.allocate_session_id();

        slot.update(|s| {
            if s.state().is_negotiating() {
                // Both sides initiated: the lower identity's attempt wins.
                if s.handshake_role() == Some(SessionRole::Initiator) && local < initiator {
                    return Err(SecurityError::HandshakeCollision { remote: local });
                }
                s.restart(SessionRole::Responder)?;
            } else {
                s.begin(SessionRole::Responder)?;
            }
            s.handshake_mut()?.session_id = Some(session_id);
            Ok(())
        })?;
        self.sessions.index(local, session_id, initiator);

        debug!(local = %local, remote = %initiator, session_id = %session_id, "handshake accepted");
        Ok(session_id)
    }

    async fn random_value(
        &self,
        session_id: SessionId,
        client_random: [u8; 32],
    ) -> Result<[u8; 32], SecurityError> {
        let (_, slot) = self.responder_slot(session_id)?;
        let responder_random = random_bytes::<RANDOM_BYTES>();

        self.responder_step(&slot, session_id, |s| {
            let handshake = s.handshake_for(session_id)?;
            if handshake.initiator_random.is_some() {
                return Err(SecurityError::KeyExchange(
                    "randoms already exchanged".to_string(),
                ));
            }
            handshake.initiator_random = Some(client_random);
            handshake.responder_random = Some(responder_random);
            Ok(responder_random)
        })
    }

    async fn negotiate_key_receiver_side(
        &self,
        session_id: SessionId,
        ticket: ConfidentialityTicket,
    ) -> Result<ConfidentialityTicket, SecurityError> {
        let nonce = self.random_value(session_id, ticket.nonce).await?;
        Ok(ConfidentialityTicket { nonce })
    }

    async fn public_key_exchange(
        &self,
        session_id: SessionId,
        offer: KeyOffer,
    ) -> Result<KeyOffer, SecurityError> {
        let (initiator, slot) = self.responder_slot(session_id)?;
        let (initiator_random, responder_random) =
            self.responder_step(&slot, session_id, |s| {
                let handshake = s.handshake_for(session_id)?;
                match (handshake.initiator_random, handshake.responder_random) {
                    (Some(i), Some(r)) => Ok((i, r)),
                    _ => Err(SecurityError::KeyExchange(
                        "randoms were not exchanged".to_string(),
                    )),
                }
            })?;

        let exchange = Exchange {
            session_id,
            initiator,
            responder: self.body,
            initiator_random,
            responder_random,
        };
        let answered = self.answer_key_offer(&exchange, &offer);

        self.responder_step(&slot, session_id, move |s| {
            let (answer, keys, transcript) = answered?;
            let handshake = s.handshake_for(session_id)?;
            handshake.remote_certificate = Some(offer.certificate);
            handshake.keys = Some(keys);
            handshake.transcript_hash = Some(transcript);
            Ok(answer)
        })
    }

    async fn secret_key_exchange(
        &self,
        session_id: SessionId,
        confirmation: KeyConfirmation,
    ) -> Result<KeyConfirmation, SecurityError> {
        let (initiator, slot) = self.responder_slot(session_id)?;

        let mac = self.responder_step(&slot, session_id, |s| {
            let (keys, transcript) = {
                let handshake = s.handshake_for(session_id)?;
                (handshake.keys.clone(), handshake.transcript_hash)
            };
            let (Some(keys), Some(transcript)) = (keys, transcript) else {
                return Err(SecurityError::KeyExchange(
                    "public keys were not exchanged".to_string(),
                ));
            };

            let confirmed = verify_hmac(
                &keys.confirmation,
                &[SessionRole::Initiator.label(), &transcript[..]],
                &confirmation.mac,
            )?;
            if !confirmed {
                return Err(SecurityError::KeyExchange(
                    "initiator key confirmation mismatch".to_string(),
                ));
            }

            let mac = hmac_sha256(&keys.confirmation, &[SessionRole::Responder.label(), &transcript[..]])?;
            s.establish()?;
            Ok(mac)
        })?;

        info!(
            local = %self.body,
            remote = %initiator,
            session_id = %session_id,
            role = "responder",
            "security session established"
        );
        Ok(KeyConfirmation { mac: mac.to_vec() })
    }

    async fn terminate_session(&self, session_id: SessionId) -> Result<(), SecurityError> {
        let Some((remote, slot)) = self.sessions.find_by_session(self.body, session_id) else {
            debug!(local = %self.body, session_id = %session_id, "terminate for unknown session ignored");
            return Ok(());
        };

        let emptied = slot.update(|s| s.terminate(session_id));
        if emptied {
            self.sessions.remove(&self.key(remote));
        }
        info!(local = %self.body, remote = %remote, session_id = %session_id, "security session terminated");
        Ok(())
    }

    async fn certificate(&self) -> Result<Certificate, SecurityError> {
        Ok(self.certificate.clone())
    }

    async fn certificate_encoded(&self) -> Result<Vec<u8>, SecurityError> {
        self.certificate.encode()
    }

    async fn public_key(&self) -> Result<[u8; 32], SecurityError> {
        Ok(self.keys.public_key())
    }

    async fn policy_from(&self, certificate: &Certificate) -> Result<Communication, SecurityError> {
        let from = [Entity::new(EntityKind::Runtime, certificate.subject.clone())];
        Ok(self
            .policies
            .policy_to(&CommunicationKind::Request, &from, &self.entities))
    }

    async fn policy_to(
        &self,
        kind: &CommunicationKind,
        to: &[Entity],
    ) -> Result<Communication, SecurityError> {
        Ok(self.communication_to(kind, to))
    }

    async fn policy(&self, context: SecurityContext) -> Result<SecurityContext, SecurityError> {
        Ok(self.policies.policy(context))
    }

    async fn vn_name(&self) -> Result<Option<String>, SecurityError> {
        Ok(self.vn_name.clone())
    }

    async fn entities(&self) -> Result<Vec<Entity>, SecurityError> {
        Ok(self.entities.clone())
    }
}

impl std::fmt::Debug for SecurityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityManager")
            .field("body", &self.body)
            .field("subject", &self.certificate.subject)
            .field("entities", &self.entities)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::CertificateAuthority;

    fn profile(ca: &CertificateAuthority, subject: &str) -> SecurityProfile {
        let keys = EntityKeys::generate();
        let cert = ca.issue(subject, keys.public_key(), chrono::Duration::hours(1));
        let trust = TrustStore::new().with_anchor(ca.certificate()).unwrap();
        SecurityProfile::new(keys, cert, trust).unwrap()
    }

    #[test]
    fn test_profile_rejects_foreign_certificate() {
        let ca = CertificateAuthority::new_root("root", chrono::Duration::days(1));
        let cert = ca.issue("rt", EntityKeys::generate().public_key(), chrono::Duration::hours(1));
        let result = SecurityProfile::new(EntityKeys::generate(), cert, TrustStore::new());
        assert!(matches!(result, Err(SecurityError::InvalidKey(_))));
    }

    #[test]
    fn test_manager_entities() {
        let ca = CertificateAuthority::new_root("root", chrono::Duration::days(1));
        let body = BodyId::new();
        let manager = profile(&ca, "rt-1")
            .with_vn_name("workers")
            .manager_for(body, Arc::new(SessionTable::default()));

        let names: Vec<String> = manager.entities.iter().map(Entity::to_string).collect();
        assert_eq!(
            names,
            vec![
                "runtime:rt-1".to_string(),
                "vn:workers".to_string(),
                format!("object:{}", body)
            ]
        );
    }

    #[test]
    fn test_admit_plain_follows_own_policy() {
        let ca = CertificateAuthority::new_root("root", chrono::Duration::days(1));
        let table = Arc::new(SessionTable::default());
        let peer = [Entity::new(EntityKind::Runtime, "rt-peer")];

        let open = profile(&ca, "rt").manager_for(BodyId::new(), table.clone());
        open.admit_plain(&CommunicationKind::Request, None).unwrap();
        open.admit_plain(&CommunicationKind::Request, Some(&peer)).unwrap();

        let secured = profile(&ca, "rt")
            .with_policies(PolicyServer::new(Communication::secured()))
            .manager_for(BodyId::new(), table);
        assert!(matches!(
            secured.admit_plain(&CommunicationKind::Request, None),
            Err(SecurityError::SecurityNotAvailable)
        ));
        assert!(matches!(
            secured.admit_plain(&CommunicationKind::Request, Some(&peer)),
            Err(SecurityError::CommunicationForbidden { .. })
        ));
    }

    #[tokio::test]
    async fn test_handshake_between_two_bodies() {
        let ca = CertificateAuthority::new_root("root", chrono::Duration::days(1));
        let table = Arc::new(SessionTable::default());
        let (a_id, b_id) = (BodyId::new(), BodyId::new());
        let a = profile(&ca, "rt-a").manager_for(a_id, table.clone());
        let b = profile(&ca, "rt-b").manager_for(b_id, table.clone());

        let id = a
            .initiate_session(b_id, &b, CommunicationKind::Request)
            .await
            .unwrap();
        assert_eq!(b.session_id(a_id), Some(id));
        assert_eq!(a.key_fingerprint(b_id), b.key_fingerprint(a_id));
        assert_eq!(
            a.remote_certificate(b_id).map(|c| c.subject),
            Some("rt-b".to_string())
        );

        let sealed = a.seal(b_id, b"ping", b"").unwrap();
        assert_eq!(b.open(a_id, &sealed, b"").unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_terminate_unknown_session_is_noop() {
        let ca = CertificateAuthority::new_root("root", chrono::Duration::days(1));
        let manager = profile(&ca, "rt").manager_for(BodyId::new(), Arc::new(SessionTable::default()));
        manager.terminate_session(SessionId::new(99)).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_with_self_rejected() {
        let ca = CertificateAuthority::new_root("root", chrono::Duration::days(1));
        let id = BodyId::new();
        let manager = profile(&ca, "rt").manager_for(id, Arc::new(SessionTable::default()));
        let err = manager
            .initiate_session(id, &manager, CommunicationKind::Request)
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::KeyExchange(_)));
    }
}
