//! Handshake behaviour between two bodies, including tampered exchanges.

use std::sync::Arc;

use async_trait::async_trait;
use proactive_id::{BodyId, SessionId};
use proactive_security::{
    Certificate, CertificateAuthority, Communication, CommunicationKind, ConfidentialityTicket,
    Entity, EntityKeys, EntityKind, EntityPattern, KeyConfirmation, KeyOffer, PolicyServer,
    SecurityContext, SecurityError, SecurityManager, SecurityNegotiable, SecurityProfile,
    SessionKey, SessionLimits, SessionOffer, SessionState, SessionTable, TrustStore,
};

fn root() -> CertificateAuthority {
    CertificateAuthority::new_root("grid-root", chrono::Duration::days(1))
}

fn profile(ca: &CertificateAuthority, subject: &str) -> SecurityProfile {
    let keys = EntityKeys::generate();
    let certificate = ca.issue(subject, keys.public_key(), chrono::Duration::hours(1));
    let trust = TrustStore::new().with_anchor(ca.certificate()).unwrap();
    SecurityProfile::new(keys, certificate, trust).unwrap()
}

struct Pair {
    a_id: BodyId,
    b_id: BodyId,
    a: Arc<SecurityManager>,
    b: Arc<SecurityManager>,
    table: Arc<SessionTable>,
}

fn pair_with(a: SecurityProfile, b: SecurityProfile, limits: SessionLimits) -> Pair {
    let table = Arc::new(SessionTable::new(limits));
    let (a_id, b_id) = (BodyId::new(), BodyId::new());
    Pair {
        a_id,
        b_id,
        a: Arc::new(a.manager_for(a_id, table.clone())),
        b: Arc::new(b.manager_for(b_id, table.clone())),
        table,
    }
}

fn pair() -> Pair {
    let ca = root();
    pair_with(
        profile(&ca, "rt-a"),
        profile(&ca, "rt-b"),
        SessionLimits::default(),
    )
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tamper {
    None,
    ResponderRandom,
    ResponderEphemeral,
    ResponderSignature,
    ResponderMac,
}

/// Forwards to a manager, yields before every call and can corrupt answers.
struct Wire {
    inner: Arc<SecurityManager>,
    tamper: Tamper,
}

impl Wire {
    fn new(inner: &Arc<SecurityManager>, tamper: Tamper) -> Self {
        Self {
            inner: inner.clone(),
            tamper,
        }
    }
}

#[async_trait]
impl SecurityNegotiable for Wire {
    async fn start_new_session(&self, offer: SessionOffer) -> Result<SessionId, SecurityError> {
        tokio::task::yield_now().await;
        self.inner.start_new_session(offer).await
    }

    async fn random_value(
        &self,
        session_id: SessionId,
        client_random: [u8; 32],
    ) -> Result<[u8; 32], SecurityError> {
        tokio::task::yield_now().await;
        self.inner.random_value(session_id, client_random).await
    }

    async fn negotiate_key_receiver_side(
        &self,
        session_id: SessionId,
        ticket: ConfidentialityTicket,
    ) -> Result<ConfidentialityTicket, SecurityError> {
        tokio::task::yield_now().await;
        let mut answer = self
            .inner
            .negotiate_key_receiver_side(session_id, ticket)
            .await?;
        if self.tamper == Tamper::ResponderRandom {
            answer.nonce[0] ^= 0xff;
        }
        Ok(answer)
    }

    async fn public_key_exchange(
        &self,
        session_id: SessionId,
        offer: KeyOffer,
    ) -> Result<KeyOffer, SecurityError> {
        tokio::task::yield_now().await;
        let mut answer = self.inner.public_key_exchange(session_id, offer).await?;
        match self.tamper {
            Tamper::ResponderEphemeral => answer.ephemeral_public[3] ^= 0x10,
            Tamper::ResponderSignature => answer.signature[0] ^= 0x01,
            _ => {}
        }
        Ok(answer)
    }

    async fn secret_key_exchange(
        &self,
        session_id: SessionId,
        confirmation: KeyConfirmation,
    ) -> Result<KeyConfirmation, SecurityError> {
        tokio::task::yield_now().await;
        let mut answer = self
            .inner
            .secret_key_exchange(session_id, confirmation)
            .await?;
        if self.tamper == Tamper::ResponderMac {
            answer.mac[5] ^= 0x20;
        }
        Ok(answer)
    }

    async fn terminate_session(&self, session_id: SessionId) -> Result<(), SecurityError> {
        self.inner.terminate_session(session_id).await
    }

    async fn certificate(&self) -> Result<Certificate, SecurityError> {
        self.inner.certificate().await
    }

    async fn certificate_encoded(&self) -> Result<Vec<u8>, SecurityError> {
        self.inner.certificate_encoded().await
    }

    async fn public_key(&self) -> Result<[u8; 32], SecurityError> {
        self.inner.public_key().await
    }

    async fn policy_from(&self, certificate: &Certificate) -> Result<Communication, SecurityError> {
        self.inner.policy_from(certificate).await
    }

    async fn policy_to(
        &self,
        kind: &CommunicationKind,
        to: &[Entity],
    ) -> Result<Communication, SecurityError> {
        self.inner.policy_to(kind, to).await
    }

    async fn policy(&self, context: SecurityContext) -> Result<SecurityContext, SecurityError> {
        self.inner.policy(context).await
    }

    async fn vn_name(&self) -> Result<Option<String>, SecurityError> {
        self.inner.vn_name().await
    }

    async fn entities(&self) -> Result<Vec<Entity>, SecurityError> {
        tokio::task::yield_now().await;
        self.inner.entities().await
    }
}

#[tokio::test]
async fn test_honest_parties_agree_on_session() {
    let p = pair();
    let wire = Wire::new(&p.b, Tamper::None);

    let id = p
        .a
        .initiate_session(p.b_id, &wire, CommunicationKind::Request)
        .await
        .unwrap();

    assert_eq!(p.a.session_state(p.b_id), Some(SessionState::Established));
    assert_eq!(p.b.session_state(p.a_id), Some(SessionState::Established));
    assert_eq!(p.b.session_id(p.a_id), Some(id));
    assert!(p.a.key_fingerprint(p.b_id).is_some());
    assert_eq!(p.a.key_fingerprint(p.b_id), p.b.key_fingerprint(p.a_id));

    let sealed = p.b.seal(p.a_id, b"reply", b"seq=1").unwrap();
    assert_eq!(p.a.open(p.b_id, &sealed, b"seq=1").unwrap(), b"reply");
}

#[tokio::test]
async fn test_tampering_never_establishes() {
    let cases = [
        (Tamper::ResponderRandom, "random"),
        (Tamper::ResponderEphemeral, "ephemeral"),
        (Tamper::ResponderSignature, "signature"),
        (Tamper::ResponderMac, "mac"),
    ];

    for (tamper, name) in cases {
        let p = pair();
        let wire = Wire::new(&p.b, tamper);

        let err = p
            .a
            .initiate_session(p.b_id, &wire, CommunicationKind::Request)
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                SecurityError::Authentication(_) | SecurityError::KeyExchange(_)
            ),
            "{}: unexpected error {:?}",
            name,
            err
        );

        assert_eq!(
            p.a.session_state(p.b_id),
            Some(SessionState::Failed),
            "{}",
            name
        );
        assert_ne!(
            p.b.session_state(p.a_id),
            Some(SessionState::Established),
            "{}",
            name
        );
        assert!(p.a.seal(p.b_id, b"x", b"").is_err(), "{}", name);
    }
}

#[tokio::test]
async fn test_initiator_mac_mismatch_fails_responder() {
    let p = pair();
    let b: &dyn SecurityNegotiable = p.b.as_ref();

    let offer = SessionOffer {
        initiator: p.a_id,
        kind: CommunicationKind::Request,
        entities: vec![Entity::new(EntityKind::Runtime, "rt-a")],
        communication: Communication::open(),
    };
    let id = b.start_new_session(offer).await.unwrap();
    b.negotiate_key_receiver_side(id, ConfidentialityTicket { nonce: [4; 32] })
        .await
        .unwrap();

    // Without a valid key offer the confirmation cannot be accepted.
    let err = b
        .secret_key_exchange(id, KeyConfirmation { mac: vec![0; 32] })
        .await
        .unwrap_err();
    assert!(matches!(err, SecurityError::KeyExchange(_)));
    assert_eq!(p.b.session_state(p.a_id), Some(SessionState::Failed));
}

#[tokio::test]
async fn test_untrusted_certificate_rejected() {
    let ca = root();
    let rogue = CertificateAuthority::new_root("rogue", chrono::Duration::days(1));
    let p = pair_with(
        profile(&ca, "rt-a"),
        profile(&rogue, "rt-b"),
        SessionLimits::default(),
    );

    let err = p
        .a
        .initiate_session(p.b_id, p.b.as_ref(), CommunicationKind::Request)
        .await
        .unwrap_err();
    assert!(matches!(err, SecurityError::Authentication(_)));
    assert!(err.is_fatal());
    assert_ne!(p.a.session_state(p.b_id), Some(SessionState::Established));
}

#[tokio::test]
async fn test_forbidden_policy_creates_no_session() {
    let ca = root();
    let policies = PolicyServer::default().forbid(
        CommunicationKind::Custom("X".to_string()),
        EntityPattern::named(EntityKind::Runtime, "rt-c"),
        EntityPattern::Any,
    );
    let p = pair_with(
        profile(&ca, "rt-c"),
        profile(&ca, "rt-b1").with_policies(policies),
        SessionLimits::default(),
    );

    let err = p
        .a
        .initiate_session(
            p.b_id,
            p.b.as_ref(),
            CommunicationKind::Custom("X".to_string()),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SecurityError::CommunicationForbidden { .. }));
    assert!(!p.table.contains(&SessionKey::new(p.b_id, p.a_id)));
    assert!(!p.table.contains(&SessionKey::new(p.a_id, p.b_id)));
    assert!(p.b.session_state(p.a_id).is_none());

    // Other kinds are still allowed.
    p.a.initiate_session(p.b_id, p.b.as_ref(), CommunicationKind::Request)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_local_policy_forbids_before_contacting_peer() {
    let ca = root();
    let policies = PolicyServer::new(Communication::forbidden());
    let p = pair_with(
        profile(&ca, "rt-a").with_policies(policies),
        profile(&ca, "rt-b"),
        SessionLimits::default(),
    );

    let err = p
        .a
        .initiate_session(p.b_id, p.b.as_ref(), CommunicationKind::Request)
        .await
        .unwrap_err();
    assert!(matches!(err, SecurityError::CommunicationForbidden { .. }));
    assert!(p.table.is_empty());
}

#[tokio::test]
async fn test_simultaneous_initiation_converges() {
    let p = pair();
    let to_b = Wire::new(&p.b, Tamper::None);
    let to_a = Wire::new(&p.a, Tamper::None);

    let (from_a, from_b) = tokio::join!(
        p.a.initiate_session(p.b_id, &to_b, CommunicationKind::Request),
        p.b.initiate_session(p.a_id, &to_a, CommunicationKind::Request),
    );
    let (from_a, from_b) = (from_a.unwrap(), from_b.unwrap());

    assert_eq!(p.a.session_id(p.b_id), p.b.session_id(p.a_id));
    assert_eq!(p.a.session_id(p.b_id), Some(from_a));
    assert_eq!(from_a, from_b);
    assert_eq!(p.a.key_fingerprint(p.b_id), p.b.key_fingerprint(p.a_id));

    let sealed = p.a.seal(p.b_id, b"hi", b"").unwrap();
    assert_eq!(p.b.open(p.a_id, &sealed, b"").unwrap(), b"hi");
}

#[tokio::test]
async fn test_renegotiation_keeps_in_flight_messages() {
    let p = pair();
    let old = p
        .a
        .initiate_session(p.b_id, p.b.as_ref(), CommunicationKind::Request)
        .await
        .unwrap();
    let in_flight = p.a.seal(p.b_id, b"before", b"").unwrap();

    let new = p
        .b
        .renegotiate(p.a_id, p.a.as_ref(), CommunicationKind::Request)
        .await
        .unwrap();
    assert_ne!(old, new);
    assert_eq!(p.a.session_id(p.b_id), Some(new));

    assert_eq!(p.b.open(p.a_id, &in_flight, b"").unwrap(), b"before");
    let after = p.a.seal(p.b_id, b"after", b"").unwrap();
    assert_eq!(after.session_id, new);
    assert_eq!(p.b.open(p.a_id, &after, b"").unwrap(), b"after");
}

#[tokio::test]
async fn test_expired_session_signals_renegotiation() {
    let ca = root();
    let limits = SessionLimits {
        max_messages: 1,
        max_lifetime: std::time::Duration::from_secs(60),
    };
    let p = pair_with(profile(&ca, "rt-a"), profile(&ca, "rt-b"), limits);
    p.a.ensure_session(p.b_id, p.b.as_ref(), CommunicationKind::Request)
        .await
        .unwrap();

    p.a.seal(p.b_id, b"one", b"").unwrap();
    let err = p.a.seal(p.b_id, b"two", b"").unwrap_err();
    assert!(err.is_renegotiate());
    assert_eq!(p.a.session_state(p.b_id), Some(SessionState::Expired));

    let fresh = p
        .a
        .ensure_session(p.b_id, p.b.as_ref(), CommunicationKind::Request)
        .await
        .unwrap();
    assert_eq!(p.a.session_id(p.b_id), Some(fresh));
    p.a.seal(p.b_id, b"two", b"").unwrap();
}

#[tokio::test]
async fn test_close_session_removes_both_sides() {
    let p = pair();
    p.a.initiate_session(p.b_id, p.b.as_ref(), CommunicationKind::Request)
        .await
        .unwrap();

    p.a.close_session(p.b_id, p.b.as_ref()).await.unwrap();
    assert!(p.a.session_state(p.b_id).is_none());
    assert!(p.b.session_state(p.a_id).is_none());
}

#[tokio::test]
async fn test_queries() {
    let ca = root();
    let p = pair_with(
        profile(&ca, "rt-a"),
        profile(&ca, "rt-b").with_vn_name("workers"),
        SessionLimits::default(),
    );
    let b: &dyn SecurityNegotiable = p.b.as_ref();

    assert_eq!(b.vn_name().await.unwrap(), Some("workers".to_string()));
    let cert = b.certificate().await.unwrap();
    assert_eq!(cert.subject, "rt-b");
    assert_eq!(b.public_key().await.unwrap(), cert.public_key);
    assert_eq!(
        Certificate::decode(&b.certificate_encoded().await.unwrap()).unwrap(),
        cert
    );
    assert!(b
        .entities()
        .await
        .unwrap()
        .contains(&Entity::new(EntityKind::VirtualNode, "workers")));

    let a_cert = p.a.certificate().await.unwrap();
    assert!(b.policy_from(&a_cert).await.unwrap().allowed);
}
