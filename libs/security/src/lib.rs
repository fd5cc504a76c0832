//! # proactive-security
//!
//! Authenticated, encrypted sessions between pairs of bodies.
//!
//! ## Handshake
//!
//! ```text
//! initiator                                   responder
//!   | policy_to(kind, me, peer)                  |
//!   |--- start_new_session(offer) -------------->| policy check, allocate SessionId
//!   |--- negotiate_key_receiver_side(ticket) --->| exchange fresh randoms
//!   |--- public_key_exchange(cert, eph, sig) --->| validate cert + signature
//!   |<-- (cert, eph, sig) -----------------------|
//!   |--- secret_key_exchange(mac) -------------->| verify key confirmation
//!   |<-- mac ------------------------------------| ESTABLISHED
//!   ESTABLISHED
//! ```
//!
//! The shared secret comes from X25519 over ephemeral keys; certificates and
//! transcript signatures use Ed25519; traffic is sealed with AES-256-GCM using
//! one key per direction.
//!
//! A body without a [`SecurityManager`] cannot take part in any of this: every
//! operation on it fails with [`SecurityError::SecurityNotAvailable`].

mod certificate;
mod crypto;
mod error;
mod manager;
mod negotiation;
mod policy;
mod session;
mod table;

pub use certificate::{Certificate, CertificateAuthority, EntityKeys, TrustStore};
pub use crypto::KEY_BYTES;
pub use error::SecurityError;
pub use manager::{SecurityManager, SecurityProfile};
pub use negotiation::{
    ConfidentialityTicket, KeyConfirmation, KeyOffer, SecurityNegotiable, SessionOffer,
};
pub use policy::{
    Communication, CommunicationKind, Entity, EntityKind, EntityPattern, PolicyRule,
    PolicyServer, Requirement, SecurityContext,
};
pub use session::{SealedPayload, SecuritySession, SessionLimits, SessionRole, SessionState};
pub use table::{SessionKey, SessionTable};
