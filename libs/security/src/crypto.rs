//! Key-exchange and sealing primitives.
//!
//! - Ephemeral X25519 keys for the shared secret
//! - HKDF-SHA256 (built on HMAC) salted with the handshake transcript
//! - AES-256-GCM with deterministic per-direction counter nonces

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::SecurityError;
use crate::session::SessionRole;

pub const KEY_BYTES: usize = 32;
pub(crate) const NONCE_BYTES: usize = 12;
pub(crate) const RANDOM_BYTES: usize = 32;

const SALT_LABEL: &[u8] = b"proactive-session-v1";
const INFO_INITIATOR_TO_RESPONDER: &[u8] = b"proactive i2r";
const INFO_RESPONDER_TO_INITIATOR: &[u8] = b"proactive r2i";
const INFO_CONFIRMATION: &[u8] = b"proactive confirm";

type HmacSha256 = Hmac<Sha256>;

/// Fresh random bytes from the thread-local CSPRNG.
pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

pub(crate) fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], SecurityError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time MAC check.
pub(crate) fn verify_hmac(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<bool, SecurityError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.verify_slice(tag).is_ok())
}

fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> Result<[u8; 32], SecurityError> {
    hmac_sha256(salt, &[ikm])
}

// Single-block expand; every derived key is exactly one SHA-256 output.
fn hkdf_expand(prk: &[u8; 32], info: &[u8]) -> Result<[u8; 32], SecurityError> {
    hmac_sha256(prk, &[info, &[1u8][..]])
}

/// Length-prefixed, labelled SHA-256 accumulator for handshake transcripts.
pub(crate) struct Transcript(Sha256);

impl Transcript {
    pub(crate) fn new(label: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(label);
        Self(hasher)
    }

    pub(crate) fn append(mut self, label: &[u8], value: &[u8]) -> Self {
        self.0.update((label.len() as u32).to_be_bytes());
        self.0.update(label);
        self.0.update((value.len() as u64).to_be_bytes());
        self.0.update(value);
        self
    }

    pub(crate) fn finish(self) -> [u8; 32] {
        self.0.finalize().into()
    }
}

/// Ephemeral X25519 key pair for one handshake.
pub(crate) struct EphemeralKey {
    secret: StaticSecret,
    public: [u8; 32],
}

impl EphemeralKey {
    pub(crate) fn generate() -> Self {
        let secret = StaticSecret::from(random_bytes::<KEY_BYTES>());
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub(crate) fn public(&self) -> [u8; 32] {
        self.public
    }

    /// Shared secret with the peer's ephemeral key. Rejects low-order peer keys.
    pub(crate) fn agree(&self, peer_public: &[u8; 32]) -> Result<[u8; 32], SecurityError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(SecurityError::KeyExchange(
                "peer ephemeral key is not contributory".to_string(),
            ));
        }
        Ok(shared.to_bytes())
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Keys derived from one successful key agreement.
#[derive(Clone)]
pub(crate) struct DerivedKeys {
    pub(crate) initiator_to_responder: [u8; KEY_BYTES],
    pub(crate) responder_to_initiator: [u8; KEY_BYTES],
    pub(crate) confirmation: [u8; KEY_BYTES],
}

impl DerivedKeys {
    pub(crate) fn derive(
        shared_secret: &[u8; 32],
        transcript_hash: &[u8; 32],
    ) -> Result<Self, SecurityError> {
        let salt = Transcript::new(SALT_LABEL)
            .append(b"transcript", transcript_hash)
            .finish();
        let prk = hkdf_extract(&salt, shared_secret)?;

        Ok(Self {
            initiator_to_responder: hkdf_expand(&prk, INFO_INITIATOR_TO_RESPONDER)?,
            responder_to_initiator: hkdf_expand(&prk, INFO_RESPONDER_TO_INITIATOR)?,
            confirmation: hkdf_expand(&prk, INFO_CONFIRMATION)?,
        })
    }

    /// Public digest of the traffic keys; equal on both sides iff the keys are.
    pub(crate) fn fingerprint(&self) -> String {
        let digest = Sha256::new()
            .chain_update(self.initiator_to_responder)
            .chain_update(self.responder_to_initiator)
            .finalize();
        hex::encode(digest)[..16].to_string()
    }

    /// (send, receive) keys for the given role.
    pub(crate) fn for_role(&self, role: SessionRole) -> ([u8; KEY_BYTES], [u8; KEY_BYTES]) {
        match role {
            SessionRole::Initiator => (self.initiator_to_responder, self.responder_to_initiator),
            SessionRole::Responder => (self.responder_to_initiator, self.initiator_to_responder),
        }
    }
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DerivedKeys([REDACTED] fingerprint={})", self.fingerprint())
    }
}

/// Nonce for the `counter`-th message sent by `sender`.
pub(crate) fn counter_nonce(sender: SessionRole, counter: u64) -> [u8; NONCE_BYTES] {
    let mut nonce = [0u8; NONCE_BYTES];
    nonce[0] = match sender {
        SessionRole::Initiator => 0x49,
        SessionRole::Responder => 0x52,
    };
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

pub(crate) fn seal(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SecurityError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| SecurityError::InvalidKey(e.to_string()))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| SecurityError::Integrity)
}

pub(crate) fn open(
    key: &[u8; KEY_BYTES],
    nonce: &[u8; NONCE_BYTES],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, SecurityError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| SecurityError::InvalidKey(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| SecurityError::Integrity)
}
