//! Entity keys, certificates and trust validation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{random_bytes, Transcript, KEY_BYTES};
use crate::error::SecurityError;

/// Long-term Ed25519 signing key of an entity.
#[derive(Clone)]
pub struct EntityKeys {
    signing: SigningKey,
}

impl EntityKeys {
    /// Generates a fresh key pair.
    pub fn generate() -> Self {
        Self::from_seed(random_bytes::<KEY_BYTES>())
    }

    /// Rebuilds the key pair from its 32-byte seed.
    pub fn from_seed(seed: [u8; KEY_BYTES]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Loads a base64-encoded 32-byte seed.
    pub fn from_base64(encoded: &str) -> Result<Self, SecurityError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| SecurityError::InvalidKey(e.to_string()))?;
        let seed: [u8; KEY_BYTES] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SecurityError::InvalidKey(format!("expected {} bytes", KEY_BYTES)))?;
        Ok(Self::from_seed(seed))
    }

    /// The public half.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for EntityKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityKeys")
            .field("public_key", &hex::encode(self.public_key()))
            .field("signing", &"[REDACTED]")
            .finish()
    }
}

/// Verifies an Ed25519 signature; any failure is an authentication failure.
pub(crate) fn verify_signature(
    public_key: &[u8; 32],
    message: &[u8],
    signature: &[u8],
) -> Result<(), SecurityError> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| SecurityError::Authentication(format!("malformed public key: {}", e)))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| SecurityError::Authentication(format!("malformed signature: {}", e)))?;
    key.verify(message, &signature)
        .map_err(|_| SecurityError::Authentication("signature mismatch".to_string()))
}

/// A signed binding between a subject name and a public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub serial: u64,
    pub subject: String,
    pub issuer: String,
    pub public_key: [u8; 32],
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl Certificate {
    /// The signed portion.
    fn tbs(&self) -> [u8; 32] {
        Transcript::new(b"proactive-certificate-v1")
            .append(b"serial", &self.serial.to_be_bytes())
            .append(b"subject", self.subject.as_bytes())
            .append(b"issuer", self.issuer.as_bytes())
            .append(b"public_key", &self.public_key)
            .append(b"not_before", &self.not_before.timestamp().to_be_bytes())
            .append(b"not_after", &self.not_after.timestamp().to_be_bytes())
            .finish()
    }

    /// Hex SHA-256 over the signed portion and the signature.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::new()
            .chain_update(self.tbs())
            .chain_update(&self.signature)
            .finalize();
        hex::encode(digest)
    }

    /// Wire encoding (JSON).
    pub fn encode(&self) -> Result<Vec<u8>, SecurityError> {
        serde_json::to_vec(self).map_err(|e| SecurityError::InvalidKey(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SecurityError> {
        serde_json::from_slice(bytes)
            .map_err(|e| SecurityError::Authentication(format!("undecodable certificate: {}", e)))
    }

    pub fn is_self_signed(&self) -> bool {
        self.subject == self.issuer
    }

    fn check_validity(&self, now: DateTime<Utc>) -> Result<(), SecurityError> {
        if now < self.not_before {
            return Err(SecurityError::Authentication(format!(
                "certificate for '{}' not valid before {}",
                self.subject, self.not_before
            )));
        }
        if now > self.not_after {
            return Err(SecurityError::Authentication(format!(
                "certificate for '{}' expired at {}",
                self.subject, self.not_after
            )));
        }
        Ok(())
    }
}

/// Issues certificates under a self-signed root.
pub struct CertificateAuthority {
    name: String,
    keys: EntityKeys,
    certificate: Certificate,
    next_serial: AtomicU64,
}

impl CertificateAuthority {
    /// Creates a root authority with a fresh key and a self-signed certificate.
    pub fn new_root(name: impl Into<String>, validity: Duration) -> Self {
        let name = name.into();
        let keys = EntityKeys::generate();
        let certificate = sign_certificate(&keys, &name, 1, name.clone(), keys.public_key(), validity);

        Self {
            name,
            keys,
            certificate,
            next_serial: AtomicU64::new(2),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The root certificate to install in trust stores.
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Issues a certificate binding `subject` to `public_key`.
    pub fn issue(
        &self,
        subject: impl Into<String>,
        public_key: [u8; 32],
        validity: Duration,
    ) -> Certificate {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        sign_certificate(&self.keys, &self.name, serial, subject.into(), public_key, validity)
    }
}

fn sign_certificate(
    issuer_keys: &EntityKeys,
    issuer: &str,
    serial: u64,
    subject: String,
    public_key: [u8; 32],
    validity: Duration,
) -> Certificate {
    let not_before = Utc::now() - Duration::minutes(1);
    let mut certificate = Certificate {
        serial,
        subject,
        issuer: issuer.to_string(),
        public_key,
        not_before,
        not_after: not_before + validity,
        signature: Vec::new(),
    };
    certificate.signature = issuer_keys.sign(&certificate.tbs());
    certificate
}

/// Trusted issuer keys, by issuer name.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    anchors: HashMap<String, [u8; 32]>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a self-signed root after checking its own signature.
    pub fn trust(&mut self, root: &Certificate) -> Result<(), SecurityError> {
        if !root.is_self_signed() {
            return Err(SecurityError::Authentication(format!(
                "trust anchor '{}' is not self-signed",
                root.subject
            )));
        }
        verify_signature(&root.public_key, &root.tbs(), &root.signature)?;
        self.anchors.insert(root.subject.clone(), root.public_key);
        Ok(())
    }

    /// Builder form of [`TrustStore::trust`].
    pub fn with_anchor(mut self, root: &Certificate) -> Result<Self, SecurityError> {
        self.trust(root)?;
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Checks issuer trust, signature and validity window.
    pub fn validate(&self, certificate: &Certificate, now: DateTime<Utc>) -> Result<(), SecurityError> {
        let issuer_key = self.anchors.get(&certificate.issuer).ok_or_else(|| {
            SecurityError::Authentication(format!(
                "issuer '{}' of '{}' is not trusted",
                certificate.issuer, certificate.subject
            ))
        })?;

        verify_signature(issuer_key, &certificate.tbs(), &certificate.signature)?;
        certificate.check_validity(now)
    }
}
