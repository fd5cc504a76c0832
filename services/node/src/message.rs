//! Request and reply envelopes.
//!
//! A request is correlated with its reply by `(sender, sequence)`. Payloads
//! travel either in clear or sealed under the security session of the two
//! bodies; the envelope fields are bound to sealed payloads as associated
//! data, so a sealed payload cannot be replayed into another envelope.

use std::fmt;

use proactive_id::{BodyId, SequenceNumber};
use proactive_security::SealedPayload;
use serde::{Deserialize, Serialize};

use crate::error::RemoteFault;

/// Structural name of a parameter type, used to tell overloads apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(String);

impl TypeTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TypeTag {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Method name plus ordered parameter types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodSignature {
    pub name: String,
    pub param_types: Vec<TypeTag>,
}

impl MethodSignature {
    /// A signature with no declared parameter types.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_types: Vec::new(),
        }
    }

    pub fn with_params<I, T>(name: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TypeTag>,
    {
        Self {
            name: name.into(),
            param_types: params.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<&str> for MethodSignature {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, tag) in self.param_types.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", tag)?;
        }
        f.write_str(")")
    }
}

/// Serialized arguments or result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Plain(serde_json::Value),
    Sealed(SealedPayload),
}

impl Payload {
    pub fn is_sealed(&self) -> bool {
        matches!(self, Payload::Sealed(_))
    }
}

/// Correlates a reply with the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub sender: BodyId,
    pub sequence: SequenceNumber,
}

impl CorrelationKey {
    pub fn new(sender: BodyId, sequence: SequenceNumber) -> Self {
        Self { sender, sequence }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.sender, self.sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub target: BodyId,
    pub method: MethodSignature,
    pub payload: Payload,
    pub sender: BodyId,
    pub sequence: SequenceNumber,
}

impl Request {
    pub fn correlation(&self) -> CorrelationKey {
        CorrelationKey::new(self.sender, self.sequence)
    }

    /// Associated data a sealed request payload is bound to.
    pub fn binding(
        target: BodyId,
        sender: BodyId,
        sequence: SequenceNumber,
        method: &MethodSignature,
    ) -> Vec<u8> {
        format!("request|{}|{}|{}|{}", target, sender, sequence, method).into_bytes()
    }

    pub fn aad(&self) -> Vec<u8> {
        Self::binding(self.target, self.sender, self.sequence, &self.method)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// The body that sent the request.
    pub target: BodyId,
    pub responder: BodyId,
    pub sequence: SequenceNumber,
    pub outcome: Result<Payload, RemoteFault>,
}

impl Reply {
    pub fn correlation(&self) -> CorrelationKey {
        CorrelationKey::new(self.target, self.sequence)
    }

    /// Associated data a sealed reply payload is bound to.
    pub fn binding(target: BodyId, responder: BodyId, sequence: SequenceNumber) -> Vec<u8> {
        format!("reply|{}|{}|{}", target, responder, sequence).into_bytes()
    }

    pub fn aad(&self) -> Vec<u8> {
        Self::binding(self.target, self.responder, self.sequence)
    }
}

/// Acceptance token returned by the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acceptance {
    /// Queued for the body's serial loop.
    Queued,
    /// Executed at once, outside the serial loop.
    ServedImmediately,
    /// Nothing was waiting for it; dropped without error.
    Ignored,
    /// Already received; not processed again.
    Duplicate,
}
