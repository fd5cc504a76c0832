//! Typed identity definitions.
//!
//! Each identity type has a unique prefix so that a job tag can never be
//! mistaken for a body identity in logs or on the wire.

use crate::define_id;

// =============================================================================
// Bodies and Jobs
// =============================================================================

define_id!(
    /// Globally unique identity of an active object's body. Survives migration.
    BodyId,
    "body"
);
define_id!(
    /// Job tag shared by every body created within the same deployment.
    JobId,
    "job"
);
define_id!(
    /// Identity of a hosting node runtime.
    NodeId,
    "node"
);

// =============================================================================
// Listeners
// =============================================================================

define_id!(
    /// Handle returned when subscribing to a body's non-functional exceptions.
    ListenerId,
    "nfel"
);

// =============================================================================
// Sequence Number
// =============================================================================

/// Per-sender request sequence number.
///
/// Every request a body sends carries the next value of its own counter;
/// `(sender, sequence)` correlates the reply and de-duplicates redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The first sequence number a sender hands out.
    pub const FIRST: Self = Self(1);

    /// Creates a sequence number from a raw value.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for SequenceNumber {
    fn default() -> Self {
        Self::FIRST
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(seq: u64) -> Self {
        Self(seq)
    }
}

impl serde::Serialize for SequenceNumber {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for SequenceNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let seq = u64::deserialize(deserializer)?;
        Ok(Self(seq))
    }
}

// =============================================================================
// Session ID
// =============================================================================

/// Security session identifier.
///
/// Allocated by the responding side of a handshake from a monotonically
/// increasing counter; both parties end the handshake holding the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a session ID from a raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Big-endian bytes, used when binding the id into transcripts.
    #[must_use]
    pub const fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for SessionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = u64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Tests
// =============================================================================
