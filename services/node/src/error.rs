//! Error taxonomy for bodies, proxies and the fault-tolerance channel.

use std::fmt;
use std::time::Duration;

use proactive_id::{BodyId, IdError, Location, NodeUrl, SequenceNumber};
use proactive_security::SecurityError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::MethodSignature;

/// Coarse classification of every failure a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Communication,
    Authentication,
    KeyExchange,
    CommunicationForbidden,
    SecurityNotAvailable,
    RenegotiateSession,
    Application,
    Terminated,
    NotFound,
    Timeout,
    Cancelled,
    Migration,
    FaultTolerance,
}

impl ErrorKind {
    /// Protocol-level failures, broadcast to a body's NFE subscribers.
    pub fn is_non_functional(&self) -> bool {
        !matches!(
            self,
            ErrorKind::Application
                | ErrorKind::RenegotiateSession
                | ErrorKind::Cancelled
                | ErrorKind::FaultTolerance
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Communication => "communication",
            ErrorKind::Authentication => "authentication",
            ErrorKind::KeyExchange => "key_exchange",
            ErrorKind::CommunicationForbidden => "communication_forbidden",
            ErrorKind::SecurityNotAvailable => "security_not_available",
            ErrorKind::RenegotiateSession => "renegotiate_session",
            ErrorKind::Application => "application",
            ErrorKind::Terminated => "terminated",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Migration => "migration",
            ErrorKind::FaultTolerance => "fault_tolerance",
        };
        f.write_str(name)
    }
}

/// Transport-level reasons a body could not be reached.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommunicationFailure {
    #[error("node {node} is unreachable")]
    Unreachable { node: NodeUrl },

    #[error("{body} is no longer at {location}")]
    StaleLocation { body: BodyId, location: Location },

    #[error("{body} has been suspended for {waited:?}")]
    Suspended { body: BodyId, waited: Duration },

    #[error("inbox of {body} is closed")]
    MailboxClosed { body: BodyId },

    #[error("{body} is not an active object")]
    NotActive { body: BodyId },
}

/// Failure carried back in a reply when the remote method did not succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{method} failed ({kind}): {message}")]
pub struct RemoteFault {
    pub method: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteFault {
    pub fn new(method: &MethodSignature, error: &ServiceError) -> Self {
        let kind = match error {
            ServiceError::Body(inner) => inner.kind(),
            _ => ErrorKind::Application,
        };
        Self {
            method: method.to_string(),
            kind,
            message: error.to_string(),
        }
    }
}

/// Errors seen by callers of a body.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BodyError {
    #[error("communication failure: {0}")]
    Communication(#[from] CommunicationFailure),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("no body registered as {0}")]
    NotFound(BodyId),

    #[error("{0} has terminated")]
    Terminated(BodyId),

    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteFault),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("call was cancelled")]
    Cancelled,

    #[error("migration of {body} failed: {reason}")]
    Migration { body: BodyId, reason: String },

    #[error("invalid node address: {0}")]
    Address(#[from] IdError),

    #[error("payload encoding failed: {0}")]
    Codec(String),

    #[error(transparent)]
    FaultTolerance(FtError),
}

impl BodyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BodyError::Communication(_) => ErrorKind::Communication,
            BodyError::Security(err) => match err {
                SecurityError::SecurityNotAvailable => ErrorKind::SecurityNotAvailable,
                SecurityError::Authentication(_) | SecurityError::Integrity => {
                    ErrorKind::Authentication
                }
                SecurityError::CommunicationForbidden { .. } => ErrorKind::CommunicationForbidden,
                SecurityError::RenegotiateSession { .. } => ErrorKind::RenegotiateSession,
                SecurityError::HandshakeTimeout { .. } => ErrorKind::Timeout,
                SecurityError::KeyExchange(_)
                | SecurityError::InvalidState { .. }
                | SecurityError::HandshakeCollision { .. }
                | SecurityError::InvalidKey(_) => ErrorKind::KeyExchange,
            },
            BodyError::NotFound(_) | BodyError::Address(_) => ErrorKind::NotFound,
            BodyError::Terminated(_) => ErrorKind::Terminated,
            BodyError::Remote(fault) => fault.kind,
            BodyError::Timeout(_) => ErrorKind::Timeout,
            BodyError::Cancelled => ErrorKind::Cancelled,
            BodyError::Migration { .. } => ErrorKind::Migration,
            BodyError::Codec(_) => ErrorKind::Application,
            BodyError::FaultTolerance(_) => ErrorKind::FaultTolerance,
        }
    }

    /// Returns true if this failure is reported to NFE subscribers.
    pub fn is_non_functional(&self) -> bool {
        match self {
            // the remote side already reported its own failure
            BodyError::Remote(_) => false,
            _ => self.kind().is_non_functional(),
        }
    }

    /// Returns true if the target may have moved and a fresh location is worth one retry.
    pub fn is_stale_location(&self) -> bool {
        matches!(
            self,
            BodyError::Communication(
                CommunicationFailure::StaleLocation { .. }
                    | CommunicationFailure::Unreachable { .. }
                    | CommunicationFailure::Suspended { .. }
            )
        )
    }

    pub(crate) fn codec(err: serde_json::Error) -> Self {
        BodyError::Codec(err.to_string())
    }
}

/// Errors an active object's method returns.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no such method: {0}")]
    UnknownMethod(MethodSignature),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Body(#[from] BodyError),
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::InvalidArguments(err.to_string())
    }
}

/// Errors from the fault-tolerance channel and its managers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FtError {
    #[error("checkpoint {index} is unknown")]
    UnknownCheckpoint { index: u64 },

    #[error("fault-tolerance messenger of {body} has stopped")]
    Stopped { body: BodyId },

    #[error("fault-tolerance manager failed: {0}")]
    Manager(String),

    /// The message is too far ahead of the next expected sequence number.
    #[error("FT message {sequence} is beyond the window of {window} after {expected}")]
    OutOfWindow {
        sequence: SequenceNumber,
        expected: SequenceNumber,
        window: u64,
    },
}
