//! Bodies: the execution units that own active objects.
//!
//! A body drains its inbox one request at a time on its own task. Methods
//! registered as immediate services skip the inbox and run as soon as they
//! are delivered, concurrently with the loop, so an [`ActiveObject`] keeps
//! its state behind its own locks.
//!
//! ```text
//!   ACTIVE ──migrate──> SUSPENDED ──adopted──> ACTIVE (new location)
//!     │                     │
//!     │                     └──adoption failed──> SUSPENDED (until resume)
//!     └──terminate──> TERMINATED
//! ```

mod active;
mod context;
mod handle;

use std::fmt;

use async_trait::async_trait;
use proactive_id::{BodyId, SequenceNumber};
use proactive_security::Entity;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::ServiceError;
use crate::ft::FaultToleranceManager;
use crate::future::ReplyFuture;
use crate::immediate::ServiceKey;
use crate::message::MethodSignature;

pub(crate) use active::spawn_body;
pub use context::BodyContext;
pub use handle::BodyHandle;

/// An object whose methods are served by a body.
#[async_trait]
pub trait ActiveObject: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Serves one call.
    async fn serve(&self, call: Call, ctx: &BodyContext) -> Result<Outcome, ServiceError>;

    /// Runs on the body task before the first request.
    async fn on_activate(&self, _ctx: &BodyContext) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Runs on the body task after the last request.
    async fn on_terminate(&self, _ctx: &BodyContext) {}
}

/// One method invocation as seen by the active object.
#[derive(Debug, Clone)]
pub struct Call {
    pub method: MethodSignature,
    pub args: Value,
    pub sender: BodyId,
    pub sequence: SequenceNumber,
}

impl Call {
    pub fn name(&self) -> &str {
        &self.method.name
    }

    /// Decodes the arguments.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
        Ok(serde_json::from_value(self.args.clone())?)
    }

    pub fn unknown(&self) -> ServiceError {
        ServiceError::UnknownMethod(self.method.clone())
    }
}

/// What a served call produces.
#[derive(Debug)]
pub enum Outcome {
    /// The reply value.
    Value(Value),
    /// The reply is whatever this future settles to. With automatic
    /// continuation enabled the body does not wait for it.
    Forward(ReplyFuture),
}

impl Outcome {
    pub fn value<T: Serialize>(value: T) -> Result<Self, ServiceError> {
        Ok(Outcome::Value(serde_json::to_value(value)?))
    }

    pub fn unit() -> Self {
        Outcome::Value(Value::Null)
    }
}

/// Externally visible lifecycle state of a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyState {
    Active,
    Suspended,
    Terminated,
}

impl fmt::Display for BodyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyState::Active => write!(f, "active"),
            BodyState::Suspended => write!(f, "suspended"),
            BodyState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Per-body settings chosen at creation.
#[derive(Default)]
pub struct BodyOptions {
    pub automatic_continuation: bool,
    /// Opt out of the runtime's security profile.
    pub without_security: bool,
    pub fault_tolerance: Option<Box<dyn FaultToleranceManager>>,
    pub immediate_services: Vec<ServiceKey>,
    pub entities: Vec<Entity>,
}

impl BodyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_automatic_continuation(mut self) -> Self {
        self.automatic_continuation = true;
        self
    }

    #[must_use]
    pub fn without_security(mut self) -> Self {
        self.without_security = true;
        self
    }

    #[must_use]
    pub fn with_fault_tolerance(mut self, manager: impl FaultToleranceManager) -> Self {
        self.fault_tolerance = Some(Box::new(manager));
        self
    }

    #[must_use]
    pub fn with_immediate_service(mut self, key: ServiceKey) -> Self {
        self.immediate_services.push(key);
        self
    }

    #[must_use]
    pub fn with_entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }
}

impl fmt::Debug for BodyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyOptions")
            .field("automatic_continuation", &self.automatic_continuation)
            .field("without_security", &self.without_security)
            .field(
                "fault_tolerance",
                &self.fault_tolerance.as_ref().map(|m| m.name().to_string()),
            )
            .field("immediate_services", &self.immediate_services)
            .field("entities", &self.entities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(args: Value) -> Call {
        Call {
            method: MethodSignature::new("put"),
            args,
            sender: BodyId::new(),
            sequence: SequenceNumber::FIRST,
        }
    }

    #[test]
    fn test_call_decodes_arguments() {
        let (key, value): (i64, String) = call(json!([3, "three"])).args().unwrap();
        assert_eq!(key, 3);
        assert_eq!(value, "three");
    }

    #[test]
    fn test_bad_arguments_are_reported() {
        let result: Result<(i64, String), _> = call(json!("nope")).args();
        assert!(matches!(result, Err(ServiceError::InvalidArguments(_))));
    }

    #[test]
    fn test_outcome_value() {
        match Outcome::value(vec![1, 2]).unwrap() {
            Outcome::Value(v) => assert_eq!(v, json!([1, 2])),
            Outcome::Forward(_) => panic!("expected a value"),
        }
    }
}
