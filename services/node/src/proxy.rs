//! Caller-side stubs.
//!
//! A [`Proxy`] turns a method call into a request to the target body and
//! hands back a [`ReplyFuture`] right away. The caller keeps going until it
//! actually needs the value.

use std::sync::{Arc, Mutex, PoisonError};

use proactive_id::{BodyId, Location, SequenceNumber};
use proactive_security::{CommunicationKind, Entity, SecurityError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::body::BodyHandle;
use crate::error::{BodyError, ErrorKind};
use crate::future::ReplyFuture;
use crate::message::{Acceptance, CorrelationKey, MethodSignature, Payload, Request};
use crate::remote::{negotiable, RemoteBody};

/// A stub for calling one body on behalf of another.
pub struct Proxy {
    caller: Arc<BodyHandle>,
    target: BodyId,
    location: Mutex<Location>,
}

impl Proxy {
    pub(crate) fn new(caller: Arc<BodyHandle>, target: BodyId, location: Location) -> Self {
        Self {
            caller,
            target,
            location: Mutex::new(location),
        }
    }

    pub fn target(&self) -> BodyId {
        self.target
    }

    pub fn caller(&self) -> BodyId {
        self.caller.id()
    }

    /// Last location this proxy reached the target at.
    pub fn location(&self) -> Location {
        self.location
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sends `method(args)` and returns its future without waiting for the reply.
    pub async fn call(
        &self,
        method: impl Into<MethodSignature>,
        args: impl Serialize,
    ) -> Result<ReplyFuture, BodyError> {
        let method = method.into();
        let args = serde_json::to_value(args).map_err(BodyError::codec)?;
        self.send(method, args).await
    }

    /// Calls and waits for the reply.
    pub async fn call_sync(
        &self,
        method: impl Into<MethodSignature>,
        args: impl Serialize,
    ) -> Result<Value, BodyError> {
        self.call(method, args).await?.get().await
    }

    pub async fn call_as<T: DeserializeOwned>(
        &self,
        method: impl Into<MethodSignature>,
        args: impl Serialize,
    ) -> Result<T, BodyError> {
        self.call(method, args).await?.get_as().await
    }

    /// Gives up on `future`. Its reply is dropped when it arrives.
    ///
    /// Returns false if the future was already settled or belongs to
    /// another caller.
    pub fn abandon(&self, future: &ReplyFuture) -> bool {
        match future.key() {
            Some(key) if key.sender == self.caller.id() => {
                debug!(body_id = %self.caller.id(), target = %self.target, correlation = %key, "call abandoned");
                self.caller.futures().cancel(key)
            }
            _ => false,
        }
    }

    /// The target's capabilities, for control operations such as migration.
    pub async fn remote(&self) -> Result<Arc<dyn RemoteBody>, BodyError> {
        let hint = self.location();
        let remote = self
            .caller
            .reach(self.target, Some(&hint), |remote| async move { Ok(remote) })
            .await?;
        self.refresh_location();
        Ok(remote)
    }

    async fn send(&self, method: MethodSignature, args: Value) -> Result<ReplyFuture, BodyError> {
        let sequence = self.caller.next_sequence();
        let key = CorrelationKey::new(self.caller.id(), sequence);
        let future = self.caller.futures().register(key);

        match self.post(&method, &args, sequence).await {
            Ok(acceptance) => {
                debug!(
                    body_id = %self.caller.id(),
                    target = %self.target,
                    method = %method,
                    sequence = %sequence,
                    acceptance = ?acceptance,
                    "request sent"
                );
                self.refresh_location();
                Ok(future)
            }
            Err(err) => {
                self.caller.futures().cancel(key);
                warn!(
                    body_id = %self.caller.id(),
                    target = %self.target,
                    method = %method,
                    error = %err,
                    "request could not be delivered"
                );
                self.caller.report(&err);
                Err(err)
            }
        }
    }

    fn refresh_location(&self) {
        if let Ok(location) = self.caller.known_location(self.target) {
            let mut current = self.location.lock().unwrap_or_else(PoisonError::into_inner);
            if location.is_newer_than(&current) {
                *current = location;
            }
        }
    }

    async fn post(
        &self,
        method: &MethodSignature,
        args: &Value,
        sequence: SequenceNumber,
    ) -> Result<Acceptance, BodyError> {
        let hint = self.location();
        self.caller
            .reach(self.target, Some(&hint), move |remote| async move {
                self.post_to(&remote, method, args, sequence).await
            })
            .await
    }

    async fn post_to(
        &self,
        remote: &Arc<dyn RemoteBody>,
        method: &MethodSignature,
        args: &Value,
        sequence: SequenceNumber,
    ) -> Result<Acceptance, BodyError> {
        let secure = self.secure_channel(remote).await?;
        match self.send_once(remote, method, args, sequence, secure).await {
            Err(err) if secure && err.kind() == ErrorKind::RenegotiateSession => {
                info!(
                    body_id = %self.caller.id(),
                    target = %self.target,
                    reason = %err,
                    "renegotiating session before resend"
                );
                if let Some(manager) = self.caller.security() {
                    manager
                        .renegotiate(self.target, negotiable(remote), CommunicationKind::Request)
                        .await?;
                }
                self.send_once(remote, method, args, sequence, true).await
            }
            other => other,
        }
    }

    /// Returns true when the request must travel sealed.
    async fn secure_channel(&self, remote: &Arc<dyn RemoteBody>) -> Result<bool, BodyError> {
        let Some(manager) = self.caller.security() else {
            return Ok(false);
        };
        if self.target == self.caller.id() {
            return Ok(false);
        }

        let entities = remote_entities(remote).await?;
        let policy = manager.communication_to(&CommunicationKind::Request, &entities);
        if policy.allowed && !policy.requires_session() {
            return Ok(false);
        }
        // A forbidden policy fails here without creating a session.
        manager
            .ensure_session(self.target, negotiable(remote), CommunicationKind::Request)
            .await?;
        Ok(true)
    }

    async fn send_once(
        &self,
        remote: &Arc<dyn RemoteBody>,
        method: &MethodSignature,
        args: &Value,
        sequence: SequenceNumber,
        secure: bool,
    ) -> Result<Acceptance, BodyError> {
        let sender = self.caller.id();
        let payload = if secure {
            let aad = Request::binding(self.target, sender, sequence, method);
            self.caller.seal_value(self.target, args, &aad)?
        } else {
            Payload::Plain(args.clone())
        };

        remote
            .receive_request(Request {
                target: self.target,
                method: method.clone(),
                payload,
                sender,
                sequence,
            })
            .await
    }
}

async fn remote_entities(remote: &Arc<dyn RemoteBody>) -> Result<Vec<Entity>, BodyError> {
    match negotiable(remote).entities().await {
        Ok(entities) => Ok(entities),
        Err(SecurityError::SecurityNotAvailable) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("caller", &self.caller.id())
            .field("target", &self.target)
            .field("location", &self.location())
            .finish()
    }
}
