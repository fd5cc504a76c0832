//! The remote face of a body.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::join_all;
use proactive_id::{BodyId, JobId, ListenerId, Location, NodeUrl, SequenceNumber, SessionId};
use proactive_security::{
    Certificate, Communication, CommunicationKind, ConfidentialityTicket, Entity, KeyConfirmation,
    KeyOffer, SecurityContext, SecurityError, SecurityManager, SecurityNegotiable, SessionOffer,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::{ActiveObject, BodyContext, BodyState, Call, Outcome};
use crate::error::{
    BodyError, CommunicationFailure, ErrorKind, FtError, RemoteFault, ServiceError,
};
use crate::ft::{FtMessage, FtMessenger};
use crate::future::FutureTable;
use crate::immediate::ImmediateServices;
use crate::message::{
    Acceptance, CorrelationKey, MethodSignature, Payload, Reply, Request, TypeTag,
};
use crate::nfe::{NfeBus, NfeEvent, NfeSubscription};
use crate::proxy::Proxy;
use crate::remote::{
    negotiable, ContinuationControl, FaultTolerant, ImmediateServiceControl, Invokable, NfeSource,
    Relocatable, RemoteBody,
};
use crate::runtime::Environment;

/// How many recent `(sender, sequence)` pairs a body remembers for de-duplication.
const DEDUP_WINDOW: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Lifecycle {
    Active,
    Suspended { since: Instant },
    Terminated,
}

impl Lifecycle {
    pub(crate) fn state(&self) -> BodyState {
        match self {
            Lifecycle::Active => BodyState::Active,
            Lifecycle::Suspended { .. } => BodyState::Suspended,
            Lifecycle::Terminated => BodyState::Terminated,
        }
    }
}

/// A request accepted for serving.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub(crate) call: Call,
    /// The request was sealed, so the reply must be too.
    pub(crate) sealed: bool,
}

#[derive(Debug)]
pub(crate) enum InboxItem {
    Request(Delivery),
    Migrate {
        to: NodeUrl,
        done: oneshot::Sender<Result<Location, BodyError>>,
    },
}

#[derive(Debug, Default)]
struct RecentRequests {
    order: VecDeque<CorrelationKey>,
    seen: HashSet<CorrelationKey>,
}

impl RecentRequests {
    /// Returns false if `key` was already seen.
    fn insert(&mut self, key: CorrelationKey) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > DEDUP_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

pub(crate) struct BodyParts {
    pub(crate) id: BodyId,
    pub(crate) env: Arc<Environment>,
    pub(crate) location: Location,
    pub(crate) object: Option<Arc<dyn ActiveObject>>,
    pub(crate) inbox: Option<mpsc::Sender<InboxItem>>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) security: Option<SecurityManager>,
    pub(crate) ft: Option<FtMessenger>,
    pub(crate) immediate: ImmediateServices,
    pub(crate) automatic_continuation: bool,
}

/// Shared handle on a body; every capability a peer may use goes through it.
///
/// Half bodies (callers that are not active objects, such as the main
/// program) have a handle without an object or inbox: they can call other
/// bodies and receive replies, but refuse requests.
pub struct BodyHandle {
    id: BodyId,
    job_id: JobId,
    env: Arc<Environment>,
    me: Weak<BodyHandle>,
    object: Option<Arc<dyn ActiveObject>>,
    inbox: Option<mpsc::Sender<InboxItem>>,
    shutdown: watch::Sender<bool>,
    lifecycle: watch::Sender<Lifecycle>,
    location: RwLock<Location>,
    futures: FutureTable,
    immediate: ImmediateServices,
    automatic_continuation: AtomicBool,
    security: Option<SecurityManager>,
    ft: Option<FtMessenger>,
    nfe: NfeBus,
    sequence: AtomicU64,
    recent: Mutex<RecentRequests>,
    // last known locations of the bodies this one talks to
    locations: RwLock<HashMap<BodyId, Location>>,
    correspondents: Mutex<HashSet<BodyId>>,
}

impl BodyHandle {
    pub(crate) fn new(parts: BodyParts) -> Arc<Self> {
        let (lifecycle, _) = watch::channel(Lifecycle::Active);
        Arc::new_cyclic(|me| Self {
            id: parts.id,
            job_id: parts.env.config.job_id,
            me: me.clone(),
            object: parts.object,
            inbox: parts.inbox,
            shutdown: parts.shutdown,
            lifecycle,
            location: RwLock::new(parts.location),
            futures: FutureTable::new(),
            immediate: parts.immediate,
            automatic_continuation: AtomicBool::new(parts.automatic_continuation),
            security: parts.security,
            ft: parts.ft,
            nfe: NfeBus::new(parts.id),
            sequence: AtomicU64::new(SequenceNumber::FIRST.value()),
            recent: Mutex::new(RecentRequests::default()),
            locations: RwLock::new(HashMap::new()),
            correspondents: Mutex::new(HashSet::new()),
            env: parts.env,
        })
    }

    // =========================================================================
    // Local accessors
    // =========================================================================

    pub fn id(&self) -> BodyId {
        self.id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn location(&self) -> Location {
        self.location
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn node(&self) -> NodeUrl {
        self.location().node
    }

    pub fn state(&self) -> BodyState {
        self.lifecycle.borrow().state()
    }

    /// False for half bodies.
    pub fn is_active_object(&self) -> bool {
        self.inbox.is_some()
    }

    pub fn security(&self) -> Option<&SecurityManager> {
        self.security.as_ref()
    }

    pub fn futures(&self) -> &FutureTable {
        &self.futures
    }

    pub fn nfe(&self) -> &NfeBus {
        &self.nfe
    }

    pub fn immediate_services(&self) -> &ImmediateServices {
        &self.immediate
    }

    pub fn automatic_continuation(&self) -> bool {
        self.automatic_continuation.load(Ordering::SeqCst)
    }

    pub(crate) fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    pub(crate) fn object(&self) -> Option<Arc<dyn ActiveObject>> {
        self.object.clone()
    }

    pub(crate) fn subscribe_lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    pub(crate) fn next_sequence(&self) -> SequenceNumber {
        SequenceNumber::new(self.sequence.fetch_add(1, Ordering::SeqCst))
    }

    fn arc(&self) -> Result<Arc<Self>, BodyError> {
        self.me.upgrade().ok_or(BodyError::Terminated(self.id))
    }

    /// A stub for calling `target` from this body.
    pub fn proxy(&self, target: BodyId) -> Result<Proxy, BodyError> {
        let location = self.known_location(target)?;
        Ok(Proxy::new(self.arc()?, target, location))
    }

    /// Broadcasts a non-functional failure to this body's NFE subscribers.
    ///
    /// Returns how many subscribers were reached; application failures are
    /// not broadcast.
    pub fn report(&self, error: &BodyError) -> usize {
        if !error.is_non_functional() {
            return 0;
        }
        self.nfe.fire(NfeEvent::from_error(self.id, error))
    }

    // =========================================================================
    // Locations
    // =========================================================================

    fn cached_location(&self, target: BodyId) -> Option<Location> {
        if target == self.id {
            return Some(self.location());
        }
        self.locations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target)
            .cloned()
    }

    /// Where this body believes `target` lives, asking the registry on a cache miss.
    pub(crate) fn known_location(&self, target: BodyId) -> Result<Location, BodyError> {
        if let Some(location) = self.cached_location(target) {
            return Ok(location);
        }
        let location = self.env.registry.resolve(target)?;
        self.remember_location(target, location.clone());
        Ok(location)
    }

    /// Caches `location` for `target` unless a newer one is already known.
    pub(crate) fn remember_location(&self, target: BodyId, location: Location) -> bool {
        let mut locations = self.locations.write().unwrap_or_else(PoisonError::into_inner);
        match locations.get(&target) {
            Some(current) if !location.is_newer_than(current) => false,
            _ => {
                locations.insert(target, location);
                true
            }
        }
    }

    /// Runs `op` against `target`.
    ///
    /// The first attempt uses the newest of `hint` and the cached location.
    /// If it fails because the target moved or could not be contacted, the
    /// location is resolved again and `op` is retried exactly once.
    pub(crate) async fn reach<T, F, Fut>(
        &self,
        target: BodyId,
        hint: Option<&Location>,
        mut op: F,
    ) -> Result<T, BodyError>
    where
        F: FnMut(Arc<dyn RemoteBody>) -> Fut + Send,
        Fut: Future<Output = Result<T, BodyError>> + Send,
        T: Send,
    {
        let known = match (hint, self.cached_location(target)) {
            (Some(hint), Some(cached)) if hint.is_newer_than(&cached) => hint.clone(),
            (_, Some(cached)) => cached,
            (Some(hint), None) => hint.clone(),
            (None, None) => self.known_location(target)?,
        };

        let first = match self.env.transport.connect(&known, target).await {
            Ok(remote) => op(remote).await,
            Err(err) => Err(err),
        };
        let err = match first {
            Err(err) if err.is_stale_location() => err,
            other => return other,
        };

        let fresh = self.env.registry.resolve(target)?;
        info!(
            body_id = %self.id,
            target = %target,
            stale = %known,
            fresh = %fresh,
            error = %err,
            "re-resolved location, retrying once"
        );
        self.remember_location(target, fresh.clone());
        let remote = self.env.transport.connect(&fresh, target).await?;
        op(remote).await
    }

    fn note_correspondent(&self, peer: BodyId) {
        if peer != self.id {
            self.correspondents
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(peer);
        }
    }

    /// Pushes this body's new location to everyone who has called it.
    async fn announce(&self, location: &Location) {
        let peers: Vec<BodyId> = self
            .correspondents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();

        let id = self.id;
        let pushes = peers.into_iter().map(|peer| async move {
            let result = self
                .reach(peer, None, move |remote| {
                    let location = location.clone();
                    async move { remote.update_location(id, location).await }
                })
                .await;
            (peer, result)
        });

        for (peer, result) in join_all(pushes).await {
            if let Err(e) = result {
                debug!(body_id = %id, peer = %peer, error = %e, "could not announce new location");
            }
        }
    }

    // =========================================================================
    // Payload protection
    // =========================================================================

    fn security_manager(&self) -> Result<&SecurityManager, BodyError> {
        self.security
            .as_ref()
            .ok_or(BodyError::Security(SecurityError::SecurityNotAvailable))
    }

    fn negotiator(&self) -> Result<&SecurityManager, SecurityError> {
        self.security
            .as_ref()
            .ok_or(SecurityError::SecurityNotAvailable)
    }

    pub(crate) fn seal_value(
        &self,
        peer: BodyId,
        value: &Value,
        aad: &[u8],
    ) -> Result<Payload, BodyError> {
        let manager = self.security_manager()?;
        let bytes = serde_json::to_vec(value).map_err(BodyError::codec)?;
        Ok(Payload::Sealed(manager.seal(peer, &bytes, aad)?))
    }

    pub(crate) fn open_payload(
        &self,
        peer: BodyId,
        payload: Payload,
        aad: &[u8],
    ) -> Result<Value, BodyError> {
        match payload {
            Payload::Plain(value) => Ok(value),
            Payload::Sealed(sealed) => {
                let manager = self.security_manager()?;
                let bytes = manager.open(peer, &sealed, aad)?;
                serde_json::from_slice(&bytes).map_err(BodyError::codec)
            }
        }
    }

    /// Checks an unsealed request from `sender` against this body's own policy.
    async fn admit_plain(&self, sender: BodyId) -> Result<(), BodyError> {
        let Some(manager) = &self.security else {
            return Ok(());
        };
        if sender == self.id {
            return Ok(());
        }
        // an unreachable sender counts as one without security
        let entities = self
            .reach(sender, None, |remote| async move {
                Ok(negotiable(&remote).entities().await)
            })
            .await
            .ok()
            .and_then(Result::ok);
        manager.admit_plain(&CommunicationKind::Request, entities.as_deref())?;
        Ok(())
    }

    /// Runs the handshake with `target` as initiator.
    pub async fn open_session(
        &self,
        target: BodyId,
        kind: CommunicationKind,
    ) -> Result<SessionId, BodyError> {
        let manager = self.security_manager()?;
        let result = self
            .reach(target, None, move |remote| {
                let kind = kind.clone();
                async move {
                    manager
                        .initiate_session(target, negotiable(&remote), kind)
                        .await
                        .map_err(BodyError::from)
                }
            })
            .await;
        if let Err(err) = &result {
            warn!(body_id = %self.id, target = %target, error = %err, "session could not be opened");
            self.report(err);
        }
        result
    }

    /// Forces a fresh handshake with `target`.
    pub async fn renegotiate(
        &self,
        target: BodyId,
        kind: CommunicationKind,
    ) -> Result<SessionId, BodyError> {
        let manager = self.security_manager()?;
        self.reach(target, None, move |remote| {
            let kind = kind.clone();
            async move {
                manager
                    .renegotiate(target, negotiable(&remote), kind)
                    .await
                    .map_err(BodyError::from)
            }
        })
        .await
    }

    /// Ends the session with `target` on both sides.
    pub async fn close_session(&self, target: BodyId) -> Result<(), BodyError> {
        let manager = self.security_manager()?;
        self.reach(target, None, move |remote| async move {
            manager
                .close_session(target, negotiable(&remote))
                .await
                .map_err(BodyError::from)
        })
        .await
    }

    // =========================================================================
    // Serving
    // =========================================================================

    fn check_alive(&self) -> Result<(), BodyError> {
        match self.state() {
            BodyState::Terminated => Err(BodyError::Terminated(self.id)),
            _ => Ok(()),
        }
    }

    /// Requests are queued while suspended, but only for a bounded time.
    fn check_accepting(&self) -> Result<(), BodyError> {
        match *self.lifecycle.borrow() {
            Lifecycle::Active => Ok(()),
            Lifecycle::Terminated => Err(BodyError::Terminated(self.id)),
            Lifecycle::Suspended { since } => {
                let waited = since.elapsed();
                if waited > self.env.config.max_suspension {
                    Err(CommunicationFailure::Suspended {
                        body: self.id,
                        waited,
                    }
                    .into())
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Serves one delivery and sends its reply.
    pub(crate) async fn serve(self: &Arc<Self>, object: &Arc<dyn ActiveObject>, delivery: Delivery) {
        let Delivery { call, sealed } = delivery;
        let method = call.method.clone();
        let (sender, sequence) = (call.sender, call.sequence);
        let ctx = BodyContext::new(Arc::clone(self));

        match object.serve(call, &ctx).await {
            Ok(Outcome::Value(value)) => {
                self.send_reply(&method, sender, sequence, sealed, Ok(value)).await;
            }
            Ok(Outcome::Forward(future)) if self.automatic_continuation() => {
                debug!(body_id = %self.id, method = %method, sequence = %sequence, "reply continues automatically");
                let body = Arc::clone(self);
                tokio::spawn(async move {
                    let outcome = future
                        .get()
                        .await
                        .map_err(|e| RemoteFault::new(&method, &ServiceError::Body(e)));
                    body.send_reply(&method, sender, sequence, sealed, outcome).await;
                });
            }
            Ok(Outcome::Forward(future)) => {
                // wait by necessity
                let outcome = future
                    .get()
                    .await
                    .map_err(|e| RemoteFault::new(&method, &ServiceError::Body(e)));
                self.send_reply(&method, sender, sequence, sealed, outcome).await;
            }
            Err(e) => {
                debug!(body_id = %self.id, method = %method, error = %e, "method failed");
                self.send_reply(&method, sender, sequence, sealed, Err(RemoteFault::new(&method, &e)))
                    .await;
            }
        }
    }

    /// Answers a request that will never be served.
    pub(crate) async fn refuse(&self, delivery: Delivery) {
        let fault = RemoteFault {
            method: delivery.call.method.to_string(),
            kind: ErrorKind::Terminated,
            message: BodyError::Terminated(self.id).to_string(),
        };
        self.send_reply(
            &delivery.call.method,
            delivery.call.sender,
            delivery.call.sequence,
            false,
            Err(fault),
        )
        .await;
    }

    async fn send_reply(
        &self,
        method: &MethodSignature,
        target: BodyId,
        sequence: SequenceNumber,
        sealed: bool,
        outcome: Result<Value, RemoteFault>,
    ) {
        if let Err(err) = self.post_reply(method, target, sequence, sealed, outcome).await {
            warn!(
                body_id = %self.id,
                target = %target,
                sequence = %sequence,
                error = %err,
                "reply could not be delivered"
            );
            self.report(&err);
        }
    }

    /// Posts exactly one reply for the request `(target, sequence)`.
    ///
    /// A value that cannot be sealed is replaced by an unsealed fault.
    async fn post_reply(
        &self,
        method: &MethodSignature,
        target: BodyId,
        sequence: SequenceNumber,
        sealed: bool,
        outcome: Result<Value, RemoteFault>,
    ) -> Result<Acceptance, BodyError> {
        let aad = Reply::binding(target, self.id, sequence);
        let outcome = match outcome {
            Ok(value) if sealed => match self.seal_reply(target, &value, &aad).await {
                Ok(payload) => Ok(payload),
                Err(err) => {
                    warn!(
                        body_id = %self.id,
                        target = %target,
                        sequence = %sequence,
                        error = %err,
                        "reply could not be sealed, answering with a fault"
                    );
                    self.report(&err);
                    Err(RemoteFault::new(method, &ServiceError::Body(err)))
                }
            },
            Ok(value) => Ok(Payload::Plain(value)),
            Err(fault) => Err(fault),
        };
        let reply = Reply {
            target,
            responder: self.id,
            sequence,
            outcome,
        };

        let reply = &reply;
        self.reach(target, None, move |remote| {
            let reply = reply.clone();
            async move { remote.receive_reply(reply).await }
        })
        .await
    }

    async fn seal_reply(
        &self,
        target: BodyId,
        value: &Value,
        aad: &[u8],
    ) -> Result<Payload, BodyError> {
        match self.seal_value(target, value, aad) {
            Err(BodyError::Security(err)) if err.is_renegotiate() => {
                info!(body_id = %self.id, target = %target, reason = %err, "renegotiating before reply");
                self.renegotiate(target, CommunicationKind::Reply).await?;
                self.seal_value(target, value, aad)
            }
            other => other,
        }
    }

    // =========================================================================
    // Migration and termination
    // =========================================================================

    /// Queues a migration behind the requests already in the inbox.
    pub(crate) async fn schedule_migration(
        &self,
        to: NodeUrl,
    ) -> Result<oneshot::Receiver<Result<Location, BodyError>>, BodyError> {
        let inbox = self
            .inbox
            .as_ref()
            .ok_or(CommunicationFailure::NotActive { body: self.id })?;
        self.check_alive()?;

        let (done, rx) = oneshot::channel();
        inbox
            .send(InboxItem::Migrate { to, done })
            .await
            .map_err(|_| CommunicationFailure::MailboxClosed { body: self.id })?;
        Ok(rx)
    }

    /// Moves the body to `to`. Runs on the body task.
    pub(crate) async fn relocate(&self, to: NodeUrl) -> Result<Location, BodyError> {
        let from = self.location();
        if from.node == to {
            return Ok(from);
        }
        self.check_alive()?;

        self.lifecycle.send_replace(Lifecycle::Suspended {
            since: Instant::now(),
        });
        info!(body_id = %self.id, from = %from, to = %to, "migration started");

        let me: Arc<dyn RemoteBody> = self.arc()?;
        if let Err(e) = self.env.transport.adopt(&to, self.id, me).await {
            let err = BodyError::Migration {
                body: self.id,
                reason: e.to_string(),
            };
            warn!(body_id = %self.id, location = %from, error = %e, "migration failed, body stays suspended");
            self.report(&err);
            return Err(err);
        }

        let next = from.moved_to(to);
        *self.location.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        if let Err(e) = self.env.registry.update_location(self.id, next.clone()) {
            warn!(body_id = %self.id, error = %e, "registry lost track of migrating body");
        }
        if let Err(e) = self.env.transport.release(&from.node, self.id).await {
            warn!(body_id = %self.id, node = %from.node, error = %e, "old node did not release body");
        }

        self.lifecycle.send_if_modified(|lifecycle| match lifecycle {
            Lifecycle::Suspended { .. } => {
                *lifecycle = Lifecycle::Active;
                true
            }
            _ => false,
        });
        self.announce(&next).await;

        info!(body_id = %self.id, location = %next, "migration finished");
        Ok(next)
    }

    /// Releases everything the body holds in shared structures.
    async fn release_resources(&self) {
        let location = self.location();
        self.env.registry.unregister(self.id);
        if let Err(e) = self.env.transport.release(&location.node, self.id).await {
            debug!(body_id = %self.id, error = %e, "node release failed");
        }
        let failed = self.futures.fail_all(BodyError::Terminated(self.id));
        let sessions = self
            .security
            .as_ref()
            .map_or(0, |manager| manager.sessions().remove_body(self.id));
        info!(
            body_id = %self.id,
            location = %location,
            pending_failed = failed,
            sessions_dropped = sessions,
            "body terminated"
        );
    }
}

impl std::fmt::Debug for BodyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyHandle")
            .field("id", &self.id)
            .field("location", &self.location())
            .field("state", &self.state())
            .field("active_object", &self.is_active_object())
            .field("secured", &self.security.is_some())
            .finish()
    }
}

// =============================================================================
// Capabilities
// =============================================================================

#[async_trait]
impl Invokable for BodyHandle {
    async fn receive_request(&self, request: Request) -> Result<Acceptance, BodyError> {
        let Some(inbox) = &self.inbox else {
            return Err(CommunicationFailure::NotActive { body: self.id }.into());
        };
        if request.target != self.id {
            return Err(BodyError::NotFound(request.target));
        }
        self.check_accepting()?;

        let aad = request.aad();
        let sealed = request.payload.is_sealed();
        let Request {
            method,
            payload,
            sender,
            sequence,
            ..
        } = request;

        if !sealed {
            self.admit_plain(sender).await.inspect_err(|err| {
                warn!(body_id = %self.id, sender = %sender, method = %method, error = %err, "plain request refused");
                self.report(err);
            })?;
        }

        let args = self.open_payload(sender, payload, &aad).inspect_err(|err| {
            if err.kind() != ErrorKind::RenegotiateSession {
                warn!(body_id = %self.id, sender = %sender, error = %err, "request payload rejected");
                self.report(err);
            }
        })?;

        let key = CorrelationKey::new(sender, sequence);
        let fresh = self
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        if !fresh {
            debug!(body_id = %self.id, correlation = %key, "duplicate request");
            return Ok(Acceptance::Duplicate);
        }
        self.note_correspondent(sender);

        let delivery = Delivery {
            call: Call {
                method,
                args,
                sender,
                sequence,
            },
            sealed,
        };

        if self.immediate.is_immediate(&delivery.call.method) {
            if let (Ok(me), Some(object)) = (self.arc(), self.object()) {
                debug!(body_id = %self.id, method = %delivery.call.method, "serving immediately");
                me.serve(&object, delivery).await;
                return Ok(Acceptance::ServedImmediately);
            }
        }

        inbox
            .send(InboxItem::Request(delivery))
            .await
            .map_err(|_| CommunicationFailure::MailboxClosed { body: self.id })?;
        Ok(Acceptance::Queued)
    }

    async fn receive_reply(&self, reply: Reply) -> Result<Acceptance, BodyError> {
        if reply.target != self.id {
            return Err(BodyError::NotFound(reply.target));
        }
        let key = reply.correlation();
        let aad = reply.aad();

        let outcome = match reply.outcome {
            Ok(payload) => self
                .open_payload(reply.responder, payload, &aad)
                .inspect_err(|err| {
                    warn!(body_id = %self.id, responder = %reply.responder, error = %err, "reply payload rejected");
                    self.report(err);
                }),
            Err(fault) => Err(BodyError::Remote(fault)),
        };

        let acceptance = self.futures.complete(key, outcome);
        if acceptance == Acceptance::Ignored {
            debug!(body_id = %self.id, correlation = %key, "reply for abandoned call dropped");
        }
        Ok(acceptance)
    }

    async fn terminate(&self) -> Result<(), BodyError> {
        let previous = self.lifecycle.send_replace(Lifecycle::Terminated);
        if matches!(previous, Lifecycle::Terminated) {
            return Ok(());
        }
        info!(body_id = %self.id, "terminating body");
        let _ = self.shutdown.send(true);
        self.release_resources().await;
        Ok(())
    }

    async fn node_url(&self) -> Result<NodeUrl, BodyError> {
        Ok(self.node())
    }

    async fn id(&self) -> Result<BodyId, BodyError> {
        Ok(self.id)
    }

    async fn job_id(&self) -> Result<JobId, BodyError> {
        Ok(self.job_id)
    }
}

#[async_trait]
impl Relocatable for BodyHandle {
    async fn update_location(&self, body: BodyId, location: Location) -> Result<(), BodyError> {
        self.check_alive()?;
        if self.remember_location(body, location.clone()) {
            debug!(body_id = %self.id, peer = %body, location = %location, "peer location updated");
        }
        Ok(())
    }

    async fn migrate_to(&self, node: NodeUrl) -> Result<Location, BodyError> {
        let done = self.schedule_migration(node).await?;
        done.await.map_err(|_| BodyError::Terminated(self.id))?
    }

    async fn resume(&self) -> Result<(), BodyError> {
        let mut resumed = false;
        self.lifecycle.send_if_modified(|lifecycle| match lifecycle {
            Lifecycle::Suspended { .. } => {
                *lifecycle = Lifecycle::Active;
                resumed = true;
                true
            }
            _ => false,
        });
        if resumed {
            info!(body_id = %self.id, location = %self.location(), "body resumed");
        }
        self.check_alive()
    }
}

#[async_trait]
impl ContinuationControl for BodyHandle {
    async fn enable_ac(&self) -> Result<(), BodyError> {
        self.check_alive()?;
        self.automatic_continuation.store(true, Ordering::SeqCst);
        debug!(body_id = %self.id, "automatic continuation enabled");
        Ok(())
    }

    async fn disable_ac(&self) -> Result<(), BodyError> {
        self.check_alive()?;
        self.automatic_continuation.store(false, Ordering::SeqCst);
        debug!(body_id = %self.id, "automatic continuation disabled");
        Ok(())
    }
}

#[async_trait]
impl ImmediateServiceControl for BodyHandle {
    async fn set_immediate_service(&self, name: &str) -> Result<(), BodyError> {
        self.check_alive()?;
        self.immediate.set(name);
        Ok(())
    }

    async fn set_immediate_service_with_params(
        &self,
        name: &str,
        params: Vec<TypeTag>,
    ) -> Result<(), BodyError> {
        self.check_alive()?;
        self.immediate.set_with_params(name, params);
        Ok(())
    }

    async fn remove_immediate_service(&self, name: &str) -> Result<(), BodyError> {
        self.check_alive()?;
        self.immediate.remove(name);
        Ok(())
    }

    async fn remove_immediate_service_with_params(
        &self,
        name: &str,
        params: Vec<TypeTag>,
    ) -> Result<(), BodyError> {
        self.check_alive()?;
        self.immediate.remove_with_params(name, params);
        Ok(())
    }
}

#[async_trait]
impl FaultTolerant for BodyHandle {
    async fn receive_ft_message(&self, message: FtMessage) -> Result<Acceptance, BodyError> {
        self.check_alive()?;
        let Some(ft) = &self.ft else {
            return Ok(Acceptance::Ignored);
        };
        ft.deliver(message).await.map_err(|e| match e {
            FtError::Stopped { .. } => {
                debug!(body_id = %self.id, error = %e, "FT channel closed");
                CommunicationFailure::MailboxClosed { body: self.id }.into()
            }
            other => BodyError::FaultTolerance(other),
        })
    }
}

#[async_trait]
impl NfeSource for BodyHandle {
    async fn add_nfe_listener(&self) -> Result<NfeSubscription, BodyError> {
        self.check_alive()?;
        Ok(self.nfe.subscribe())
    }

    async fn remove_nfe_listener(&self, id: ListenerId) -> Result<bool, BodyError> {
        Ok(self.nfe.unsubscribe(id))
    }

    async fn fire_nfe(&self, event: NfeEvent) -> Result<usize, BodyError> {
        Ok(self.nfe.fire(event))
    }
}

#[async_trait]
impl SecurityNegotiable for BodyHandle {
    async fn start_new_session(&self, offer: SessionOffer) -> Result<SessionId, SecurityError> {
        self.negotiator()?.start_new_session(offer).await
    }

    async fn random_value(
        &self,
        session_id: SessionId,
        client_random: [u8; 32],
    ) -> Result<[u8; 32], SecurityError> {
        self.negotiator()?.random_value(session_id, client_random).await
    }

    async fn negotiate_key_receiver_side(
        &self,
        session_id: SessionId,
        ticket: ConfidentialityTicket,
    ) -> Result<ConfidentialityTicket, SecurityError> {
        self.negotiator()?
            .negotiate_key_receiver_side(session_id, ticket)
            .await
    }

    async fn public_key_exchange(
        &self,
        session_id: SessionId,
        offer: KeyOffer,
    ) -> Result<KeyOffer, SecurityError> {
        self.negotiator()?.public_key_exchange(session_id, offer).await
    }

    async fn secret_key_exchange(
        &self,
        session_id: SessionId,
        confirmation: KeyConfirmation,
    ) -> Result<KeyConfirmation, SecurityError> {
        self.negotiator()?
            .secret_key_exchange(session_id, confirmation)
            .await
    }

    async fn terminate_session(&self, session_id: SessionId) -> Result<(), SecurityError> {
        self.negotiator()?.terminate_session(session_id).await
    }

    async fn certificate(&self) -> Result<Certificate, SecurityError> {
        self.negotiator()?.certificate().await
    }

    async fn certificate_encoded(&self) -> Result<Vec<u8>, SecurityError> {
        self.negotiator()?.certificate_encoded().await
    }

    async fn public_key(&self) -> Result<[u8; 32], SecurityError> {
        self.negotiator()?.public_key().await
    }

    async fn policy_from(&self, certificate: &Certificate) -> Result<Communication, SecurityError> {
        self.negotiator()?.policy_from(certificate).await
    }

    async fn policy_to(
        &self,
        kind: &CommunicationKind,
        to: &[Entity],
    ) -> Result<Communication, SecurityError> {
        self.negotiator()?.policy_to(kind, to).await
    }

    async fn policy(&self, context: SecurityContext) -> Result<SecurityContext, SecurityError> {
        self.negotiator()?.policy(context).await
    }

    async fn vn_name(&self) -> Result<Option<String>, SecurityError> {
        self.negotiator()?.vn_name().await
    }

    async fn entities(&self) -> Result<Vec<Entity>, SecurityError> {
        self.negotiator()?.entities().await
    }
}
