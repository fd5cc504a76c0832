//! Capabilities a body exposes to its peers.
//!
//! Each trait is one concern; [`RemoteBody`] is their composition and is
//! what a transport hands out. All operations can fail with a communication
//! error because the peer may live on another node.

use async_trait::async_trait;
use std::sync::Arc;

use proactive_id::{BodyId, JobId, ListenerId, Location, NodeUrl};
use proactive_security::SecurityNegotiable;

use crate::error::BodyError;
use crate::ft::FtMessage;
use crate::message::{Acceptance, Reply, Request, TypeTag};
use crate::nfe::{NfeEvent, NfeSubscription};

/// Request/reply delivery and identity queries.
#[async_trait]
pub trait Invokable: Send + Sync {
    async fn receive_request(&self, request: Request) -> Result<Acceptance, BodyError>;

    /// Settles the matching future. Replies nobody waits for are ignored.
    async fn receive_reply(&self, reply: Reply) -> Result<Acceptance, BodyError>;

    async fn terminate(&self) -> Result<(), BodyError>;

    async fn node_url(&self) -> Result<NodeUrl, BodyError>;

    async fn id(&self) -> Result<BodyId, BodyError>;

    async fn job_id(&self) -> Result<JobId, BodyError>;
}

/// Mobility.
#[async_trait]
pub trait Relocatable: Send + Sync {
    /// Tells this body that `body` now lives at `location`.
    async fn update_location(&self, body: BodyId, location: Location) -> Result<(), BodyError>;

    /// Moves this body to `node` once the requests queued before it are served.
    async fn migrate_to(&self, node: NodeUrl) -> Result<Location, BodyError>;

    /// Brings a body left suspended by a failed migration back to active.
    async fn resume(&self) -> Result<(), BodyError>;
}

#[async_trait]
pub trait ContinuationControl: Send + Sync {
    async fn enable_ac(&self) -> Result<(), BodyError>;

    async fn disable_ac(&self) -> Result<(), BodyError>;
}

#[async_trait]
pub trait ImmediateServiceControl: Send + Sync {
    async fn set_immediate_service(&self, name: &str) -> Result<(), BodyError>;

    async fn set_immediate_service_with_params(
        &self,
        name: &str,
        params: Vec<TypeTag>,
    ) -> Result<(), BodyError>;

    async fn remove_immediate_service(&self, name: &str) -> Result<(), BodyError>;

    async fn remove_immediate_service_with_params(
        &self,
        name: &str,
        params: Vec<TypeTag>,
    ) -> Result<(), BodyError>;
}

#[async_trait]
pub trait FaultTolerant: Send + Sync {
    async fn receive_ft_message(&self, message: FtMessage) -> Result<Acceptance, BodyError>;
}

#[async_trait]
pub trait NfeSource: Send + Sync {
    async fn add_nfe_listener(&self) -> Result<NfeSubscription, BodyError>;

    async fn remove_nfe_listener(&self, id: ListenerId) -> Result<bool, BodyError>;

    /// Broadcasts `event`; returns how many listeners received it.
    async fn fire_nfe(&self, event: NfeEvent) -> Result<usize, BodyError>;
}

/// Everything a peer can ask of a body.
pub trait RemoteBody:
    Invokable
    + Relocatable
    + ContinuationControl
    + ImmediateServiceControl
    + FaultTolerant
    + NfeSource
    + SecurityNegotiable
{
}

impl<T> RemoteBody for T where
    T: Invokable
        + Relocatable
        + ContinuationControl
        + ImmediateServiceControl
        + FaultTolerant
        + NfeSource
        + SecurityNegotiable
        + ?Sized
{
}

/// The handshake face of a remote body.
pub(crate) fn negotiable(remote: &Arc<dyn RemoteBody>) -> &dyn SecurityNegotiable {
    remote.as_ref()
}
