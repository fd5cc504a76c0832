use std::sync::Arc;

use proactive_id::{BodyId, JobId, Location, NodeUrl};
use tracing::debug;

use super::{spawn_body, ActiveObject, BodyHandle, BodyOptions};
use crate::error::{BodyError, ErrorKind};
use crate::nfe::NfeEvent;
use crate::proxy::Proxy;
use crate::remote::Invokable;

/// What an active object sees of its own body while serving.
#[derive(Debug, Clone)]
pub struct BodyContext {
    body: Arc<BodyHandle>,
}

impl BodyContext {
    pub(crate) fn new(body: Arc<BodyHandle>) -> Self {
        Self { body }
    }

    pub fn id(&self) -> BodyId {
        self.body.id()
    }

    pub fn job_id(&self) -> JobId {
        self.body.job_id()
    }

    pub fn location(&self) -> Location {
        self.body.location()
    }

    pub fn node(&self) -> NodeUrl {
        self.body.node()
    }

    pub fn body(&self) -> &Arc<BodyHandle> {
        &self.body
    }

    /// A stub for calling `target` from this body.
    pub fn proxy(&self, target: BodyId) -> Result<Proxy, BodyError> {
        self.body.proxy(target)
    }

    /// Creates another active object on this body's node.
    ///
    /// The child inherits the job and starts without automatic continuation.
    pub async fn new_active(&self, object: impl ActiveObject) -> Result<BodyId, BodyError> {
        self.new_active_on(&self.node(), Arc::new(object), BodyOptions::default())
            .await
    }

    pub async fn new_active_on(
        &self,
        node: &NodeUrl,
        object: Arc<dyn ActiveObject>,
        options: BodyOptions,
    ) -> Result<BodyId, BodyError> {
        let child = spawn_body(Arc::clone(self.body.environment()), node, Some(object), options)
            .await?;
        self.body.remember_location(child.id(), child.location());
        debug!(body_id = %self.id(), child = %child.id(), "child body created");
        Ok(child.id())
    }

    /// Moves this body to `node` once the current request is served.
    ///
    /// Only schedules the move: waiting for it here would deadlock the body.
    pub async fn migrate_to(&self, node: NodeUrl) -> Result<(), BodyError> {
        self.body.schedule_migration(node).await.map(|_| ())
    }

    pub fn fire_nfe(&self, kind: ErrorKind, detail: impl Into<String>) -> usize {
        self.body.nfe().fire(NfeEvent::new(self.id(), kind, detail))
    }

    /// Stops the body after the current request.
    pub async fn terminate(&self) -> Result<(), BodyError> {
        self.body.terminate().await
    }
}
