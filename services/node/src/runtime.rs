//! The runtime: nodes, bodies, and what they share.

use std::sync::Arc;

use proactive_id::{BodyId, JobId, NodeUrl};
use proactive_security::{SecurityProfile, SessionTable};
use tracing::{info, warn};

use crate::body::{spawn_body, ActiveObject, BodyHandle, BodyOptions};
use crate::config::Config;
use crate::error::BodyError;
use crate::node::Node;
use crate::proxy::Proxy;
use crate::registry::LocationRegistry;
use crate::remote::Invokable;
use crate::transport::{LocalTransport, Transport};

/// State every body in a runtime shares.
pub struct Environment {
    pub config: Config,
    pub registry: Arc<LocationRegistry>,
    pub transport: Arc<dyn Transport>,
    pub sessions: Arc<SessionTable>,
    /// `None` runs every body without security.
    pub security: Option<SecurityProfile>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("sessions", &self.sessions.len())
            .field("secured", &self.security.is_some())
            .finish()
    }
}

/// Entry point for creating nodes and active objects in this process.
#[derive(Debug)]
pub struct ProActiveRuntime {
    env: Arc<Environment>,
    transport: Arc<LocalTransport>,
}

impl ProActiveRuntime {
    pub fn new(config: Config) -> Self {
        Self::build(config, None, direct)
    }

    /// A runtime whose bodies negotiate sessions with `profile`.
    pub fn with_security(config: Config, profile: SecurityProfile) -> Self {
        let profile = profile.with_handshake_timeout(config.handshake_timeout);
        Self::build(config, Some(profile), direct)
    }

    /// A runtime whose bodies reach each other through `wrap(local)`.
    ///
    /// Nodes are still hosted by the in-process transport passed to `wrap`.
    pub fn with_transport(
        config: Config,
        security: Option<SecurityProfile>,
        wrap: impl FnOnce(Arc<LocalTransport>) -> Arc<dyn Transport>,
    ) -> Self {
        let security = security.map(|profile| profile.with_handshake_timeout(config.handshake_timeout));
        Self::build(config, security, wrap)
    }

    fn build(
        config: Config,
        security: Option<SecurityProfile>,
        wrap: impl FnOnce(Arc<LocalTransport>) -> Arc<dyn Transport>,
    ) -> Self {
        let transport = Arc::new(LocalTransport::new());
        let env = Arc::new(Environment {
            sessions: Arc::new(SessionTable::new(config.session_limits)),
            registry: Arc::new(LocationRegistry::new()),
            transport: wrap(Arc::clone(&transport)),
            security,
            config,
        });
        info!(
            job_id = %env.config.job_id,
            secured = env.security.is_some(),
            "runtime started"
        );
        Self { env, transport }
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn config(&self) -> &Config {
        &self.env.config
    }

    pub fn job_id(&self) -> JobId {
        self.env.config.job_id
    }

    pub fn registry(&self) -> &Arc<LocationRegistry> {
        &self.env.registry
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.env.sessions
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    /// Starts a node named `name` on the configured host.
    pub fn create_node(&self, name: &str) -> Result<Arc<Node>, BodyError> {
        let url = NodeUrl::new(self.env.config.host.clone(), name)?;
        Ok(self.transport.add_node(url))
    }

    pub fn node(&self, url: &NodeUrl) -> Option<Arc<Node>> {
        self.transport.node(url)
    }

    /// Turns `object` into an active object hosted on `node`.
    pub async fn new_active(
        &self,
        node: &NodeUrl,
        object: impl ActiveObject,
    ) -> Result<Arc<BodyHandle>, BodyError> {
        self.new_active_with(node, Arc::new(object), BodyOptions::default())
            .await
    }

    pub async fn new_active_with(
        &self,
        node: &NodeUrl,
        object: Arc<dyn ActiveObject>,
        options: BodyOptions,
    ) -> Result<Arc<BodyHandle>, BodyError> {
        spawn_body(Arc::clone(&self.env), node, Some(object), options).await
    }

    /// A body for code that calls active objects without being one.
    pub async fn new_half_body(&self, node: &NodeUrl) -> Result<Arc<BodyHandle>, BodyError> {
        spawn_body(Arc::clone(&self.env), node, None, BodyOptions::default()).await
    }

    /// A stub for calling `target` from `caller`.
    pub fn lookup(&self, caller: &BodyHandle, target: BodyId) -> Result<Proxy, BodyError> {
        caller.proxy(target)
    }

    /// Terminates every body on every node.
    pub async fn shutdown(&self) {
        let mut terminated = 0usize;
        for node in self.transport.nodes() {
            for id in node.body_ids() {
                let Some(body) = node.lookup(id) else {
                    continue;
                };
                match body.terminate().await {
                    Ok(()) => terminated += 1,
                    Err(e) => warn!(body_id = %id, error = %e, "body did not terminate"),
                }
            }
        }
        info!(terminated, "runtime stopped");
    }
}

fn direct(local: Arc<LocalTransport>) -> Arc<dyn Transport> {
    local
}
