//! How bodies reach each other.
//!
//! [`Transport`] is the seam between the body protocol and the wire. The
//! in-process [`LocalTransport`] routes calls straight to the hosting
//! [`Node`]; a networked transport would marshal the same operations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use proactive_id::{BodyId, Location, NodeUrl};
use tracing::{debug, info};

use crate::error::{BodyError, CommunicationFailure};
use crate::node::Node;
use crate::remote::RemoteBody;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a handle on `body` at `location`.
    ///
    /// Fails with [`CommunicationFailure::StaleLocation`] when the node no
    /// longer hosts the body, and [`CommunicationFailure::Unreachable`] when
    /// the node cannot be contacted.
    async fn connect(
        &self,
        location: &Location,
        body: BodyId,
    ) -> Result<Arc<dyn RemoteBody>, BodyError>;

    /// Asks `node` to host `body`.
    async fn adopt(
        &self,
        node: &NodeUrl,
        id: BodyId,
        body: Arc<dyn RemoteBody>,
    ) -> Result<(), BodyError>;

    /// Asks `node` to stop hosting `id`.
    async fn release(&self, node: &NodeUrl, id: BodyId) -> Result<(), BodyError>;
}

/// Nodes living in this process.
#[derive(Debug, Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<NodeUrl, Arc<Node>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, or returns the existing node with that URL.
    pub fn add_node(&self, url: NodeUrl) -> Arc<Node> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes
            .entry(url.clone())
            .or_insert_with(|| {
                info!(node = %url, "node started");
                Arc::new(Node::new(url))
            })
            .clone()
    }

    pub fn node(&self, url: &NodeUrl) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Returns false if no node has that URL.
    pub fn set_reachable(&self, url: &NodeUrl, reachable: bool) -> bool {
        match self.node(url) {
            Some(node) => {
                info!(node = %url, reachable, "node reachability changed");
                node.set_reachable(reachable);
                true
            }
            None => false,
        }
    }

    fn reachable_node(&self, url: &NodeUrl) -> Result<Arc<Node>, BodyError> {
        self.node(url)
            .filter(|node| node.is_reachable())
            .ok_or_else(|| CommunicationFailure::Unreachable { node: url.clone() }.into())
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(
        &self,
        location: &Location,
        body: BodyId,
    ) -> Result<Arc<dyn RemoteBody>, BodyError> {
        let node = self.reachable_node(&location.node)?;
        node.lookup(body).ok_or_else(|| {
            CommunicationFailure::StaleLocation {
                body,
                location: location.clone(),
            }
            .into()
        })
    }

    async fn adopt(
        &self,
        node: &NodeUrl,
        id: BodyId,
        body: Arc<dyn RemoteBody>,
    ) -> Result<(), BodyError> {
        let node = self.reachable_node(node)?;
        node.host(id, body);
        debug!(body_id = %id, node = %node.url(), "body hosted");
        Ok(())
    }

    async fn release(&self, node: &NodeUrl, id: BodyId) -> Result<(), BodyError> {
        if let Some(node) = self.node(node) {
            node.release(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(name: &str) -> NodeUrl {
        NodeUrl::new("localhost", name).unwrap()
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let transport = LocalTransport::new();
        let a = transport.add_node(url("a"));
        let b = transport.add_node(url("a"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(transport.nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_node_is_unreachable() {
        let transport = LocalTransport::new();
        let location = Location::initial(url("nowhere"));
        let err = transport.connect(&location, BodyId::new()).await.err().unwrap();
        assert!(matches!(
            err,
            BodyError::Communication(CommunicationFailure::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_body_is_stale() {
        let transport = LocalTransport::new();
        transport.add_node(url("a"));
        let location = Location::initial(url("a"));
        let err = transport.connect(&location, BodyId::new()).await.err().unwrap();
        assert!(err.is_stale_location());
        assert!(matches!(
            err,
            BodyError::Communication(CommunicationFailure::StaleLocation { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_node_refuses_connections() {
        let transport = LocalTransport::new();
        transport.add_node(url("a"));
        assert!(transport.set_reachable(&url("a"), false));
        assert!(!transport.set_reachable(&url("b"), false));

        let err = transport
            .connect(&Location::initial(url("a")), BodyId::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BodyError::Communication(CommunicationFailure::Unreachable { .. })
        ));
    }
}
