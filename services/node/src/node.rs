//! A node hosting bodies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use proactive_id::{BodyId, NodeId, NodeUrl};

use crate::remote::RemoteBody;

pub struct Node {
    id: NodeId,
    url: NodeUrl,
    bodies: RwLock<HashMap<BodyId, Arc<dyn RemoteBody>>>,
    reachable: AtomicBool,
}

impl Node {
    pub fn new(url: NodeUrl) -> Self {
        Self {
            id: NodeId::new(),
            url,
            bodies: RwLock::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn url(&self) -> &NodeUrl {
        &self.url
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Simulates the node dropping off the network, or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub(crate) fn host(&self, id: BodyId, body: Arc<dyn RemoteBody>) {
        self.bodies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, body);
    }

    pub(crate) fn release(&self, id: BodyId) -> Option<Arc<dyn RemoteBody>> {
        self.bodies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn lookup(&self, id: BodyId) -> Option<Arc<dyn RemoteBody>> {
        self.bodies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn hosts(&self, id: BodyId) -> bool {
        self.bodies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn body_ids(&self) -> Vec<BodyId> {
        self.bodies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bodies.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("bodies", &self.len())
            .field("reachable", &self.is_reachable())
            .finish()
    }
}
