//! Identity to location registry.
//!
//! The outer lock only guards the key set. Each identity has its own lock, so
//! a migration rewriting one entry never blocks resolves of another body.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use proactive_id::{BodyId, Location};
use tracing::debug;

use crate::error::BodyError;

#[derive(Debug, Default)]
pub struct LocationRegistry {
    entries: RwLock<HashMap<BodyId, Arc<RwLock<Location>>>>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly created body. Replaces any previous entry for the id.
    pub fn register(&self, id: BodyId, location: Location) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(RwLock::new(location)));
    }

    pub fn resolve(&self, id: BodyId) -> Result<Location, BodyError> {
        let entry = self.entry(id).ok_or(BodyError::NotFound(id))?;
        let location = entry.read().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(location)
    }

    /// Moves `id` to `location`.
    ///
    /// Returns false, leaving the entry untouched, if `location` is not newer
    /// than the stored one.
    pub fn update_location(&self, id: BodyId, location: Location) -> Result<bool, BodyError> {
        let entry = self.entry(id).ok_or(BodyError::NotFound(id))?;
        let mut current = entry.write().unwrap_or_else(PoisonError::into_inner);
        if !location.is_newer_than(&current) {
            debug!(body_id = %id, stored = %current, offered = %location, "ignoring stale location update");
            return Ok(false);
        }
        *current = location;
        Ok(true)
    }

    pub fn unregister(&self, id: BodyId) -> Option<Location> {
        let entry = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)?;
        let location = entry.read().unwrap_or_else(PoisonError::into_inner).clone();
        Some(location)
    }

    pub fn contains(&self, id: BodyId) -> bool {
        self.entry(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, id: BodyId) -> Option<Arc<RwLock<Location>>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use proactive_id::NodeUrl;

    use super::*;

    fn node(name: &str) -> NodeUrl {
        NodeUrl::new("localhost", name).unwrap()
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = LocationRegistry::new();
        let id = BodyId::new();
        let location = Location::initial(node("a"));

        registry.register(id, location.clone());
        assert_eq!(registry.resolve(id).unwrap(), location);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let registry = LocationRegistry::new();
        let id = BodyId::new();
        assert_eq!(registry.resolve(id), Err(BodyError::NotFound(id)));
    }

    #[test]
    fn test_update_is_visible_to_later_resolves() {
        let registry = LocationRegistry::new();
        let id = BodyId::new();
        let first = Location::initial(node("a"));
        registry.register(id, first.clone());

        let second = first.moved_to(node("b"));
        assert!(registry.update_location(id, second.clone()).unwrap());
        assert_eq!(registry.resolve(id).unwrap(), second);
    }

    #[test]
    fn test_stale_update_is_ignored() {
        let registry = LocationRegistry::new();
        let id = BodyId::new();
        let first = Location::initial(node("a"));
        let second = first.moved_to(node("b"));
        registry.register(id, second.clone());

        assert!(!registry.update_location(id, first).unwrap());
        assert!(!registry.update_location(id, second.clone()).unwrap());
        assert_eq!(registry.resolve(id).unwrap(), second);
    }

    #[test]
    fn test_unregister() {
        let registry = LocationRegistry::new();
        let id = BodyId::new();
        registry.register(id, Location::initial(node("a")));

        assert!(registry.unregister(id).is_some());
        assert!(!registry.contains(id));
        assert!(registry.unregister(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_resolves_never_see_torn_values() {
        let registry = Arc::new(LocationRegistry::new());
        let id = BodyId::new();
        let nodes: Vec<NodeUrl> = (0..4).map(|i| node(&format!("n{}", i))).collect();
        registry.register(id, Location::initial(nodes[0].clone()));

        let writer = {
            let registry = Arc::clone(&registry);
            let nodes = nodes.clone();
            std::thread::spawn(move || {
                let mut location = registry.resolve(id).unwrap();
                for epoch in 1..200u64 {
                    location = location.moved_to(nodes[(epoch % 4) as usize].clone());
                    registry.update_location(id, location.clone()).unwrap();
                }
            })
        };

        let mut last_epoch = 0;
        for _ in 0..200 {
            let seen = registry.resolve(id).unwrap();
            assert_eq!(seen.node, nodes[(seen.epoch % 4) as usize]);
            assert!(seen.epoch >= last_epoch);
            last_epoch = seen.epoch;
        }
        writer.join().unwrap();
        assert_eq!(registry.resolve(id).unwrap().epoch, 199);
    }
}
