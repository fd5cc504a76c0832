//! Shared session table.
//!
//! One slot per (local, remote) pair. The map lock is only held to find or
//! insert a slot; everything else happens under the slot's own mutex, so
//! unrelated pairs never contend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use proactive_id::{BodyId, SessionId};
use tokio::sync::watch;

use crate::session::{SecuritySession, SessionLimits, SessionState};

/// Key of a session slot: the session as seen from `local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub local: BodyId,
    pub remote: BodyId,
}

impl SessionKey {
    pub fn new(local: BodyId, remote: BodyId) -> Self {
        Self { local, remote }
    }
}

pub(crate) struct SessionSlot {
    session: Mutex<SecuritySession>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionSlot {
    fn new(session: SecuritySession) -> Self {
        let (state_tx, _) = watch::channel(session.state());
        Self {
            session: Mutex::new(session),
            state_tx,
        }
    }

    /// Runs `f` under the slot lock and publishes the resulting state.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut SecuritySession) -> R) -> R {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut session);
        let state = session.state();
        drop(session);

        self.state_tx.send_if_modified(|published| {
            let changed = *published != state;
            *published = state;
            changed
        });
        result
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&SecuritySession) -> R) -> R {
        let session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        f(&session)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }
}

/// Sessions of every body in a process, plus the session id allocator.
pub struct SessionTable {
    slots: RwLock<HashMap<SessionKey, Arc<SessionSlot>>>,
    // (responder, session id) -> initiator; ids are allocated by the responder
    index: RwLock<HashMap<(BodyId, SessionId), BodyId>>,
    next_id: AtomicU64,
    limits: SessionLimits,
}

impl SessionTable {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            limits,
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// State of the pair's session, if a slot exists.
    pub fn state(&self, key: &SessionKey) -> Option<SessionState> {
        self.get(key).map(|slot| slot.read(SecuritySession::state))
    }

    pub fn session_id(&self, key: &SessionKey) -> Option<SessionId> {
        self.get(key).and_then(|slot| slot.read(SecuritySession::session_id))
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every session `local` takes part in. Returns how many were removed.
    pub fn remove_body(&self, local: BodyId) -> usize {
        let removed = {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            let before = slots.len();
            slots.retain(|key, _| key.local != local);
            before - slots.len()
        };
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(responder, _), _| *responder != local);
        removed
    }

    pub(crate) fn get(&self, key: &SessionKey) -> Option<Arc<SessionSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub(crate) fn get_or_create(&self, key: SessionKey) -> Arc<SessionSlot> {
        if let Some(slot) = self.get(&key) {
            return slot;
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(key)
            .or_insert_with(|| {
                Arc::new(SessionSlot::new(SecuritySession::new(
                    key.local,
                    key.remote,
                    self.limits,
                )))
            })
            .clone()
    }

    pub(crate) fn remove(&self, key: &SessionKey) -> Option<Arc<SessionSlot>> {
        let removed = self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if removed.is_some() {
            self.index
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(responder, _), initiator| {
                    !(*responder == key.local && *initiator == key.remote)
                });
        }
        removed
    }

    pub(crate) fn allocate_session_id(&self) -> SessionId {
        SessionId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn index(&self, responder: BodyId, session_id: SessionId, initiator: BodyId) {
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((responder, session_id), initiator);
    }

    /// The slot of `local` holding `session_id`, whichever role `local` played.
    pub(crate) fn find_by_session(
        &self,
        local: BodyId,
        session_id: SessionId,
    ) -> Option<(BodyId, Arc<SessionSlot>)> {
        if let Some(remote) = self.lookup(local, session_id) {
            if let Some(slot) = self.get(&SessionKey::new(local, remote)) {
                if slot.read(|s| s.holds(session_id)) {
                    return Some((remote, slot));
                }
            }
        }

        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .filter(|(key, _)| key.local == local)
            .find(|(_, slot)| slot.read(|s| s.holds(session_id)))
            .map(|(key, slot)| (key.remote, slot.clone()))
    }

    pub(crate) fn lookup(&self, responder: BodyId, session_id: SessionId) -> Option<BodyId> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(responder, session_id))
            .copied()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(SessionLimits::default())
    }
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("sessions", &self.len())
            .field("limits", &self.limits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRole;

    #[test]
    fn test_get_or_create_returns_same_slot() {
        let table = SessionTable::default();
        let key = SessionKey::new(BodyId::new(), BodyId::new());
        let one = table.get_or_create(key);
        let two = table.get_or_create(key);
        assert!(Arc::ptr_eq(&one, &two));
        assert_eq!(table.state(&key), Some(SessionState::Uninitialized));
    }

    #[test]
    fn test_session_ids_increase() {
        let table = SessionTable::default();
        let a = table.allocate_session_id();
        let b = table.allocate_session_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_update_publishes_state() {
        let table = SessionTable::default();
        let key = SessionKey::new(BodyId::new(), BodyId::new());
        let slot = table.get_or_create(key);
        let mut rx = slot.subscribe();

        slot.update(|s| s.begin(SessionRole::Initiator)).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Negotiating);
    }

    #[test]
    fn test_remove_clears_index() {
        let table = SessionTable::default();
        let (local, remote) = (BodyId::new(), BodyId::new());
        let key = SessionKey::new(local, remote);
        table.get_or_create(key);
        let id = table.allocate_session_id();
        table.index(local, id, remote);

        assert!(table.remove(&key).is_some());
        assert!(!table.contains(&key));
        assert_eq!(table.lookup(local, id), None);
    }

    #[test]
    fn test_remove_body() {
        let table = SessionTable::default();
        let local = BodyId::new();
        table.get_or_create(SessionKey::new(local, BodyId::new()));
        table.get_or_create(SessionKey::new(local, BodyId::new()));
        table.get_or_create(SessionKey::new(BodyId::new(), local));

        assert_eq!(table.remove_body(local), 2);
        assert_eq!(table.len(), 1);
    }
}
