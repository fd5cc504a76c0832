//! Non-functional exception broadcast.
//!
//! Every body owns an [`NfeBus`]. Subscribers get their own unbounded
//! channel, so firing never blocks the body and events reach each
//! subscriber in the order they were fired.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use proactive_id::{BodyId, ListenerId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::error::{BodyError, ErrorKind};

/// A protocol-level failure observed by a body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NfeEvent {
    pub body: BodyId,
    pub kind: ErrorKind,
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
}

impl NfeEvent {
    pub fn new(body: BodyId, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            body,
            kind,
            detail: detail.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn from_error(body: BodyId, error: &BodyError) -> Self {
        Self::new(body, error.kind(), error.to_string())
    }
}

/// One listener's event stream.
#[derive(Debug)]
pub struct NfeSubscription {
    id: ListenerId,
    receiver: mpsc::UnboundedReceiver<NfeEvent>,
}

impl NfeSubscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Next event; `None` once the listener was removed and drained.
    pub async fn recv(&mut self) -> Option<NfeEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<NfeEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<NfeEvent> {
        UnboundedReceiverStream::new(self.receiver)
    }
}

#[derive(Debug)]
pub struct NfeBus {
    body: BodyId,
    subscribers: Mutex<Vec<(ListenerId, mpsc::UnboundedSender<NfeEvent>)>>,
}

impl NfeBus {
    pub fn new(body: BodyId) -> Self {
        Self {
            body,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> NfeSubscription {
        let (tx, receiver) = mpsc::unbounded_channel();
        let id = ListenerId::new();
        self.lock().push((id, tx));
        debug!(body_id = %self.body, listener_id = %id, "NFE listener added");
        NfeSubscription { id, receiver }
    }

    /// Removes a listener. Its stream ends after the events already delivered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(listener, _)| *listener != id);
        before != subscribers.len()
    }

    /// Delivers `event` to every subscriber. Returns how many received it.
    pub fn fire(&self, event: NfeEvent) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|(listener, tx)| {
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                warn!(body_id = %self.body, listener_id = %listener, "pruning NFE listener whose stream was dropped");
            }
            delivered
        });
        debug!(
            body_id = %self.body,
            kind = %event.kind,
            listeners = subscribers.len(),
            "NFE fired"
        );
        subscribers.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, mpsc::UnboundedSender<NfeEvent>)>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
