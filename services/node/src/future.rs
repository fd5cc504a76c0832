//! Futures for asynchronous calls.
//!
//! A [`ReplyFuture`] starts `Pending` and is settled exactly once, either
//! resolved with the reply value or failed with an error. Settlement goes
//! through a [`FutureResolver`]; the first write wins and every later write is
//! refused. Reads after settlement always return the same value.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::BodyError;
use crate::message::{Acceptance, CorrelationKey};

/// Observable state of a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    Pending,
    Resolved,
    Failed,
}

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Resolved(Value),
    Failed(BodyError),
}

impl Slot {
    fn settled(&self) -> Option<Result<Value, BodyError>> {
        match self {
            Slot::Pending => None,
            Slot::Resolved(value) => Some(Ok(value.clone())),
            Slot::Failed(err) => Some(Err(err.clone())),
        }
    }
}

/// Placeholder for the result of an asynchronous call.
///
/// Clones observe the same settlement.
#[derive(Debug, Clone)]
pub struct ReplyFuture {
    rx: watch::Receiver<Slot>,
    key: Option<CorrelationKey>,
}

/// Write side of a [`ReplyFuture`].
#[derive(Debug)]
pub struct FutureResolver {
    tx: watch::Sender<Slot>,
}

impl ReplyFuture {
    /// A pending future and the resolver that settles it.
    pub fn pending() -> (FutureResolver, ReplyFuture) {
        let (tx, rx) = watch::channel(Slot::Pending);
        (FutureResolver { tx }, ReplyFuture { rx, key: None })
    }

    /// An already-resolved future.
    pub fn resolved(value: Value) -> Self {
        let (_, rx) = watch::channel(Slot::Resolved(value));
        Self { rx, key: None }
    }

    pub fn failed(error: BodyError) -> Self {
        let (_, rx) = watch::channel(Slot::Failed(error));
        Self { rx, key: None }
    }

    /// The call this future answers, if it came from a proxy.
    pub fn key(&self) -> Option<CorrelationKey> {
        self.key
    }

    pub fn state(&self) -> FutureState {
        match &*self.rx.borrow() {
            Slot::Pending => FutureState::Pending,
            Slot::Resolved(_) => FutureState::Resolved,
            Slot::Failed(_) => FutureState::Failed,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state() != FutureState::Pending
    }

    /// The settled value, without waiting.
    pub fn try_get(&self) -> Option<Result<Value, BodyError>> {
        self.rx.borrow().settled()
    }

    /// Waits by necessity until the future is settled.
    ///
    /// A future whose resolver goes away while still pending fails with
    /// [`BodyError::Cancelled`].
    pub async fn get(&self) -> Result<Value, BodyError> {
        let mut rx = self.rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().settled() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().settled().unwrap_or(Err(BodyError::Cancelled));
            }
        }
    }

    pub async fn get_timeout(&self, timeout: Duration) -> Result<Value, BodyError> {
        tokio::time::timeout(timeout, self.get())
            .await
            .map_err(|_| BodyError::Timeout(timeout))?
    }

    /// Waits and decodes the value.
    pub async fn get_as<T: DeserializeOwned>(&self) -> Result<T, BodyError> {
        let value = self.get().await?;
        serde_json::from_value(value).map_err(BodyError::codec)
    }
}

impl FutureResolver {
    /// Resolves the future. Returns false if it was already settled.
    pub fn resolve(&self, value: Value) -> bool {
        self.settle(Slot::Resolved(value))
    }

    /// Fails the future. Returns false if it was already settled.
    pub fn fail(&self, error: BodyError) -> bool {
        self.settle(Slot::Failed(error))
    }

    pub fn settle_with(&self, outcome: Result<Value, BodyError>) -> bool {
        match outcome {
            Ok(value) => self.resolve(value),
            Err(err) => self.fail(err),
        }
    }

    fn settle(&self, next: Slot) -> bool {
        self.tx.send_if_modified(|slot| {
            if matches!(slot, Slot::Pending) {
                *slot = next;
                true
            } else {
                false
            }
        })
    }
}

/// Pending calls of one body, keyed by correlation.
#[derive(Debug, Default)]
pub struct FutureTable {
    pending: Mutex<HashMap<CorrelationKey, FutureResolver>>,
}

impl FutureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the future for an outgoing call.
    pub fn register(&self, key: CorrelationKey) -> ReplyFuture {
        let (resolver, mut future) = ReplyFuture::pending();
        future.key = Some(key);
        self.lock().insert(key, resolver);
        future
    }

    /// Settles the future waiting for `key`. Unknown keys are ignored.
    pub fn complete(&self, key: CorrelationKey, outcome: Result<Value, BodyError>) -> Acceptance {
        let Some(resolver) = self.lock().remove(&key) else {
            return Acceptance::Ignored;
        };
        if resolver.settle_with(outcome) {
            Acceptance::Queued
        } else {
            Acceptance::Duplicate
        }
    }

    pub fn fail(&self, key: CorrelationKey, error: BodyError) -> bool {
        self.lock()
            .remove(&key)
            .is_some_and(|resolver| resolver.fail(error))
    }

    /// Abandons the call; its eventual reply will be ignored.
    pub fn cancel(&self, key: CorrelationKey) -> bool {
        self.fail(key, BodyError::Cancelled)
    }

    /// Fails every pending call. Returns how many were failed.
    pub fn fail_all(&self, error: BodyError) -> usize {
        let drained: Vec<FutureResolver> = self.lock().drain().map(|(_, r)| r).collect();
        drained
            .iter()
            .filter(|resolver| resolver.fail(error.clone()))
            .count()
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationKey, FutureResolver>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
