//! Fault-tolerance message channel.
//!
//! Each body with a fault-tolerance manager gets an [`FtMessenger`]: a task of
//! its own fed by a bounded channel, so checkpoint and recovery control never
//! waits behind the body's request inbox. Delivery is at-least-once; the
//! messenger applies every sequence number exactly once and in order,
//! buffering messages that arrive ahead of a gap. Only a bounded window
//! past the gap is buffered; anything further ahead is refused.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use proactive_id::{BodyId, SequenceNumber};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::FtError;
use crate::message::Acceptance;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FtMessageKind {
    Checkpoint { index: u64 },
    Recover { checkpoint_index: u64 },
    Heartbeat,
    OutputCommit { upto: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtMessage {
    pub sequence: SequenceNumber,
    pub kind: FtMessageKind,
}

impl FtMessage {
    pub fn new(sequence: u64, kind: FtMessageKind) -> Self {
        Self {
            sequence: SequenceNumber::new(sequence),
            kind,
        }
    }
}

/// Applies fault-tolerance control to a body.
///
/// Called from the messenger task only, one message at a time and in
/// sequence order.
#[async_trait]
pub trait FaultToleranceManager: Send + 'static {
    fn name(&self) -> &str;

    async fn apply(&mut self, message: &FtMessage) -> Result<(), FtError>;
}

/// What a [`CheckpointManager`] has recorded so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointLog {
    pub checkpoints: Vec<u64>,
    pub recoveries: Vec<u64>,
    pub heartbeats: u64,
    pub committed_output: u64,
}

/// Reference manager: records checkpoints and recoveries.
///
/// Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct CheckpointManager {
    log: Arc<Mutex<CheckpointLog>>,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CheckpointLog {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl FaultToleranceManager for CheckpointManager {
    fn name(&self) -> &str {
        "checkpoint"
    }

    async fn apply(&mut self, message: &FtMessage) -> Result<(), FtError> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        match message.kind {
            FtMessageKind::Checkpoint { index } => log.checkpoints.push(index),
            FtMessageKind::Recover { checkpoint_index } => {
                if !log.checkpoints.contains(&checkpoint_index) {
                    return Err(FtError::UnknownCheckpoint {
                        index: checkpoint_index,
                    });
                }
                log.recoveries.push(checkpoint_index);
            }
            FtMessageKind::Heartbeat => log.heartbeats += 1,
            FtMessageKind::OutputCommit { upto } => {
                log.committed_output = log.committed_output.max(upto);
            }
        }
        Ok(())
    }
}

struct Envelope {
    message: FtMessage,
    accepted: oneshot::Sender<Result<Acceptance, FtError>>,
}

/// Handle to a body's fault-tolerance task.
#[derive(Debug, Clone)]
pub struct FtMessenger {
    body: BodyId,
    tx: mpsc::Sender<Envelope>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope").field("message", &self.message).finish()
    }
}

impl FtMessenger {
    /// Starts the messenger task. It stops when `shutdown` flips to true or
    /// every handle is dropped.
    ///
    /// At most `window` sequence numbers past the next expected one are
    /// buffered.
    pub fn spawn(
        body: BodyId,
        manager: Box<dyn FaultToleranceManager>,
        capacity: usize,
        window: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_ft_loop(body, manager, window.max(1), rx, shutdown));
        Self { body, tx }
    }

    /// Hands a message to the messenger and waits until it is applied or buffered.
    pub async fn deliver(&self, message: FtMessage) -> Result<Acceptance, FtError> {
        let (accepted, rx) = oneshot::channel();
        self.tx
            .send(Envelope { message, accepted })
            .await
            .map_err(|_| FtError::Stopped { body: self.body })?;
        rx.await.map_err(|_| FtError::Stopped { body: self.body })?
    }
}

struct FtState {
    body: BodyId,
    manager: Box<dyn FaultToleranceManager>,
    next: SequenceNumber,
    window: u64,
    buffered: BTreeMap<SequenceNumber, FtMessage>,
}

impl FtState {
    async fn receive(&mut self, message: FtMessage) -> Result<Acceptance, FtError> {
        let sequence = message.sequence;
        if sequence < self.next || self.buffered.contains_key(&sequence) {
            debug!(body_id = %self.body, sequence = %sequence, "duplicate FT message");
            return Ok(Acceptance::Duplicate);
        }

        if sequence.value() - self.next.value() > self.window {
            warn!(
                body_id = %self.body,
                sequence = %sequence,
                expected = %self.next,
                window = self.window,
                "FT message beyond reorder window"
            );
            return Err(FtError::OutOfWindow {
                sequence,
                expected: self.next,
                window: self.window,
            });
        }

        if sequence > self.next {
            debug!(body_id = %self.body, sequence = %sequence, expected = %self.next, "buffering FT message ahead of gap");
            self.buffered.insert(sequence, message);
            return Ok(Acceptance::Queued);
        }

        self.apply(message).await;
        while let Some(ready) = self.buffered.remove(&self.next) {
            self.apply(ready).await;
        }
        Ok(Acceptance::Queued)
    }

    async fn apply(&mut self, message: FtMessage) {
        match self.manager.apply(&message).await {
            Ok(()) => debug!(
                body_id = %self.body,
                manager = self.manager.name(),
                sequence = %message.sequence,
                "FT message applied"
            ),
            Err(e) => warn!(
                body_id = %self.body,
                manager = self.manager.name(),
                sequence = %message.sequence,
                error = %e,
                "FT message failed"
            ),
        }
        self.next = message.sequence.next();
    }
}

async fn run_ft_loop(
    body: BodyId,
    manager: Box<dyn FaultToleranceManager>,
    window: u64,
    mut rx: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut state = FtState {
        body,
        manager,
        next: SequenceNumber::FIRST,
        window,
        buffered: BTreeMap::new(),
    };

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            envelope = rx.recv() => {
                let Some(Envelope { message, accepted }) = envelope else {
                    break;
                };
                let acceptance = state.receive(message).await;
                let _ = accepted.send(acceptance);
            }
        }
    }

    info!(
        body_id = %body,
        applied_upto = state.next.value().saturating_sub(1),
        buffered = state.buffered.len(),
        "FT messenger stopped"
    );
}
