//! A binary search tree where every node is its own active object.
//!
//! `put` and `get` that miss the current node are forwarded to the child
//! body, and the reply is whatever the child answers.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use proactive_id::BodyId;
use serde_json::Value;

use crate::body::{ActiveObject, BodyContext, Call, Outcome};
use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

#[derive(Debug)]
struct Entry {
    key: i64,
    value: String,
    left: Option<BodyId>,
    right: Option<BodyId>,
}

impl Entry {
    fn new(key: i64, value: String) -> Self {
        Self {
            key,
            value,
            left: None,
            right: None,
        }
    }

    fn side(&self, key: i64) -> Side {
        if key < self.key {
            Side::Left
        } else {
            Side::Right
        }
    }

    fn child(&self, side: Side) -> Option<BodyId> {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    fn set_child(&mut self, side: Side, child: BodyId) {
        match side {
            Side::Left => self.left = Some(child),
            Side::Right => self.right = Some(child),
        }
    }
}

#[derive(Debug, Default)]
pub struct BinaryTree {
    entry: Mutex<Option<Entry>>,
}

impl BinaryTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self) -> MutexGuard<'_, Option<Entry>> {
        self.entry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn put(&self, key: i64, value: String, ctx: &BodyContext) -> Result<Outcome, ServiceError> {
        let (side, child) = {
            let mut entry = self.entry();
            match entry.as_mut() {
                Some(current) if current.key == key => {
                    current.value = value;
                    return Ok(Outcome::unit());
                }
                Some(current) => {
                    let side = current.side(key);
                    (side, current.child(side))
                }
                None => {
                    *entry = Some(Entry::new(key, value));
                    return Ok(Outcome::unit());
                }
            }
        };

        let child = match child {
            Some(child) => child,
            None => {
                let child = ctx.new_active(BinaryTree::new()).await?;
                if let Some(current) = self.entry().as_mut() {
                    current.set_child(side, child);
                }
                child
            }
        };

        let reply = ctx.proxy(child)?.call("put", (key, value)).await?;
        Ok(Outcome::Forward(reply))
    }

    async fn get(&self, key: i64, ctx: &BodyContext) -> Result<Outcome, ServiceError> {
        let child = {
            let entry = self.entry();
            match entry.as_ref() {
                None => return Ok(Outcome::Value(Value::Null)),
                Some(current) if current.key == key => return Outcome::value(&current.value),
                Some(current) => current.child(current.side(key)),
            }
        };

        match child {
            Some(child) => {
                let reply = ctx.proxy(child)?.call("get", key).await?;
                Ok(Outcome::Forward(reply))
            }
            None => Ok(Outcome::Value(Value::Null)),
        }
    }
}

#[async_trait]
impl ActiveObject for BinaryTree {
    fn name(&self) -> &str {
        "binary-tree"
    }

    async fn serve(&self, call: Call, ctx: &BodyContext) -> Result<Outcome, ServiceError> {
        match call.name() {
            "put" => {
                let (key, value): (i64, String) = call.args()?;
                self.put(key, value, ctx).await
            }
            "get" => {
                let key: i64 = call.args()?;
                self.get(key, ctx).await
            }
            _ => Err(call.unknown()),
        }
    }
}
