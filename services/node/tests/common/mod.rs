//! Shared fixtures for the node integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proactive_id::{BodyId, Location, NodeUrl};
use proactive_node::error::ServiceError;
use proactive_node::remote::RemoteBody;
use proactive_node::transport::{LocalTransport, Transport};
use proactive_node::BodyError;
use proactive_node::{ActiveObject, BodyContext, BodyHandle, Call, Config, Outcome, ProActiveRuntime};
use proactive_security::{
    CertificateAuthority, EntityKeys, PolicyServer, SecurityProfile, SessionLimits, TrustStore,
};
use serde_json::Value;
use tokio::sync::Notify;

/// Short suspension bound so tests do not wait long.
pub fn config() -> Config {
    Config {
        max_suspension: Duration::from_millis(50),
        ..Config::default()
    }
}

pub fn profile(policies: PolicyServer) -> SecurityProfile {
    let ca = CertificateAuthority::new_root("test-root", chrono::Duration::days(1));
    let keys = EntityKeys::generate();
    let certificate = ca.issue("test-runtime", keys.public_key(), chrono::Duration::hours(1));
    let trust = TrustStore::new().with_anchor(ca.certificate()).unwrap();
    SecurityProfile::new(keys, certificate, trust)
        .unwrap()
        .with_policies(policies)
}

/// A runtime with two nodes.
pub struct Cluster {
    pub runtime: ProActiveRuntime,
    pub home: NodeUrl,
    pub away: NodeUrl,
}

impl Cluster {
    pub fn new() -> Self {
        Self::from_runtime(ProActiveRuntime::new(config()))
    }

    pub fn secured(policies: PolicyServer) -> Self {
        Self::secured_with_limits(policies, SessionLimits::default())
    }

    pub fn secured_with_limits(policies: PolicyServer, limits: SessionLimits) -> Self {
        let config = Config {
            session_limits: limits,
            ..config()
        };
        Self::from_runtime(ProActiveRuntime::with_security(config, profile(policies)))
    }

    /// A runtime whose connections are counted by `counter`.
    pub fn counted(counter: Arc<ConnectCounter>) -> Self {
        let wrap = move |local: Arc<LocalTransport>| -> Arc<dyn Transport> {
            Arc::new(CountingTransport {
                inner: local,
                counter,
            })
        };
        Self::from_runtime(ProActiveRuntime::with_transport(config(), None, wrap))
    }

    fn from_runtime(runtime: ProActiveRuntime) -> Self {
        let home = runtime.create_node("home").unwrap().url().clone();
        let away = runtime.create_node("away").unwrap().url().clone();
        Self {
            runtime,
            home,
            away,
        }
    }

    pub async fn caller(&self) -> Arc<BodyHandle> {
        self.runtime.new_half_body(&self.home).await.unwrap()
    }

    pub async fn spawn(&self, object: impl ActiveObject) -> Arc<BodyHandle> {
        self.runtime.new_active(&self.home, object).await.unwrap()
    }
}

/// Which bodies were connected to, in order.
#[derive(Debug, Default)]
pub struct ConnectCounter {
    targets: Mutex<Vec<BodyId>>,
}

impl ConnectCounter {
    pub fn attempts(&self, body: BodyId) -> usize {
        self.targets
            .lock()
            .unwrap()
            .iter()
            .filter(|target| **target == body)
            .count()
    }
}

struct CountingTransport {
    inner: Arc<LocalTransport>,
    counter: Arc<ConnectCounter>,
}

#[async_trait]
impl Transport for CountingTransport {
    async fn connect(
        &self,
        location: &Location,
        body: BodyId,
    ) -> Result<Arc<dyn RemoteBody>, BodyError> {
        self.counter.targets.lock().unwrap().push(body);
        self.inner.connect(location, body).await
    }

    async fn adopt(
        &self,
        node: &NodeUrl,
        id: BodyId,
        body: Arc<dyn RemoteBody>,
    ) -> Result<(), BodyError> {
        self.inner.adopt(node, id, body).await
    }

    async fn release(&self, node: &NodeUrl, id: BodyId) -> Result<(), BodyError> {
        self.inner.release(node, id).await
    }
}

/// Remembers the ids it was sent, in arrival order.
#[derive(Debug, Default)]
pub struct Recorder {
    ids: Mutex<Vec<i64>>,
}

#[async_trait]
impl ActiveObject for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn serve(&self, call: Call, ctx: &BodyContext) -> Result<Outcome, ServiceError> {
        match call.name() {
            "record" => {
                let id: i64 = call.args()?;
                self.ids.lock().unwrap().push(id);
                Outcome::value(id)
            }
            "ids" => Outcome::value(self.ids.lock().unwrap().clone()),
            "echo" => Ok(Outcome::Value(call.args.clone())),
            "where" => Outcome::value(ctx.node().to_string()),
            "fail" => Err(ServiceError::Failed("asked to fail".into())),
            _ => Err(call.unknown()),
        }
    }
}

/// `block` waits for [`Gate::release`]; `status` answers at once.
#[derive(Debug, Default)]
pub struct Gate {
    pub release: Arc<Notify>,
}

impl Gate {
    pub fn new(release: Arc<Notify>) -> Self {
        Self { release }
    }
}

#[async_trait]
impl ActiveObject for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    async fn serve(&self, call: Call, _ctx: &BodyContext) -> Result<Outcome, ServiceError> {
        match call.name() {
            "block" => {
                self.release.notified().await;
                Outcome::value("released")
            }
            "status" => Outcome::value("ok"),
            _ => Err(call.unknown()),
        }
    }
}

/// Forwards `relay` to a gate's `block` and answers `ping` itself.
#[derive(Debug, Default)]
pub struct Relay;

#[async_trait]
impl ActiveObject for Relay {
    fn name(&self) -> &str {
        "relay"
    }

    async fn serve(&self, call: Call, ctx: &BodyContext) -> Result<Outcome, ServiceError> {
        match call.name() {
            "relay" => {
                let target: BodyId = call.args()?;
                let reply = ctx.proxy(target)?.call("block", Value::Null).await?;
                Ok(Outcome::Forward(reply))
            }
            "ping" => Outcome::value("pong"),
            _ => Err(call.unknown()),
        }
    }
}
