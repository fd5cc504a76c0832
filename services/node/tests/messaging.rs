//! Request/reply delivery, futures, immediate services and continuations.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Cluster, ConnectCounter, Gate, Recorder, Relay};
use proactive_id::SequenceNumber;
use proactive_node::ft::{CheckpointManager, FtMessage, FtMessageKind};
use proactive_node::immediate::ServiceKey;
use proactive_node::message::{CorrelationKey, Payload, Reply, Request};
use proactive_node::remote::{ContinuationControl, FaultTolerant, ImmediateServiceControl, Invokable};
use proactive_node::{
    Acceptance, BodyError, BodyOptions, CommunicationFailure, ErrorKind, FutureState,
    MethodSignature,
};
use serde_json::{json, Value};
use tokio::sync::Notify;

#[tokio::test]
async fn test_call_returns_before_the_reply() {
    let cluster = Cluster::new();
    let release = Arc::new(Notify::new());
    let gate = cluster.spawn(Gate::new(release.clone())).await;
    let caller = cluster.caller().await;
    let proxy = caller.proxy(gate.id()).unwrap();

    let future = proxy.call("block", ()).await.unwrap();
    assert_eq!(future.state(), FutureState::Pending);
    assert_eq!(caller.futures().pending(), 1);

    release.notify_one();
    assert_eq!(future.get().await.unwrap(), json!("released"));
    assert_eq!(future.state(), FutureState::Resolved);
    assert_eq!(caller.futures().pending(), 0);
}

#[tokio::test]
async fn test_application_failure_settles_the_future_once() {
    let cluster = Cluster::new();
    let recorder = cluster.spawn(Recorder::default()).await;
    let caller = cluster.caller().await;
    let mut events = caller.nfe().subscribe();
    let proxy = caller.proxy(recorder.id()).unwrap();

    let future = proxy.call("fail", ()).await.unwrap();
    let err = future.get().await.unwrap_err();
    match &err {
        BodyError::Remote(fault) => {
            assert_eq!(fault.kind, ErrorKind::Application);
            assert_eq!(fault.method, "fail()");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(future.state(), FutureState::Failed);
    assert_eq!(future.try_get(), Some(Err(err)));

    // application failures are not broadcast
    assert!(events.try_recv().is_none());

    let unknown = proxy.call("nope", ()).await.unwrap().get().await.unwrap_err();
    assert_eq!(unknown.kind(), ErrorKind::Application);
}

#[tokio::test]
async fn test_redelivered_request_is_served_once() {
    let cluster = Cluster::new();
    let recorder = cluster.spawn(Recorder::default()).await;
    let caller = cluster.caller().await;

    let sequence = SequenceNumber::new(900);
    let future = caller
        .futures()
        .register(CorrelationKey::new(caller.id(), sequence));
    let request = Request {
        target: recorder.id(),
        method: MethodSignature::new("record"),
        payload: Payload::Plain(json!(42)),
        sender: caller.id(),
        sequence,
    };

    assert_eq!(
        recorder.receive_request(request.clone()).await.unwrap(),
        Acceptance::Queued
    );
    assert_eq!(
        recorder.receive_request(request).await.unwrap(),
        Acceptance::Duplicate
    );

    assert_eq!(future.get().await.unwrap(), json!(42));
    let ids: Vec<i64> = caller
        .proxy(recorder.id())
        .unwrap()
        .call_as("ids", ())
        .await
        .unwrap();
    assert_eq!(ids, vec![42]);
}

#[tokio::test]
async fn test_late_reply_does_not_change_a_settled_future() {
    let cluster = Cluster::new();
    let recorder = cluster.spawn(Recorder::default()).await;
    let caller = cluster.caller().await;
    let proxy = caller.proxy(recorder.id()).unwrap();

    let future = proxy.call("record", 1).await.unwrap();
    assert_eq!(future.get().await.unwrap(), json!(1));

    let replay = Reply {
        target: caller.id(),
        responder: recorder.id(),
        sequence: SequenceNumber::FIRST,
        outcome: Ok(Payload::Plain(json!(99))),
    };
    assert_eq!(
        caller.receive_reply(replay).await.unwrap(),
        Acceptance::Ignored
    );
    assert_eq!(future.try_get(), Some(Ok(json!(1))));
}

#[tokio::test]
async fn test_immediate_service_runs_while_the_loop_is_busy() {
    let cluster = Cluster::new();
    let release = Arc::new(Notify::new());
    let gate = cluster
        .runtime
        .new_active_with(
            &cluster.home,
            Arc::new(Gate::new(release.clone())),
            BodyOptions::new().with_immediate_service(ServiceKey::any_overload("status")),
        )
        .await
        .unwrap();
    let caller = cluster.caller().await;
    let proxy = caller.proxy(gate.id()).unwrap();

    let blocked = proxy.call("block", ()).await.unwrap();
    let status = proxy.call("status", ()).await.unwrap();
    assert_eq!(
        status.get_timeout(Duration::from_secs(1)).await.unwrap(),
        json!("ok")
    );
    assert_eq!(blocked.state(), FutureState::Pending);

    release.notify_one();
    assert_eq!(blocked.get().await.unwrap(), json!("released"));
}

#[tokio::test]
async fn test_removed_immediate_service_waits_in_line() {
    let cluster = Cluster::new();
    let release = Arc::new(Notify::new());
    let gate = cluster.spawn(Gate::new(release.clone())).await;
    gate.set_immediate_service("status").await.unwrap();
    gate.remove_immediate_service("status").await.unwrap();
    assert!(gate.immediate_services().is_empty());

    let caller = cluster.caller().await;
    let proxy = caller.proxy(gate.id()).unwrap();
    let blocked = proxy.call("block", ()).await.unwrap();
    let status = proxy.call("status", ()).await.unwrap();

    let err = status
        .get_timeout(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, BodyError::Timeout(_)));

    release.notify_one();
    assert_eq!(blocked.get().await.unwrap(), json!("released"));
    assert_eq!(status.get().await.unwrap(), json!("ok"));
}

#[tokio::test]
async fn test_automatic_continuation_frees_the_forwarding_body() {
    let cluster = Cluster::new();
    let release = Arc::new(Notify::new());
    let gate = cluster.spawn(Gate::new(release.clone())).await;
    let relay = cluster
        .runtime
        .new_active_with(
            &cluster.home,
            Arc::new(Relay),
            BodyOptions::new().with_automatic_continuation(),
        )
        .await
        .unwrap();
    assert!(relay.automatic_continuation());

    let caller = cluster.caller().await;
    let proxy = caller.proxy(relay.id()).unwrap();
    let relayed = proxy.call("relay", gate.id()).await.unwrap();
    let ping = proxy.call("ping", ()).await.unwrap();

    assert_eq!(
        ping.get_timeout(Duration::from_secs(1)).await.unwrap(),
        json!("pong")
    );
    assert_eq!(relayed.state(), FutureState::Pending);

    release.notify_one();
    assert_eq!(relayed.get().await.unwrap(), json!("released"));
}

#[tokio::test]
async fn test_without_continuation_the_forwarding_body_waits() {
    let cluster = Cluster::new();
    let release = Arc::new(Notify::new());
    let gate = cluster.spawn(Gate::new(release.clone())).await;
    let relay = cluster.spawn(Relay).await;
    relay.enable_ac().await.unwrap();
    relay.disable_ac().await.unwrap();
    assert!(!relay.automatic_continuation());

    let caller = cluster.caller().await;
    let proxy = caller.proxy(relay.id()).unwrap();
    let relayed = proxy.call("relay", gate.id()).await.unwrap();
    let ping = proxy.call("ping", ()).await.unwrap();

    let err = ping
        .get_timeout(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, BodyError::Timeout(_)));

    release.notify_one();
    assert_eq!(relayed.get().await.unwrap(), json!("released"));
    assert_eq!(ping.get().await.unwrap(), json!("pong"));
}

#[tokio::test]
async fn test_half_body_refuses_requests() {
    let cluster = Cluster::new();
    let caller = cluster.caller().await;
    let other = cluster.caller().await;

    let err = other
        .proxy(caller.id())
        .unwrap()
        .call("anything", ())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BodyError::Communication(CommunicationFailure::NotActive { body: caller.id() })
    );
    assert_eq!(other.futures().pending(), 0);
}

#[tokio::test]
async fn test_unreachable_target_is_broadcast_to_listeners() {
    let cluster = Cluster::new();
    let recorder = cluster
        .runtime
        .new_active(&cluster.away, Recorder::default())
        .await
        .unwrap();
    let caller = cluster.caller().await;
    let mut events = caller.nfe().subscribe();
    let mut second = caller.nfe().subscribe();

    cluster.runtime.transport().set_reachable(&cluster.away, false);
    let err = caller
        .proxy(recorder.id())
        .unwrap()
        .call("record", 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BodyError::Communication(CommunicationFailure::Unreachable { .. })
    ));

    for subscription in [&mut events, &mut second] {
        let event = subscription.recv().await.unwrap();
        assert_eq!(event.kind, ErrorKind::Communication);
        assert_eq!(event.body, caller.id());
    }

    assert!(caller.nfe().unsubscribe(second.id()));
    cluster.runtime.transport().set_reachable(&cluster.away, true);
    let value: Value = caller
        .proxy(recorder.id())
        .unwrap()
        .call_sync("record", 2)
        .await
        .unwrap();
    assert_eq!(value, json!(2));
}

#[tokio::test]
async fn test_unreachable_target_is_retried_exactly_once() {
    let counter = Arc::new(ConnectCounter::default());
    let cluster = Cluster::counted(counter.clone());
    let recorder = cluster
        .runtime
        .new_active(&cluster.away, Recorder::default())
        .await
        .unwrap();
    let caller = cluster.caller().await;
    let proxy = caller.proxy(recorder.id()).unwrap();

    cluster.runtime.transport().set_reachable(&cluster.away, false);
    let err = proxy.call("record", 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Communication);
    assert_eq!(counter.attempts(recorder.id()), 2);

    let err = proxy.call("record", 2).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Communication);
    assert_eq!(counter.attempts(recorder.id()), 4);
    assert_eq!(caller.futures().pending(), 0);
}

#[tokio::test]
async fn test_abandoned_call_drops_its_reply() {
    let cluster = Cluster::new();
    let release = Arc::new(Notify::new());
    let gate = cluster.spawn(Gate::new(release.clone())).await;
    let caller = cluster.caller().await;
    let proxy = caller.proxy(gate.id()).unwrap();

    let future = proxy.call("block", ()).await.unwrap();
    let key = future.key().unwrap();
    assert_eq!(key.sender, caller.id());

    assert!(proxy.abandon(&future));
    assert!(!proxy.abandon(&future));
    assert_eq!(future.get().await, Err(BodyError::Cancelled));
    assert_eq!(caller.futures().pending(), 0);

    // the gate still serves the request; its reply finds no one waiting
    release.notify_one();
    let status: String = proxy.call_as("status", ()).await.unwrap();
    assert_eq!(status, "ok");
    assert_eq!(future.get().await, Err(BodyError::Cancelled));
}

#[tokio::test]
async fn test_ft_messages_bypass_a_blocked_inbox() {
    let cluster = Cluster::new();
    let manager = CheckpointManager::new();
    let release = Arc::new(Notify::new());
    let gate = cluster
        .runtime
        .new_active_with(
            &cluster.home,
            Arc::new(Gate::new(release.clone())),
            BodyOptions::new().with_fault_tolerance(manager.clone()),
        )
        .await
        .unwrap();
    let caller = cluster.caller().await;
    let blocked = caller
        .proxy(gate.id())
        .unwrap()
        .call("block", ())
        .await
        .unwrap();

    let checkpoint = FtMessage::new(1, FtMessageKind::Checkpoint { index: 3 });
    assert_eq!(
        gate.receive_ft_message(checkpoint.clone()).await.unwrap(),
        Acceptance::Queued
    );
    assert_eq!(
        gate.receive_ft_message(checkpoint).await.unwrap(),
        Acceptance::Duplicate
    );
    assert_eq!(manager.snapshot().checkpoints, vec![3]);

    let far = FtMessage::new(5000, FtMessageKind::Heartbeat);
    let err = gate.receive_ft_message(far).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FaultTolerance);
    assert_eq!(manager.snapshot().heartbeats, 0);

    release.notify_one();
    blocked.get().await.unwrap();

    let plain = cluster.spawn(Recorder::default()).await;
    assert_eq!(
        plain
            .receive_ft_message(FtMessage::new(1, FtMessageKind::Heartbeat))
            .await
            .unwrap(),
        Acceptance::Ignored
    );
}
