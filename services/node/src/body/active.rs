//! Body creation and the serving loop.

use std::sync::Arc;

use proactive_id::{BodyId, Location, NodeUrl};
use proactive_security::{Entity, EntityKind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::handle::{BodyParts, InboxItem, Lifecycle};
use super::{ActiveObject, BodyContext, BodyHandle, BodyOptions};
use crate::error::BodyError;
use crate::ft::FtMessenger;
use crate::immediate::ImmediateServices;
use crate::remote::{Invokable, RemoteBody};
use crate::runtime::Environment;

/// Creates a body on `node`, registers it, and starts its loop.
///
/// Without an object the body is a half body: it can call and receive
/// replies but has no inbox.
pub(crate) async fn spawn_body(
    env: Arc<Environment>,
    node: &NodeUrl,
    object: Option<Arc<dyn ActiveObject>>,
    options: BodyOptions,
) -> Result<Arc<BodyHandle>, BodyError> {
    let id = BodyId::new();
    let location = Location::initial(node.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let security = match &env.security {
        Some(profile) if !options.without_security => {
            let manager = profile
                .manager_for(id, Arc::clone(&env.sessions))
                .with_entity(Entity::new(EntityKind::Node, node.to_string()));
            Some(
                options
                    .entities
                    .iter()
                    .cloned()
                    .fold(manager, |manager, entity| manager.with_entity(entity)),
            )
        }
        _ => None,
    };

    let ft = options.fault_tolerance.map(|manager| {
        FtMessenger::spawn(
            id,
            manager,
            env.config.ft_mailbox_capacity,
            env.config.ft_reorder_window,
            shutdown_tx.subscribe(),
        )
    });

    let immediate = ImmediateServices::new();
    for key in &options.immediate_services {
        match &key.params {
            Some(params) => immediate.set_with_params(&key.name, params.clone()),
            None => immediate.set(&key.name),
        }
    }

    let (inbox_tx, inbox_rx) = match &object {
        Some(_) => {
            let (tx, rx) = mpsc::channel(env.config.mailbox_capacity.max(1));
            (Some(tx), Some(rx))
        }
        None => (None, None),
    };

    let body = BodyHandle::new(BodyParts {
        id,
        env: Arc::clone(&env),
        location: location.clone(),
        object: object.clone(),
        inbox: inbox_tx,
        shutdown: shutdown_tx,
        security,
        ft,
        immediate,
        automatic_continuation: options.automatic_continuation,
    });

    let remote: Arc<dyn RemoteBody> = body.clone();
    env.transport.adopt(node, id, remote).await?;
    env.registry.register(id, location.clone());

    if let (Some(object), Some(inbox)) = (object, inbox_rx) {
        info!(
            body_id = %id,
            job_id = %body.job_id(),
            object = object.name(),
            location = %location,
            secured = body.security().is_some(),
            "body created"
        );
        tokio::spawn(run_body_loop(Arc::clone(&body), object, inbox, shutdown_rx));
    } else {
        info!(body_id = %id, location = %location, "half body created");
    }

    Ok(body)
}

async fn run_body_loop(
    body: Arc<BodyHandle>,
    object: Arc<dyn ActiveObject>,
    mut inbox: mpsc::Receiver<InboxItem>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ctx = BodyContext::new(Arc::clone(&body));
    if let Err(e) = object.on_activate(&ctx).await {
        warn!(body_id = %body.id(), error = %e, "activation failed, terminating");
        let _ = body.terminate().await;
    }

    let mut lifecycle = body.subscribe_lifecycle();
    let mut served = 0u64;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let current = *lifecycle.borrow_and_update();
        match current {
            Lifecycle::Terminated => break,
            Lifecycle::Suspended { .. } => {
                debug!(body_id = %body.id(), "body suspended, serving paused");
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }

                    changed = lifecycle.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }
            Lifecycle::Active => {}
        }

        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            item = inbox.recv() => {
                let Some(item) = item else {
                    break;
                };
                match item {
                    InboxItem::Request(delivery) => {
                        body.serve(&object, delivery).await;
                        served += 1;
                    }
                    InboxItem::Migrate { to, done } => {
                        let _ = done.send(body.relocate(to).await);
                    }
                }
            }
        }
    }

    inbox.close();
    let mut dropped = 0u64;
    while let Ok(item) = inbox.try_recv() {
        match item {
            InboxItem::Request(delivery) => {
                body.refuse(delivery).await;
                dropped += 1;
            }
            InboxItem::Migrate { done, .. } => {
                let _ = done.send(Err(BodyError::Terminated(body.id())));
            }
        }
    }

    object.on_terminate(&ctx).await;
    info!(body_id = %body.id(), served, dropped, "body loop stopped");
}
