//! ProActive node
//!
//! Starts a runtime with two nodes, builds a distributed binary tree of
//! active objects, migrates its root, and keeps serving until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use proactive_node::config::Config;
use proactive_node::remote::Relocatable;
use proactive_node::tree::BinaryTree;
use proactive_node::{BodyOptions, ProActiveRuntime};
use proactive_security::{
    CertificateAuthority, Communication, PolicyServer, SecurityProfile, TrustStore,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing; RUST_LOG wins over PA_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting ProActive node");
    info!(
        node_name = %config.node_name,
        host = %config.host,
        job_id = %config.job_id,
        mailbox_capacity = config.mailbox_capacity,
        max_suspension_ms = config.max_suspension.as_millis() as u64,
        "Configuration loaded"
    );

    // Security: one root authority, every body requires a session
    let keys = config.entity_keys()?;
    let ca = CertificateAuthority::new_root("proactive-root", chrono::Duration::days(1));
    let certificate = ca.issue(config.node_name.clone(), keys.public_key(), chrono::Duration::hours(12));
    let trust = TrustStore::new().with_anchor(ca.certificate())?;
    let profile = SecurityProfile::new(keys, certificate, trust)?
        .with_policies(PolicyServer::new(Communication::secured()));

    let runtime = Arc::new(ProActiveRuntime::with_security(config.clone(), profile));
    let home = runtime.create_node(&config.node_name)?;
    let away = runtime.create_node(&format!("{}-peer", config.node_name))?;

    let main_body = runtime.new_half_body(home.url()).await?;
    let root = runtime
        .new_active_with(
            home.url(),
            Arc::new(BinaryTree::new()),
            BodyOptions::new().with_automatic_continuation(),
        )
        .await?;
    let tree = runtime.lookup(&main_body, root.id())?;

    for (key, value) in [(5, "five"), (2, "two"), (8, "eight"), (7, "seven")] {
        tree.call_sync("put", (key, value))
            .await
            .with_context(|| format!("put {key}"))?;
    }
    let seven: Option<String> = tree.call_as("get", 7).await?;
    info!(key = 7, value = ?seven, location = %root.location(), "tree lookup");

    let moved = tree.remote().await?.migrate_to(away.url().clone()).await?;
    info!(location = %moved, "tree root migrated");

    let two: Option<String> = tree.call_as("get", 2).await?;
    info!(key = 2, value = ?two, location = %tree.location(), "tree lookup after migration");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("Received shutdown signal");

    runtime.shutdown().await;

    // Give body loops time to drain
    info!("Waiting for bodies to stop...");
    tokio::time::sleep(Duration::from_millis(200)).await;
    if !home.is_empty() || !away.is_empty() {
        warn!(home = home.len(), away = away.len(), "bodies still hosted at exit");
    }

    info!("ProActive node shutdown complete");
    Ok(())
}
