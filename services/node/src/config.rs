//! Configuration for a ProActive node.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use proactive_id::{JobId, NodeUrl};
use proactive_security::{EntityKeys, SessionLimits};

/// Node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the node hosting bodies in this process.
    pub node_name: String,

    /// Host part of node URLs.
    pub host: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Job tag inherited by every body created by this runtime.
    pub job_id: JobId,

    /// Bounded inbox size; senders wait when it is full.
    pub mailbox_capacity: usize,

    /// Bounded size of a body's fault-tolerance channel.
    pub ft_mailbox_capacity: usize,

    /// How far past a missing FT sequence number messages are buffered.
    pub ft_reorder_window: u64,

    /// How long a body may stay suspended before new senders are refused.
    pub max_suspension: Duration,

    /// Upper bound on a whole security handshake.
    pub handshake_timeout: Duration,

    /// Thresholds after which a security session must be renegotiated.
    pub session_limits: SessionLimits,

    /// Base64 ed25519 seed for this runtime's entity key.
    pub entity_key: Option<String>,

    /// File holding the base64 seed, used when `entity_key` is unset.
    pub entity_key_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let parsed = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|s| {
                    s.trim()
                        .parse::<u64>()
                        .with_context(|| format!("invalid {key}: {s:?}"))
                })
                .transpose()
        };

        let node_name = lookup("PA_NODE_NAME").unwrap_or(defaults.node_name);
        let host = lookup("PA_HOST").unwrap_or(defaults.host);
        // Fail early rather than on the first node creation
        NodeUrl::new(&host, &node_name).context("invalid PA_HOST / PA_NODE_NAME")?;

        let job_id = lookup("PA_JOB_ID")
            .map(|s| s.parse::<JobId>().with_context(|| format!("invalid PA_JOB_ID: {s:?}")))
            .transpose()?
            .unwrap_or(defaults.job_id);

        let session_limits = SessionLimits {
            max_messages: parsed("PA_SESSION_MAX_MESSAGES")?
                .unwrap_or(defaults.session_limits.max_messages),
            max_lifetime: parsed("PA_SESSION_MAX_LIFETIME_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_limits.max_lifetime),
        };

        Ok(Self {
            node_name,
            host,
            log_level: lookup("PA_LOG_LEVEL").unwrap_or(defaults.log_level),
            job_id,
            mailbox_capacity: parsed("PA_MAILBOX_CAPACITY")?
                .map(|n| n.max(1) as usize)
                .unwrap_or(defaults.mailbox_capacity),
            ft_mailbox_capacity: parsed("PA_FT_MAILBOX_CAPACITY")?
                .map(|n| n.max(1) as usize)
                .unwrap_or(defaults.ft_mailbox_capacity),
            ft_reorder_window: parsed("PA_FT_REORDER_WINDOW")?
                .map(|n| n.max(1))
                .unwrap_or(defaults.ft_reorder_window),
            max_suspension: parsed("PA_MAX_SUSPENSION_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_suspension),
            handshake_timeout: parsed("PA_HANDSHAKE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.handshake_timeout),
            session_limits,
            entity_key: lookup("PA_ENTITY_KEY").filter(|s| !s.trim().is_empty()),
            entity_key_file: lookup("PA_ENTITY_KEY_FILE").map(PathBuf::from),
        })
    }

    /// URL of the node named in this configuration.
    pub fn node_url(&self) -> Result<NodeUrl> {
        Ok(NodeUrl::new(&self.host, &self.node_name)?)
    }

    /// The configured entity key, or a fresh one if none is configured.
    pub fn entity_keys(&self) -> Result<EntityKeys> {
        if let Some(encoded) = &self.entity_key {
            return Ok(EntityKeys::from_base64(encoded.trim())?);
        }
        if let Some(path) = &self.entity_key_file {
            let encoded = std::fs::read_to_string(path)
                .with_context(|| format!("reading entity key from {}", path.display()))?;
            return Ok(EntityKeys::from_base64(encoded.trim())?);
        }
        Ok(EntityKeys::generate())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "node-1".to_string(),
            host: "localhost".to_string(),
            log_level: "info".to_string(),
            job_id: JobId::new(),
            mailbox_capacity: 1024,
            ft_mailbox_capacity: 256,
            ft_reorder_window: 1024,
            max_suspension: Duration::from_millis(5000),
            handshake_timeout: Duration::from_millis(10_000),
            session_limits: SessionLimits::default(),
            entity_key: None,
            entity_key_file: None,
        }
    }
}
