// src/coord/mod.rs
//! Cross-process coordination seam. All correctness-critical shared state
//! (breaker status, rate-limit counters, shared cache tier, progress pub/sub)
//! goes through this one trait, with a networked REST backend and a local
//! in-process fallback selected once at startup.

pub mod local;
pub mod rest;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::config::CoordinationConfig;
use crate::error::CoordinationUnavailable;

pub use local::LocalCoordination;
pub use rest::RestCoordination;

/// Live feed of payloads published to one channel. Dropping the subscription
/// stops delivery.
pub struct Subscription {
    rx: tokio::sync::mpsc::Receiver<String>,
}

impl Subscription {
    pub fn new(rx: tokio::sync::mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Next published payload; `None` once the channel is torn down.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn into_inner(self) -> tokio::sync::mpsc::Receiver<String> {
        self.rx
    }
}

/// get/set/increment/expire plus publish/subscribe-by-channel-name, the
/// primitives the external coordination service offers. Every mutation is a
/// single-key atomic operation; no multi-key transactions.
#[async_trait::async_trait]
pub trait Coordination: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationUnavailable>;

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinationUnavailable>;

    async fn delete(&self, key: &str) -> Result<(), CoordinationUnavailable>;

    /// Atomic increment; missing keys start at zero.
    async fn incr(&self, key: &str) -> Result<i64, CoordinationUnavailable>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CoordinationUnavailable>;

    async fn publish(&self, channel: &str, payload: &str)
        -> Result<(), CoordinationUnavailable>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, CoordinationUnavailable>;

    /// Backend tag for logs and the degraded flag.
    fn backend_name(&self) -> &'static str;
}

pub type SharedCoordination = Arc<dyn Coordination>;

/// Build the backend the config names. "local" is also the degraded-mode
/// stand-in a single-process deployment uses.
pub fn from_config(cfg: &CoordinationConfig) -> Result<SharedCoordination> {
    match cfg.backend.as_str() {
        "local" => Ok(Arc::new(LocalCoordination::new())),
        "rest" => {
            let url = cfg
                .url
                .clone()
                .ok_or_else(|| anyhow!("coordination.url required for the rest backend"))?;
            let token = cfg
                .token
                .clone()
                .or_else(|| std::env::var("COORDINATION_TOKEN").ok())
                .unwrap_or_default();
            Ok(Arc::new(RestCoordination::new(url, token)))
        }
        other => Err(anyhow!("unknown coordination backend '{other}'")),
    }
}
