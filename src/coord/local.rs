// src/coord/local.rs
//! In-process coordination backend: a TTL'd key/value map plus broadcast
//! pub/sub. Serves single-process deployments and degraded mode; infallible
//! by construction.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};

use crate::error::CoordinationUnavailable;

use super::{Coordination, Subscription};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

pub struct LocalCoordination {
    store: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalCoordination {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        let mut chans = self.channels.lock().expect("coord channels poisoned");
        chans
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for LocalCoordination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Coordination for LocalCoordination {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationUnavailable> {
        let now = Instant::now();
        let mut store = self.store.lock().expect("coord store poisoned");
        if let Some(entry) = store.get(key) {
            if entry.is_expired(now) {
                store.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinationUnavailable> {
        let mut store = self.store.lock().expect("coord store poisoned");
        store.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoordinationUnavailable> {
        let mut store = self.store.lock().expect("coord store poisoned");
        store.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, CoordinationUnavailable> {
        let now = Instant::now();
        let mut store = self.store.lock().expect("coord store poisoned");
        let (current, expires_at) = match store.get(key) {
            Some(e) if !e.is_expired(now) => {
                (e.value.parse::<i64>().unwrap_or(0), e.expires_at)
            }
            _ => (0, None),
        };
        let next = current + 1;
        store.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CoordinationUnavailable> {
        let mut store = self.store.lock().expect("coord store poisoned");
        if let Some(entry) = store.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn publish(
        &self,
        channel: &str,
        payload: &str,
    ) -> Result<(), CoordinationUnavailable> {
        // Send fails only when there are no subscribers; that is fine.
        let _ = self.sender_for(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<Subscription, CoordinationUnavailable> {
        let mut rx = self.sender_for(channel).subscribe();
        let (tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break; // subscriber dropped
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "local pub/sub subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(out_rx))
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
