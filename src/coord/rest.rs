// src/coord/rest.rs
//! Networked coordination backend speaking a Redis-over-REST command
//! endpoint (single JSON command per POST, bearer auth). Pub/sub is an
//! append-only list polled by subscribers, since plain REST has no push
//! channel.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::CoordinationUnavailable;

use super::{Coordination, Subscription};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const CHANNEL_TTL_SECS: u64 = 600;

pub struct RestCoordination {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestCoordination {
    pub fn new(base_url: String, token: String) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("licita-radar/0.1")
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
        }
    }

    async fn command(&self, cmd: Value) -> Result<Value, CoordinationUnavailable> {
        let resp = self
            .http
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(&cmd)
            .send()
            .await
            .map_err(|e| CoordinationUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoordinationUnavailable(format!(
                "coordination endpoint returned {}",
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| CoordinationUnavailable(e.to_string()))?;
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    fn channel_key(channel: &str) -> String {
        format!("chan:{channel}")
    }
}

#[async_trait::async_trait]
impl Coordination for RestCoordination {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationUnavailable> {
        match self.command(json!(["GET", key])).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinationUnavailable> {
        let cmd = match ttl {
            Some(d) => json!(["SET", key, value, "EX", d.as_secs().max(1)]),
            None => json!(["SET", key, value]),
        };
        self.command(cmd).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoordinationUnavailable> {
        self.command(json!(["DEL", key])).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, CoordinationUnavailable> {
        match self.command(json!(["INCR", key])).await? {
            Value::Number(n) => Ok(n.as_i64().unwrap_or(0)),
            Value::String(s) => Ok(s.parse().unwrap_or(0)),
            other => Err(CoordinationUnavailable(format!(
                "unexpected INCR reply: {other}"
            ))),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CoordinationUnavailable> {
        self.command(json!(["EXPIRE", key, ttl.as_secs().max(1)]))
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        channel: &str,
        payload: &str,
    ) -> Result<(), CoordinationUnavailable> {
        let key = Self::channel_key(channel);
        self.command(json!(["RPUSH", &key, payload])).await?;
        // Cleanup is TTL-only. Trimming the list would shift the absolute
        // indices that subscriber cursors rely on and make pollers re-read
        // or skip events.
        self.command(json!(["EXPIRE", key, CHANNEL_TTL_SECS])).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<Subscription, CoordinationUnavailable> {
        let key = Self::channel_key(channel);

        // Start after the current tail: only future events flow here; the
        // progress layer replays a snapshot for catch-up.
        let mut cursor = match self.command(json!(["LLEN", &key])).await? {
            Value::Number(n) => n.as_i64().unwrap_or(0),
            _ => 0,
        };

        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let token = self.token.clone();
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let poller = RestCoordination {
                http,
                base_url,
                token,
            };
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                let batch = match poller.command(json!(["LRANGE", &key, cursor, -1])).await {
                    Ok(Value::Array(items)) => items,
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        tracing::warn!(error = %e, channel = %key, "pub/sub poll failed");
                        continue;
                    }
                };
                for item in batch {
                    if let Value::String(payload) = item {
                        cursor += 1;
                        if tx.send(payload).await.is_err() {
                            return; // subscriber dropped
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(rx))
    }

    fn backend_name(&self) -> &'static str {
        "rest"
    }
}
