// src/ratelimit.rs
//! Shared fixed-window rate limiter, keyed by source name. Budgets live in
//! the coordination service so all worker processes draw from one pool; if
//! that service is unreachable the limiter degrades to a process-local
//! window at half the shared budget rather than failing the search.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use metrics::counter;
use tracing::warn;

use crate::config::RateLimitConfig;
use crate::coord::SharedCoordination;
use crate::error::RateLimitExceeded;

pub struct RateLimiter {
    coord: SharedCoordination,
    cfg: RateLimitConfig,
    /// source -> (window index, count) for degraded local mode.
    local: Mutex<HashMap<String, (u64, u32)>>,
}

impl RateLimiter {
    pub fn new(coord: SharedCoordination, cfg: RateLimitConfig) -> Self {
        Self {
            coord,
            cfg,
            local: Mutex::new(HashMap::new()),
        }
    }

    fn now_secs() -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }

    fn window_index(&self, now_secs: u64) -> u64 {
        now_secs / self.cfg.window_secs.max(1)
    }

    /// Millis until the current window rolls over.
    fn ms_to_rollover(&self, now_secs: u64) -> u64 {
        let w = self.cfg.window_secs.max(1);
        (w - (now_secs % w)) * 1000
    }

    /// Try to take one token right now. `Ok(true)` granted, `Ok(false)`
    /// window exhausted, `Err` coordination unreachable.
    async fn try_take_shared(&self, source: &str) -> Result<bool, ()> {
        let window = self.window_index(Self::now_secs());
        let key = format!("rl:{source}:{window}");
        match self.coord.incr(&key).await {
            Ok(n) => {
                if n == 1 {
                    // First hit in this window: bound the key's lifetime.
                    let _ = self
                        .coord
                        .expire(&key, Duration::from_secs(self.cfg.window_secs * 2))
                        .await;
                }
                Ok(n <= self.cfg.requests_per_window as i64)
            }
            Err(e) => {
                warn!(source, error = %e, "rate limiter degraded to local window");
                Err(())
            }
        }
    }

    /// Conservative local fallback: half the shared budget, same window.
    fn try_take_local(&self, source: &str) -> bool {
        let budget = (self.cfg.requests_per_window / 2).max(1);
        let window = self.window_index(Self::now_secs());
        let mut guard = self.local.lock().expect("ratelimit local poisoned");
        let entry = guard.entry(source.to_string()).or_insert((window, 0));
        if entry.0 != window {
            *entry = (window, 0);
        }
        if entry.1 < budget {
            entry.1 += 1;
            true
        } else {
            false
        }
    }

    /// Acquire one token for `source`, suspending up to `max_wait_ms`.
    /// On timeout returns `RateLimitExceeded`, which the caller must report
    /// through the progress channel rather than swallow.
    pub async fn acquire(&self, source: &str) -> Result<(), RateLimitExceeded> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.cfg.max_wait_ms);
        let mut waited_any = false;

        loop {
            let granted = match self.try_take_shared(source).await {
                Ok(g) => g,
                Err(()) => self.try_take_local(source),
            };
            if granted {
                if waited_any {
                    counter!("rate_limit_waits_total", "source" => source.to_string())
                        .increment(1);
                }
                return Ok(());
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                counter!("rate_limit_exceeded_total", "source" => source.to_string())
                    .increment(1);
                return Err(RateLimitExceeded {
                    source: source.to_string(),
                    waited_ms: self.cfg.max_wait_ms,
                });
            }

            waited_any = true;
            let rollover = Duration::from_millis(self.ms_to_rollover(Self::now_secs()).min(200));
            let remaining = deadline - now;
            tokio::time::sleep(rollover.min(remaining)).await;
        }
    }
}
