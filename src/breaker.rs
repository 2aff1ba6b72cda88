// src/breaker.rs
//! Per-source circuit breaker with state shared through the coordination
//! service, so failures seen by one worker process protect all of them.
//!
//! CLOSED → OPEN after `failure_threshold` consecutive failures;
//! OPEN → HALF_OPEN after `cooldown_secs`; HALF_OPEN admits exactly one
//! trial call across all processes (claimed by an atomic increment), which
//! closes the breaker on success or re-opens it on failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use metrics::counter;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::coord::SharedCoordination;
use crate::error::{CircuitOpen, GuardedCallError, SourceFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Process-local mirror used when the coordination service is unreachable.
/// Kept in sync on every observation so degraded mode starts from recent
/// knowledge instead of a blank slate.
#[derive(Debug, Default, Clone)]
struct LocalMirror {
    failures: u32,
    opened_at_ms: Option<i64>,
}

pub struct CircuitBreaker {
    coord: SharedCoordination,
    cfg: BreakerConfig,
    mirror: Mutex<HashMap<String, LocalMirror>>,
}

impl CircuitBreaker {
    pub fn new(coord: SharedCoordination, cfg: BreakerConfig) -> Self {
        Self {
            coord,
            cfg,
            mirror: Mutex::new(HashMap::new()),
        }
    }

    fn key_failures(source: &str) -> String {
        format!("cb:{source}:failures")
    }
    fn key_opened(source: &str) -> String {
        format!("cb:{source}:opened_at")
    }
    fn key_trial(source: &str, opened_at_ms: i64) -> String {
        format!("cb:{source}:trial:{opened_at_ms}")
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn cooldown_ms(&self) -> i64 {
        (self.cfg.cooldown_secs as i64).saturating_mul(1000)
    }

    fn mirror_get(&self, source: &str) -> LocalMirror {
        self.mirror
            .lock()
            .expect("breaker mirror poisoned")
            .get(source)
            .cloned()
            .unwrap_or_default()
    }

    fn mirror_update(&self, source: &str, f: impl FnOnce(&mut LocalMirror)) {
        let mut guard = self.mirror.lock().expect("breaker mirror poisoned");
        f(guard.entry(source.to_string()).or_default());
    }

    /// When the breaker opened, if it is open. Falls back to the local
    /// mirror when coordination is unreachable.
    async fn opened_at_ms(&self, source: &str) -> Option<i64> {
        match self.coord.get(&Self::key_opened(source)).await {
            Ok(v) => {
                let opened = v.and_then(|s| s.parse::<i64>().ok());
                self.mirror_update(source, |m| m.opened_at_ms = opened);
                opened
            }
            Err(e) => {
                warn!(source, error = %e, "breaker state read degraded to local mirror");
                self.mirror_get(source).opened_at_ms
            }
        }
    }

    /// Current state as seen by this process. Read-only; used by the
    /// aggregator to skip degraded sources without attempting a call.
    pub async fn state(&self, source: &str) -> BreakerState {
        match self.opened_at_ms(source).await {
            None => BreakerState::Closed,
            Some(opened) => {
                if Self::now_ms() - opened < self.cooldown_ms() {
                    BreakerState::Open
                } else {
                    BreakerState::HalfOpen
                }
            }
        }
    }

    /// Run `f` under the breaker. Returns `CircuitOpen` without invoking it
    /// when the source is open (or another process holds the half-open
    /// trial). Counter updates reflect calls actually made, so a cancelled
    /// caller that never reaches this point leaves the state untouched.
    pub async fn call<T, F, Fut>(&self, source: &str, f: F) -> Result<T, GuardedCallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SourceFailure>>,
    {
        if let Some(opened) = self.opened_at_ms(source).await {
            let elapsed = Self::now_ms() - opened;
            if elapsed < self.cooldown_ms() {
                counter!("breaker_short_circuits_total", "source" => source.to_string())
                    .increment(1);
                return Err(CircuitOpen {
                    source: source.to_string(),
                }
                .into());
            }
            // Cooldown elapsed: claim the single half-open trial. The first
            // increment across all processes wins; everyone else stays open.
            if !self.claim_trial(source, opened).await {
                counter!("breaker_short_circuits_total", "source" => source.to_string())
                    .increment(1);
                return Err(CircuitOpen {
                    source: source.to_string(),
                }
                .into());
            }
        }

        match f().await {
            Ok(out) => {
                self.record_success(source).await;
                Ok(out)
            }
            Err(failure) => {
                self.record_failure(source).await;
                Err(failure.into())
            }
        }
    }

    async fn claim_trial(&self, source: &str, opened_at_ms: i64) -> bool {
        let key = Self::key_trial(source, opened_at_ms);
        match self.coord.incr(&key).await {
            Ok(n) => {
                let _ = self
                    .coord
                    .expire(&key, Duration::from_secs(self.cfg.cooldown_secs.max(1)))
                    .await;
                n == 1
            }
            Err(e) => {
                warn!(source, error = %e, "trial claim degraded; allowing local trial");
                true
            }
        }
    }

    async fn record_success(&self, source: &str) {
        let was_open = self.mirror_get(source).opened_at_ms.is_some();
        self.mirror_update(source, |m| {
            m.failures = 0;
            m.opened_at_ms = None;
        });
        let _ = self.coord.delete(&Self::key_failures(source)).await;
        let _ = self.coord.delete(&Self::key_opened(source)).await;
        if was_open {
            info!(source, "circuit closed after successful trial");
            counter!("breaker_transitions_total", "source" => source.to_string(), "to" => "closed")
                .increment(1);
        }
    }

    async fn record_failure(&self, source: &str) {
        let failures = match self.coord.incr(&Self::key_failures(source)).await {
            Ok(n) => {
                self.mirror_update(source, |m| m.failures = n.max(0) as u32);
                n.max(0) as u32
            }
            Err(e) => {
                warn!(source, error = %e, "failure count degraded to local mirror");
                let mut local = 0;
                self.mirror_update(source, |m| {
                    m.failures += 1;
                    local = m.failures;
                });
                local
            }
        };

        let reopening = self.mirror_get(source).opened_at_ms.is_some();
        if failures >= self.cfg.failure_threshold || reopening {
            let now = Self::now_ms();
            self.mirror_update(source, |m| m.opened_at_ms = Some(now));
            let _ = self
                .coord
                .set(&Self::key_opened(source), &now.to_string(), None)
                .await;
            warn!(source, failures, "circuit opened");
            counter!("breaker_transitions_total", "source" => source.to_string(), "to" => "open")
                .increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::LocalCoordination;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            Arc::new(LocalCoordination::new()),
            BreakerConfig {
                failure_threshold: threshold,
                cooldown_secs,
            },
        )
    }

    fn fail(source: &str) -> SourceFailure {
        SourceFailure::new(source, crate::error::SourceFailureKind::Network)
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures_and_short_circuits() {
        let cb = breaker(3, 3600);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let res: Result<(), _> = cb
                .call("pncp", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(fail("pncp"))
                })
                .await;
            assert!(matches!(res, Err(GuardedCallError::Source(_))));
        }
        assert_eq!(cb.state("pncp").await, BreakerState::Open);

        // Within cooldown: adapter must not be invoked.
        let calls2 = calls.clone();
        let res: Result<(), _> = cb
            .call("pncp", || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(GuardedCallError::Open(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn half_open_allows_exactly_one_trial_then_closes_on_success() {
        let cb = breaker(1, 0); // cooldown 0: immediately half-open
        let res: Result<(), _> = cb.call("src", || async { Err(fail("src")) }).await;
        assert!(res.is_err());
        assert_eq!(cb.state("src").await, BreakerState::HalfOpen);

        // First caller claims the trial and succeeds -> closed.
        let ok: Result<u8, _> = cb.call("src", || async { Ok(7u8) }).await;
        assert_eq!(ok.unwrap(), 7);
        assert_eq!(cb.state("src").await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn failed_trial_reopens() {
        let cb = breaker(2, 0);
        for _ in 0..2 {
            let _: Result<(), _> = cb.call("src", || async { Err(fail("src")) }).await;
        }
        // Half-open trial fails -> open again with a fresh opened_at.
        let res: Result<(), _> = cb.call("src", || async { Err(fail("src")) }).await;
        assert!(matches!(res, Err(GuardedCallError::Source(_))));
        let state = cb.state("src").await;
        assert!(matches!(state, BreakerState::Open | BreakerState::HalfOpen));
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let cb = breaker(3, 3600);
        for _ in 0..2 {
            let _: Result<(), _> = cb.call("src", || async { Err(fail("src")) }).await;
        }
        let _: Result<(), _> = cb.call("src", || async { Ok(()) }).await;
        // Two more failures must not open (streak was reset).
        for _ in 0..2 {
            let _: Result<(), _> = cb.call("src", || async { Err(fail("src")) }).await;
        }
        assert_eq!(cb.state("src").await, BreakerState::Closed);
    }
}
