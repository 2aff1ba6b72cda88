// src/cache.rs
//! Two-tier search cache keyed by the request fingerprint: a fast
//! process-local tier with a short TTL in front of a shared tier in the
//! coordination service, so work done by one worker process benefits all.
//! Shared-tier outages degrade to local-only, flagged to callers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::aggregate::UnavailableSource;
use crate::config::CacheConfig;
use crate::coord::SharedCoordination;
use crate::filter::RejectionBreakdown;
use crate::model::{SearchFingerprint, UnifiedProcurement};

/// The cached value carries the pre-filter counts and breakdown, so the
/// rejection explanation survives cache hits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSearch {
    pub results: Vec<UnifiedProcurement>,
    pub prefilter_total: usize,
    pub breakdown: RejectionBreakdown,
    pub unavailable: Vec<UnavailableSource>,
    pub computed_at: DateTime<Utc>,
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    LocalHit,
    SharedHit,
    Miss,
    /// Force-refresh: the entry was overwritten without being read.
    Bypass,
}

struct LocalEntry {
    value: CachedSearch,
    inserted_at: Instant,
}

pub struct SearchCache {
    coord: SharedCoordination,
    cfg: CacheConfig,
    local: Mutex<HashMap<String, LocalEntry>>,
}

/// Outcome of a cache read: the hit (if any) and whether the shared tier
/// answered. `shared_ok == false` means local-only degraded mode.
pub struct CacheRead {
    pub hit: Option<(CachedSearch, CacheStatus)>,
    pub shared_ok: bool,
}

impl SearchCache {
    pub fn new(coord: SharedCoordination, cfg: CacheConfig) -> Self {
        Self {
            coord,
            cfg,
            local: Mutex::new(HashMap::new()),
        }
    }

    fn shared_key(fp: &SearchFingerprint) -> String {
        format!("cache:search:{fp}")
    }

    fn local_get(&self, fp: &SearchFingerprint) -> Option<CachedSearch> {
        let ttl = Duration::from_secs(self.cfg.local_ttl_secs);
        let mut local = self.local.lock().expect("cache local tier poisoned");
        match local.get(&fp.0) {
            Some(entry) if entry.inserted_at.elapsed() < ttl => Some(entry.value.clone()),
            Some(_) => {
                local.remove(&fp.0);
                None
            }
            None => None,
        }
    }

    fn local_put(&self, fp: &SearchFingerprint, value: CachedSearch) {
        let mut local = self.local.lock().expect("cache local tier poisoned");
        local.insert(
            fp.0.clone(),
            LocalEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Read path: local tier, then shared tier (populating local on a hit).
    pub async fn read(&self, fp: &SearchFingerprint) -> CacheRead {
        if let Some(value) = self.local_get(fp) {
            counter!("search_cache_hits_total", "tier" => "local").increment(1);
            return CacheRead {
                hit: Some((value, CacheStatus::LocalHit)),
                shared_ok: true,
            };
        }

        match self.coord.get(&Self::shared_key(fp)).await {
            Ok(Some(json)) => match serde_json::from_str::<CachedSearch>(&json) {
                Ok(value) => {
                    counter!("search_cache_hits_total", "tier" => "shared").increment(1);
                    self.local_put(fp, value.clone());
                    CacheRead {
                        hit: Some((value, CacheStatus::SharedHit)),
                        shared_ok: true,
                    }
                }
                Err(e) => {
                    // Unreadable entries (e.g. written by an older build)
                    // count as a miss and get overwritten.
                    warn!(fingerprint = %fp, error = %e, "discarding unreadable shared cache entry");
                    CacheRead {
                        hit: None,
                        shared_ok: true,
                    }
                }
            },
            Ok(None) => CacheRead {
                hit: None,
                shared_ok: true,
            },
            Err(e) => {
                warn!(error = %e, "shared cache tier unreachable; local-only mode");
                CacheRead {
                    hit: None,
                    shared_ok: false,
                }
            }
        }
    }

    /// Write both tiers. Returns false when the shared tier did not take
    /// the write (degraded mode). A force-refresh caller uses this without
    /// reading first, overwriting whatever was there.
    pub async fn write(&self, fp: &SearchFingerprint, value: &CachedSearch) -> bool {
        self.local_put(fp, value.clone());

        let json = match serde_json::to_string(value) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "cache entry not serializable; shared tier skipped");
                return false;
            }
        };
        match self
            .coord
            .set(
                &Self::shared_key(fp),
                &json,
                Some(Duration::from_secs(self.cfg.shared_ttl_secs)),
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "shared cache write failed; local-only mode");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::LocalCoordination;
    use std::sync::Arc;

    fn fp(tag: &str) -> SearchFingerprint {
        SearchFingerprint(format!("{tag:0>32}"))
    }

    fn entry(total: usize) -> CachedSearch {
        CachedSearch {
            results: Vec::new(),
            prefilter_total: total,
            breakdown: RejectionBreakdown::new(),
            unavailable: Vec::new(),
            computed_at: Utc::now(),
        }
    }

    fn cache_with(coord: SharedCoordination, local_ttl_secs: u64) -> SearchCache {
        SearchCache::new(
            coord,
            CacheConfig {
                local_ttl_secs,
                shared_ttl_secs: 900,
            },
        )
    }

    #[tokio::test]
    async fn miss_then_local_hit() {
        let cache = cache_with(Arc::new(LocalCoordination::new()), 60);
        let key = fp("a");
        assert!(cache.read(&key).await.hit.is_none());

        cache.write(&key, &entry(3)).await;
        let read = cache.read(&key).await;
        let (value, status) = read.hit.expect("hit");
        assert_eq!(status, CacheStatus::LocalHit);
        assert_eq!(value.prefilter_total, 3);
    }

    #[tokio::test]
    async fn shared_hit_populates_local_tier() {
        let coord: SharedCoordination = Arc::new(LocalCoordination::new());
        let writer = cache_with(coord.clone(), 60);
        let key = fp("b");
        writer.write(&key, &entry(7)).await;

        // A second cache instance simulates another worker process sharing
        // the same coordination service.
        let reader = cache_with(coord, 60);
        let first = reader.read(&key).await;
        assert_eq!(first.hit.expect("hit").1, CacheStatus::SharedHit);
        let second = reader.read(&key).await;
        assert_eq!(second.hit.expect("hit").1, CacheStatus::LocalHit);
    }

    #[tokio::test]
    async fn local_ttl_expiry_falls_through_to_shared() {
        let cache = cache_with(Arc::new(LocalCoordination::new()), 0); // expire instantly
        let key = fp("c");
        cache.write(&key, &entry(1)).await;
        let read = cache.read(&key).await;
        assert_eq!(read.hit.expect("hit").1, CacheStatus::SharedHit);
    }

    #[tokio::test]
    async fn write_overwrites_existing_entry() {
        let cache = cache_with(Arc::new(LocalCoordination::new()), 60);
        let key = fp("d");
        cache.write(&key, &entry(1)).await;
        cache.write(&key, &entry(2)).await;
        let (value, _) = cache.read(&key).await.hit.expect("hit");
        assert_eq!(value.prefilter_total, 2);
    }

    #[tokio::test]
    async fn unreadable_shared_entry_is_a_miss() {
        let coord: SharedCoordination = Arc::new(LocalCoordination::new());
        let key = fp("e");
        coord
            .set(&SearchCache::shared_key(&key), "not json", None)
            .await
            .unwrap();
        let cache = cache_with(coord, 60);
        let read = cache.read(&key).await;
        assert!(read.hit.is_none());
        assert!(read.shared_ok);
    }
}
