// src/search.rs
//! Search orchestration: validate → fingerprint → cache → aggregate →
//! filter → summarize → cache write, with a whole-search deadline
//! independent of the per-source one, and caller-initiated cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::aggregate::{Aggregator, UnavailableSource};
use crate::breaker::CircuitBreaker;
use crate::cache::{CacheStatus, CachedSearch, SearchCache};
use crate::config::AggregatorConfig;
use crate::coord::SharedCoordination;
use crate::error::{CoordinationUnavailable, SearchError};
use crate::filter::{apply_filters, FilterCriteria, RejectionBreakdown};
use crate::model::{ProgressEvent, SearchRequest, UnifiedProcurement};
use crate::progress::ProgressBroadcaster;
use crate::ratelimit::RateLimiter;
use crate::sources::SourceAdapter;
use crate::summary::{SharedSummaryClient, Summary, SummarySelector};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchOptions {
    /// Recompute and overwrite the cache without reading the stale entry.
    #[serde(default)]
    pub force_refresh: bool,
    /// Caller-supplied id so progress can be subscribed from any process;
    /// generated from the fingerprint when absent.
    #[serde(default)]
    pub search_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub search_id: String,
    pub results: Vec<UnifiedProcurement>,
    /// Records that entered the filter engine, before any rejection.
    pub prefilter_total: usize,
    pub rejection_breakdown: RejectionBreakdown,
    pub summary: Summary,
    /// True under reduced source coverage, local-only cache mode, or a
    /// whole-search deadline hit. Callers render an honest partial result.
    pub degraded: bool,
    pub unavailable_sources: Vec<UnavailableSource>,
    pub cache: CacheStatus,
}

pub struct SearchService {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    aggregator: Aggregator,
    cache: SearchCache,
    progress: ProgressBroadcaster,
    selector: SummarySelector,
    cfg: AggregatorConfig,
    /// In-flight searches by id, for caller-initiated cancellation.
    running: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl SearchService {
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        coord: SharedCoordination,
        summary_client: SharedSummaryClient,
        cfg: AggregatorConfig,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(coord.clone(), cfg.breaker.clone()));
        let limiter = Arc::new(RateLimiter::new(coord.clone(), cfg.rate_limit.clone()));
        Self {
            aggregator: Aggregator::new(breaker, limiter, cfg.clone()),
            cache: SearchCache::new(coord.clone(), cfg.cache.clone()),
            progress: ProgressBroadcaster::new(
                coord,
                Duration::from_secs(cfg.progress.grace_secs),
            ),
            selector: SummarySelector::new(
                summary_client,
                Duration::from_millis(cfg.summary.ai_wait_ms),
            ),
            adapters,
            cfg,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn validate(request: &SearchRequest) -> Result<(), SearchError> {
        if request.ufs.is_empty() {
            return Err(SearchError::Validation("uf list must not be empty".into()));
        }
        if request.end < request.start {
            return Err(SearchError::Validation(format!(
                "end date {} precedes start date {}",
                request.end, request.start
            )));
        }
        Ok(())
    }

    /// Best-effort abort of a running search: in-flight adapter calls run
    /// to completion (so shared counters stay truthful) but no further
    /// fetches start and progress emission stops.
    pub fn cancel(&self, search_id: &str) -> bool {
        let running = self.running.lock().expect("running map poisoned");
        match running.get(search_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    /// Attach to a search's progress stream; catch-up snapshot first.
    pub async fn subscribe(
        &self,
        search_id: &str,
    ) -> Result<mpsc::Receiver<ProgressEvent>, CoordinationUnavailable> {
        self.progress.subscribe(search_id).await
    }

    pub async fn search(
        &self,
        request: SearchRequest,
        opts: SearchOptions,
    ) -> Result<SearchResponse, SearchError> {
        let started = std::time::Instant::now();
        counter!("search_requests_total").increment(1);
        Self::validate(&request)?;

        let fingerprint = request.fingerprint();
        let search_id = opts
            .search_id
            .unwrap_or_else(|| format!("s-{fingerprint}"));

        let mut degraded = false;

        if !opts.force_refresh {
            let read = self.cache.read(&fingerprint).await;
            degraded |= !read.shared_ok;
            if let Some((cached, status)) = read.hit {
                let summary = self.selector.select(&cached.results).await;
                histogram!("search_duration_ms")
                    .record(started.elapsed().as_secs_f64() * 1_000.0);
                return Ok(SearchResponse {
                    search_id,
                    degraded: degraded || !cached.unavailable.is_empty(),
                    unavailable_sources: cached.unavailable.clone(),
                    prefilter_total: cached.prefilter_total,
                    rejection_breakdown: cached.breakdown,
                    summary,
                    results: cached.results,
                    cache: status,
                });
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut running = self.running.lock().expect("running map poisoned");
            running.insert(search_id.clone(), cancel_tx);
        }

        let outcome = self
            .run_aggregation(&request, &search_id, cancel_rx)
            .await;

        {
            let mut running = self.running.lock().expect("running map poisoned");
            running.remove(&search_id);
        }

        let (aggregate, timed_out) = outcome;
        degraded |= timed_out;

        if aggregate.all_failed {
            warn!(search = %search_id, "all sources unavailable");
            return Err(SearchError::AllSourcesUnavailable(
                aggregate
                    .unavailable
                    .iter()
                    .map(|u| u.source.clone())
                    .collect(),
            ));
        }
        degraded |= !aggregate.unavailable.is_empty();

        let prefilter_total = aggregate.records.len();
        let criteria = FilterCriteria::from_request(&request, &self.cfg.sector_keywords);
        let outcome = apply_filters(aggregate.records, &criteria);

        let cached = CachedSearch {
            results: outcome.passed,
            prefilter_total,
            breakdown: outcome.breakdown,
            unavailable: aggregate.unavailable,
            computed_at: chrono::Utc::now(),
        };
        degraded |= !self.cache.write(&fingerprint, &cached).await;

        let summary = self.selector.select(&cached.results).await;

        info!(
            search = %search_id,
            found = prefilter_total,
            passed = cached.results.len(),
            dedup_removed = aggregate.dedup_removed,
            degraded,
            "search complete"
        );
        histogram!("search_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        Ok(SearchResponse {
            search_id,
            degraded,
            unavailable_sources: cached.unavailable.clone(),
            prefilter_total,
            rejection_breakdown: cached.breakdown.clone(),
            summary,
            results: cached.results.clone(),
            cache: if opts.force_refresh {
                CacheStatus::Bypass
            } else {
                CacheStatus::Miss
            },
        })
    }

    /// Run the fan-out under the whole-search deadline. On expiry the
    /// cancel token flips and the partial aggregation is collected, so a
    /// slow source yields partial delivery instead of blocking the
    /// response.
    async fn run_aggregation(
        &self,
        request: &SearchRequest,
        search_id: &str,
        cancel_rx: watch::Receiver<bool>,
    ) -> (crate::aggregate::AggregateResult, bool) {
        let publisher = Arc::new(self.progress.publisher(
            search_id,
            Duration::from_millis(self.cfg.search_timeout_ms),
        ));

        let aggregator = self.aggregator.clone();
        let adapters = self.adapters.clone();
        let req = request.clone();
        let id = search_id.to_string();
        let task_cancel = cancel_rx.clone();
        let mut handle = tokio::spawn(async move {
            aggregator
                .fetch_all(&adapters, &req, &id, publisher, task_cancel)
                .await
        });

        let deadline = tokio::time::sleep(Duration::from_millis(self.cfg.search_timeout_ms));
        tokio::pin!(deadline);

        tokio::select! {
            joined = &mut handle => {
                match joined {
                    Ok(result) => (result, false),
                    Err(e) => {
                        warn!(error = %e, "aggregation task failed");
                        (empty_aggregate(&self.adapters), false)
                    }
                }
            }
            _ = &mut deadline => {
                warn!(search = %search_id, "whole-search deadline hit; delivering partial results");
                self.cancel(search_id);
                match handle.await {
                    Ok(result) => (result, true),
                    Err(e) => {
                        warn!(error = %e, "aggregation task failed after deadline");
                        (empty_aggregate(&self.adapters), true)
                    }
                }
            }
        }
    }
}

fn empty_aggregate(adapters: &[Arc<dyn SourceAdapter>]) -> crate::aggregate::AggregateResult {
    crate::aggregate::AggregateResult {
        records: Vec::new(),
        unavailable: adapters
            .iter()
            .map(|a| UnavailableSource {
                source: a.name().to_string(),
                reason: "aggregation aborted".to_string(),
            })
            .collect(),
        all_failed: !adapters.is_empty(),
        dedup_removed: 0,
    }
}
