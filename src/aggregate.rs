// src/aggregate.rs
//! Fan-out across region × source under a bounded concurrency cap, absorb
//! per-source failures into reduced coverage, and deduplicate the merged
//! stream with an authoritative-source tie-break.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::warn;

use crate::breaker::CircuitBreaker;
use crate::config::AggregatorConfig;
use crate::error::{GuardedCallError, SourceFailure, SourceFailureKind};
use crate::model::{ProgressEvent, ProgressStatus, SearchRequest, Uf, UnifiedProcurement};
use crate::progress::ProgressPublisher;
use crate::ratelimit::RateLimiter;
use crate::sources::{fold_accents, SourceAdapter, SourceQuery};

/// Fuzzy-dedup thresholds: title similarity, value tolerance, date window.
const TITLE_SIMILARITY_MIN: f64 = 0.92;
const VALUE_TOLERANCE: f64 = 0.01;
const DATE_WINDOW_DAYS: i64 = 3;

/// A source that contributed nothing to this search, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnavailableSource {
    pub source: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct AggregateResult {
    pub records: Vec<UnifiedProcurement>,
    pub unavailable: Vec<UnavailableSource>,
    /// True when every configured source ended up unavailable.
    pub all_failed: bool,
    pub dedup_removed: usize,
}

enum TaskOutcome {
    Fetched {
        source: &'static str,
        records: Vec<UnifiedProcurement>,
    },
    Skipped {
        source: &'static str,
        reason: String,
    },
    Cancelled,
}

#[derive(Clone)]
pub struct Aggregator {
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    cfg: AggregatorConfig,
}

impl Aggregator {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        cfg: AggregatorConfig,
    ) -> Self {
        Self {
            breaker,
            limiter,
            cfg,
        }
    }

    /// Fetch every (uf × source) combination, bounded by the configured
    /// concurrency cap, merge and dedup. Per-source failures degrade
    /// coverage; only when all sources fail is `all_failed` set.
    pub async fn fetch_all(
        &self,
        adapters: &[Arc<dyn SourceAdapter>],
        request: &SearchRequest,
        search_id: &str,
        publisher: Arc<ProgressPublisher>,
        cancel: watch::Receiver<bool>,
    ) -> AggregateResult {
        let mut ufs: Vec<Uf> = request.ufs.clone();
        ufs.sort_unstable();
        ufs.dedup();

        let semaphore = Arc::new(Semaphore::new(self.cfg.max_concurrent_fetches.max(1)));
        let per_source_timeout = Duration::from_millis(self.cfg.per_source_timeout_ms);
        let mut set: JoinSet<TaskOutcome> = JoinSet::new();

        for uf in &ufs {
            for adapter in adapters {
                let source = adapter.name();
                publisher
                    .publish(ProgressEvent {
                        search_id: search_id.to_string(),
                        uf: *uf,
                        source: source.to_string(),
                        status: ProgressStatus::Pending,
                        found: 0,
                        message: None,
                    })
                    .await;

                let query = SourceQuery {
                    uf: *uf,
                    start: request.start,
                    end: request.end,
                };
                let adapter = adapter.clone();
                let breaker = self.breaker.clone();
                let limiter = self.limiter.clone();
                let publisher = publisher.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                let search_id = search_id.to_string();
                let uf = *uf;

                set.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return TaskOutcome::Cancelled,
                    };
                    // Cancellation checkpoints sit *between* stages: an
                    // adapter call already in flight runs to completion so
                    // breaker and rate-limit counters reflect calls actually
                    // made.
                    if *cancel.borrow() {
                        return TaskOutcome::Cancelled;
                    }

                    let emit = |status: ProgressStatus, found: usize, message: Option<String>| {
                        let publisher = publisher.clone();
                        let search_id = search_id.clone();
                        let source_name = source.to_string();
                        async move {
                            publisher
                                .publish(ProgressEvent {
                                    search_id,
                                    uf,
                                    source: source_name,
                                    status,
                                    found,
                                    message,
                                })
                                .await;
                        }
                    };

                    emit(ProgressStatus::Fetching, 0, None).await;

                    if let Err(e) = limiter.acquire(source).await {
                        // Rate-limit exhaustion is reported through the
                        // progress channel, never silently dropped.
                        emit(ProgressStatus::Error, 0, Some(e.to_string())).await;
                        return TaskOutcome::Skipped {
                            source,
                            reason: "rate limit exceeded".to_string(),
                        };
                    }
                    if *cancel.borrow() {
                        return TaskOutcome::Cancelled;
                    }

                    let result = breaker
                        .call(source, || async {
                            match tokio::time::timeout(
                                per_source_timeout,
                                adapter.fetch_normalized(&query),
                            )
                            .await
                            {
                                Ok(r) => r,
                                Err(_) => Err(SourceFailure::new(
                                    source,
                                    SourceFailureKind::Timeout,
                                )),
                            }
                        })
                        .await;

                    let cancelled = *cancel.borrow();
                    match result {
                        Ok(records) => {
                            if !cancelled {
                                emit(ProgressStatus::Done, records.len(), None).await;
                            }
                            TaskOutcome::Fetched { source, records }
                        }
                        Err(GuardedCallError::Open(_)) => {
                            if !cancelled {
                                emit(
                                    ProgressStatus::Error,
                                    0,
                                    Some("circuit open".to_string()),
                                )
                                .await;
                            }
                            TaskOutcome::Skipped {
                                source,
                                reason: "circuit open".to_string(),
                            }
                        }
                        Err(GuardedCallError::Source(failure)) => {
                            counter!("source_fetch_errors_total", "source" => source.to_string())
                                .increment(1);
                            warn!(source, uf = %uf, error = %failure, "source fetch failed");
                            if !cancelled {
                                emit(ProgressStatus::Error, 0, Some(failure.kind.to_string()))
                                    .await;
                            }
                            TaskOutcome::Skipped {
                                source,
                                reason: failure.kind.to_string(),
                            }
                        }
                    }
                });
            }
        }

        // source -> (successful fetches, first failure reason)
        let mut health: HashMap<&'static str, (usize, Option<String>)> = HashMap::new();
        for adapter in adapters {
            health.insert(adapter.name(), (0, None));
        }
        let mut merged = Vec::new();

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(TaskOutcome::Fetched { source, records }) => {
                    let entry = health.entry(source).or_insert((0, None));
                    entry.0 += 1;
                    merged.extend(records);
                }
                Ok(TaskOutcome::Skipped { source, reason }) => {
                    let entry = health.entry(source).or_insert((0, None));
                    entry.1.get_or_insert(reason);
                }
                Ok(TaskOutcome::Cancelled) => {}
                Err(e) => warn!(error = %e, "aggregation task panicked"),
            }
        }

        let mut unavailable: Vec<UnavailableSource> = health
            .iter()
            .filter(|(_, (ok, failure))| *ok == 0 && failure.is_some())
            .map(|(source, (_, failure))| UnavailableSource {
                source: source.to_string(),
                reason: failure.clone().unwrap_or_default(),
            })
            .collect();
        unavailable.sort_by(|a, b| a.source.cmp(&b.source));

        let all_failed = !adapters.is_empty()
            && health.values().all(|(ok, _)| *ok == 0)
            && !unavailable.is_empty();

        let cfg = self.cfg.clone();
        let (records, dedup_removed) =
            dedup_records(merged, &|source| cfg.source_rank(source));
        counter!("dedup_removed_total").increment(dedup_removed as u64);

        AggregateResult {
            records,
            unavailable,
            all_failed,
            dedup_removed,
        }
    }
}

/// True when `a` and `b` describe the same tender without a shared control
/// number: same region and organ, values within tolerance, publication
/// dates within the window, and near-identical titles.
fn is_fuzzy_duplicate(a: &UnifiedProcurement, b: &UnifiedProcurement) -> bool {
    if a.uf != b.uf {
        return false;
    }
    if fold_accents(&a.organ) != fold_accents(&b.organ) {
        return false;
    }
    let values_close = match (a.value, b.value) {
        (Some(x), Some(y)) => {
            let base = x.abs().max(y.abs()).max(f64::EPSILON);
            (x - y).abs() / base <= VALUE_TOLERANCE
        }
        (None, None) => true,
        _ => false,
    };
    if !values_close {
        return false;
    }
    let days_apart = (a.published_at - b.published_at).num_days().abs();
    if days_apart > DATE_WINDOW_DAYS {
        return false;
    }
    strsim::jaro_winkler(&fold_accents(&a.title), &fold_accents(&b.title))
        >= TITLE_SIMILARITY_MIN
}

/// Deterministic winner among duplicates: authoritative source first, then
/// most recently published, then stable id order.
fn prefer<'a>(
    a: &'a UnifiedProcurement,
    b: &'a UnifiedProcurement,
    rank: &impl Fn(&str) -> usize,
) -> bool {
    let ra = rank(&a.source);
    let rb = rank(&b.source);
    if ra != rb {
        return ra < rb;
    }
    if a.published_at != b.published_at {
        return a.published_at > b.published_at;
    }
    a.id <= b.id
}

/// Remove duplicates from the merged stream. Exact matches share a
/// cross-source control number; the rest go through the fuzzy key. Returns
/// the survivors (sorted newest-first) and the number removed.
pub fn dedup_records(
    records: Vec<UnifiedProcurement>,
    rank: &impl Fn(&str) -> usize,
) -> (Vec<UnifiedProcurement>, usize) {
    let input_len = records.len();
    let mut kept: Vec<UnifiedProcurement> = Vec::with_capacity(input_len);
    let mut by_control: HashMap<String, usize> = HashMap::new();

    for record in records {
        let control = record
            .control_number
            .as_deref()
            .map(|c| fold_accents(c.trim()))
            .filter(|c| !c.is_empty());

        // Exact control-number match first; otherwise fall back to the
        // fuzzy key. The fallback only pairs records where at least one
        // side has no control number, so two tenders with distinct control
        // numbers never merge, and the outcome does not depend on whether
        // the numbered or the unnumbered copy arrived first.
        let existing_idx = control
            .as_ref()
            .and_then(|c| by_control.get(c).copied())
            .or_else(|| {
                kept.iter().position(|k| {
                    (k.control_number.is_none() || control.is_none())
                        && is_fuzzy_duplicate(k, &record)
                })
            });

        match existing_idx {
            Some(idx) => {
                if prefer(&record, &kept[idx], rank) {
                    kept[idx] = record;
                }
                if let Some(c) = control {
                    by_control.entry(c).or_insert(idx);
                }
            }
            None => {
                let idx = kept.len();
                kept.push(record);
                if let Some(c) = control {
                    by_control.insert(c, idx);
                }
            }
        }
    }

    let removed = input_len - kept.len();
    kept.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    (kept, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Esfera, Modality, ProcStatus, ProcurementId};
    use chrono::{TimeZone, Utc};

    fn record(source: &str, local: &str, title: &str) -> UnifiedProcurement {
        UnifiedProcurement {
            id: ProcurementId::new(source, local),
            title: title.to_string(),
            description: String::new(),
            organ: "Prefeitura de Campinas".to_string(),
            uf: Uf::SP,
            municipality: Some("Campinas".to_string()),
            modality: Modality::PregaoEletronico,
            status: ProcStatus::Open,
            esfera: Esfera::Municipal,
            published_at: Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap(),
            deadline_at: None,
            value: Some(100_000.0),
            source: source.to_string(),
            control_number: None,
        }
    }

    fn rank(source: &str) -> usize {
        match source {
            "pncp" => 0,
            "comprasnet" => 1,
            _ => 2,
        }
    }

    #[test]
    fn exact_dedup_by_control_number_prefers_authoritative() {
        let mut a = record("comprasnet", "1", "Reforma da escola municipal");
        a.control_number = Some("CN-123".to_string());
        let mut b = record("pncp", "2", "Reforma da escola municipal");
        b.control_number = Some("CN-123".to_string());

        let (kept, removed) = dedup_records(vec![a, b.clone()], &rank);
        assert_eq!(kept.len(), 1);
        assert_eq!(removed, 1);
        assert_eq!(kept[0].source, "pncp");
        assert_eq!(kept[0].id, b.id);
    }

    #[test]
    fn fuzzy_dedup_catches_near_identical_titles() {
        let a = record("pncp", "1", "Reforma da escola municipal Anísio Teixeira");
        let b = record("transparencia", "9", "Reforma da escola municipal Anisio Teixeira");
        let (kept, removed) = dedup_records(vec![a, b], &rank);
        assert_eq!(kept.len(), 1);
        assert_eq!(removed, 1);
        assert_eq!(kept[0].source, "pncp");
    }

    #[test]
    fn distinct_tenders_survive() {
        let a = record("pncp", "1", "Reforma da escola municipal");
        let mut b = record("pncp", "2", "Aquisição de ambulâncias tipo A");
        b.value = Some(900_000.0);
        let (kept, removed) = dedup_records(vec![a, b], &rank);
        assert_eq!(kept.len(), 2);
        assert_eq!(removed, 0);
    }

    #[test]
    fn equal_rank_prefers_most_recent() {
        let mut a = record("pncp", "1", "Reforma da escola");
        a.control_number = Some("CN-9".to_string());
        let mut b = record("pncp", "2", "Reforma da escola");
        b.control_number = Some("CN-9".to_string());
        b.published_at = Utc.with_ymd_and_hms(2026, 1, 6, 10, 0, 0).unwrap();

        let (kept, _) = dedup_records(vec![a, b.clone()], &rank);
        assert_eq!(kept[0].id, b.id);
    }

    #[test]
    fn value_difference_defeats_fuzzy_match() {
        let a = record("pncp", "1", "Reforma da escola municipal");
        let mut b = record("transparencia", "2", "Reforma da escola municipal");
        b.value = Some(150_000.0); // 50% apart: different tender
        let (kept, _) = dedup_records(vec![a, b], &rank);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn dedup_is_order_independent() {
        let mut a = record("comprasnet", "1", "Reforma da escola");
        a.control_number = Some("CN-1".to_string());
        let mut b = record("pncp", "2", "Reforma da escola");
        b.control_number = Some("CN-1".to_string());

        let (fwd, _) = dedup_records(vec![a.clone(), b.clone()], &rank);
        let (rev, _) = dedup_records(vec![b, a], &rank);
        assert_eq!(fwd, rev);
    }

    #[test]
    fn mixed_control_dedup_is_order_independent() {
        // Same tender seen twice: once with a control number, once without.
        let mut a = record("pncp", "1", "Reforma da escola municipal");
        a.control_number = Some("CN-77".to_string());
        let b = record("transparencia", "2", "Reforma da escola municipal");

        let (fwd, fwd_removed) = dedup_records(vec![a.clone(), b.clone()], &rank);
        let (rev, rev_removed) = dedup_records(vec![b, a], &rank);
        assert_eq!(fwd.len(), 1);
        assert_eq!(fwd_removed, 1);
        assert_eq!(rev_removed, 1);
        assert_eq!(fwd, rev);
        assert_eq!(fwd[0].source, "pncp");
    }

    #[test]
    fn distinct_control_numbers_never_fuzzy_merge() {
        // Near-identical titles but both sides carry their own control
        // number: these are two real tenders, not a duplicate.
        let mut a = record("pncp", "1", "Reforma da escola municipal");
        a.control_number = Some("CN-1".to_string());
        let mut b = record("comprasnet", "2", "Reforma da escola municipal");
        b.control_number = Some("CN-2".to_string());

        let (kept, removed) = dedup_records(vec![a, b], &rank);
        assert_eq!(kept.len(), 2);
        assert_eq!(removed, 0);
    }

    #[test]
    fn survivors_sorted_newest_first() {
        let a = record("pncp", "1", "Tender A");
        let mut b = record("pncp", "2", "Tender B totally different thing");
        b.value = Some(5.0);
        b.published_at = Utc.with_ymd_and_hms(2026, 1, 7, 0, 0, 0).unwrap();
        let (kept, _) = dedup_records(vec![a, b.clone()], &rank);
        assert_eq!(kept[0].id, b.id);
    }
}
