// tests/search_e2e.rs
//
// End-to-end scenarios through SearchService with deterministic fake
// adapters: healthy path, caching, force refresh, partial and total
// source outages, and cross-source dedup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{json, Value};

use licita_radar::cache::CacheStatus;
use licita_radar::config::AggregatorConfig;
use licita_radar::coord::LocalCoordination;
use licita_radar::error::{SearchError, SourceFailure, SourceFailureKind};
use licita_radar::model::{SearchRequest, Uf, UnifiedProcurement};
use licita_radar::search::{SearchOptions, SearchService};
use licita_radar::sources::{SourceAdapter, SourceQuery};
use licita_radar::summary::DisabledSummaryClient;

/// Serves canned records and counts fetch invocations, so cache tests can
/// assert "zero additional adapter calls".
struct FakeAdapter {
    name: &'static str,
    records: Vec<Value>,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl FakeAdapter {
    fn healthy(name: &'static str, records: Vec<Value>) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                name,
                records,
                fail: false,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    fn failing(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            records: Vec::new(),
            fail: true,
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait::async_trait]
impl SourceAdapter for FakeAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch(&self, query: &SourceQuery) -> Result<Vec<Value>, SourceFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SourceFailure::new(self.name, SourceFailureKind::Http(503)));
        }
        Ok(self
            .records
            .iter()
            .filter(|r| r["uf"] == query.uf.as_str())
            .cloned()
            .collect())
    }

    fn normalize(&self, raw: &Value) -> Option<UnifiedProcurement> {
        serde_json::from_value(raw.clone()).ok()
    }
}

fn record(source: &str, local: &str, uf: &str, control: Option<&str>, value: f64) -> Value {
    json!({
        "id": format!("{source}:{local}"),
        "title": format!("Contratação de obra {local}"),
        "description": "Reforma de escola municipal",
        "organ": "Prefeitura Municipal",
        "uf": uf,
        "municipality": "Campinas",
        "modality": "pregao_eletronico",
        "status": "open",
        "esfera": "municipal",
        "published_at": "2026-01-05T12:00:00Z",
        "deadline_at": null,
        "value": value,
        "source": source,
        "control_number": control,
    })
}

fn request(ufs: Vec<Uf>) -> SearchRequest {
    SearchRequest {
        ufs,
        start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        end: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
        terms: vec!["obra".to_string()],
        filters: Default::default(),
    }
}

fn service(adapters: Vec<Arc<dyn SourceAdapter>>) -> SearchService {
    let mut cfg = AggregatorConfig::default();
    cfg.summary.ai_wait_ms = 100;
    SearchService::new(
        adapters,
        Arc::new(LocalCoordination::new()),
        Arc::new(DisabledSummaryClient),
        cfg,
    )
}

#[tokio::test]
async fn healthy_search_is_not_degraded() {
    let (pncp, _) = FakeAdapter::healthy("pncp", vec![record("pncp", "1", "SP", None, 100.0)]);
    let (compras, _) =
        FakeAdapter::healthy("comprasnet", vec![record("comprasnet", "9", "SP", None, 50.0)]);
    let svc = service(vec![pncp, compras]);

    let resp = svc
        .search(request(vec![Uf::SP]), SearchOptions::default())
        .await
        .expect("healthy search");

    assert!(!resp.degraded);
    assert!(resp.unavailable_sources.is_empty());
    assert_eq!(resp.prefilter_total, 2);
    assert_eq!(resp.results.len(), 2);
    assert!(resp.rejection_breakdown.is_empty());
    assert_eq!(resp.cache, CacheStatus::Miss);
}

#[tokio::test]
async fn identical_search_hits_cache_without_adapter_calls() {
    let (pncp, calls) = FakeAdapter::healthy("pncp", vec![record("pncp", "1", "SP", None, 100.0)]);
    let svc = service(vec![pncp]);

    let first = svc
        .search(request(vec![Uf::SP]), SearchOptions::default())
        .await
        .expect("first search");
    let calls_after_first = calls.load(Ordering::SeqCst);
    assert!(calls_after_first >= 1);

    let second = svc
        .search(request(vec![Uf::SP]), SearchOptions::default())
        .await
        .expect("second search");

    assert_eq!(second.cache, CacheStatus::LocalHit);
    assert_eq!(second.results, first.results);
    assert_eq!(second.prefilter_total, first.prefilter_total);
    assert_eq!(
        calls.load(Ordering::SeqCst),
        calls_after_first,
        "cache hit must not touch the adapters"
    );
}

#[tokio::test]
async fn force_refresh_bypasses_cache_and_recomputes() {
    let (pncp, calls) = FakeAdapter::healthy("pncp", vec![record("pncp", "1", "SP", None, 100.0)]);
    let svc = service(vec![pncp]);

    svc.search(request(vec![Uf::SP]), SearchOptions::default())
        .await
        .expect("first search");
    let calls_after_first = calls.load(Ordering::SeqCst);

    let refreshed = svc
        .search(
            request(vec![Uf::SP]),
            SearchOptions {
                force_refresh: true,
                search_id: None,
            },
        )
        .await
        .expect("forced refresh");

    assert_eq!(refreshed.cache, CacheStatus::Bypass);
    assert!(
        calls.load(Ordering::SeqCst) > calls_after_first,
        "force refresh must hit the adapters again"
    );

    // The refreshed entry replaces the old one for subsequent reads.
    let third = svc
        .search(request(vec![Uf::SP]), SearchOptions::default())
        .await
        .expect("post-refresh search");
    assert_eq!(third.cache, CacheStatus::LocalHit);
}

#[tokio::test]
async fn partial_outage_is_degraded_but_succeeds() {
    let (pncp, _) = FakeAdapter::healthy("pncp", vec![record("pncp", "1", "SP", None, 100.0)]);
    let broken = FakeAdapter::failing("comprasnet");
    let svc = service(vec![pncp, broken]);

    let resp = svc
        .search(request(vec![Uf::SP]), SearchOptions::default())
        .await
        .expect("partial outage still succeeds");

    assert!(resp.degraded);
    assert_eq!(resp.unavailable_sources.len(), 1);
    assert_eq!(resp.unavailable_sources[0].source, "comprasnet");
    assert_eq!(resp.results.len(), 1);
}

#[tokio::test]
async fn total_outage_is_an_error_not_an_empty_success() {
    let svc = service(vec![
        FakeAdapter::failing("pncp"),
        FakeAdapter::failing("comprasnet"),
    ]);

    let err = svc
        .search(request(vec![Uf::SP]), SearchOptions::default())
        .await
        .expect_err("all sources down must not look like an empty result");

    match err {
        SearchError::AllSourcesUnavailable(sources) => {
            assert_eq!(sources.len(), 2);
            assert!(sources.contains(&"pncp".to_string()));
        }
        other => panic!("expected AllSourcesUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn same_control_number_across_sources_dedups_to_one() {
    let (pncp, _) = FakeAdapter::healthy(
        "pncp",
        vec![record("pncp", "1", "SP", Some("PNCP-123"), 100.0)],
    );
    let (compras, _) = FakeAdapter::healthy(
        "comprasnet",
        vec![record("comprasnet", "77", "SP", Some("PNCP-123"), 100.0)],
    );
    let svc = service(vec![pncp, compras]);

    let resp = svc
        .search(request(vec![Uf::SP]), SearchOptions::default())
        .await
        .expect("search");

    assert_eq!(resp.results.len(), 1);
    // Authoritative source wins the merge.
    assert_eq!(resp.results[0].source, "pncp");
}

#[tokio::test]
async fn rejections_are_fully_accounted_for() {
    let (pncp, _) = FakeAdapter::healthy(
        "pncp",
        vec![
            record("pncp", "1", "SP", None, 100.0),
            // Rejected: wrong keyword domain.
            json!({
                "id": "pncp:2",
                "title": "Aquisição de medicamentos",
                "description": "Fármacos para rede básica",
                "organ": "Secretaria de Saúde",
                "uf": "SP",
                "municipality": null,
                "modality": "pregao_eletronico",
                "status": "open",
                "esfera": "estadual",
                "published_at": "2026-01-06T09:00:00Z",
                "deadline_at": null,
                "value": 2000.0,
                "source": "pncp",
                "control_number": null,
            }),
        ],
    );
    let svc = service(vec![pncp]);

    let resp = svc
        .search(request(vec![Uf::SP]), SearchOptions::default())
        .await
        .expect("search");

    assert_eq!(resp.prefilter_total, 2);
    assert_eq!(resp.results.len(), 1);
    let rejected: u64 = resp.rejection_breakdown.values().sum();
    assert_eq!(
        rejected as usize,
        resp.prefilter_total - resp.results.len(),
        "every rejected record must be attributed to exactly one criterion"
    );
}
