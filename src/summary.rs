// src/summary.rs
//! Summary fallback selector: tries the AI summarizer under a bounded wait
//! and falls back to a deterministic statistical summary computed from the
//! result set. The caller never sees an error from this path.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::UnifiedProcurement;

const TOP_ITEMS: usize = 5;

/// External summarizer seam. Returns `None` on any failure; the selector
/// treats that the same as a timeout.
pub trait SummaryClient: Send + Sync {
    fn summarize<'a>(
        &'a self,
        records: &'a [UnifiedProcurement],
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;
    fn provider_name(&self) -> &'static str;
}

pub type SharedSummaryClient = Arc<dyn SummaryClient>;

/// Used when no AI configuration is present.
pub struct DisabledSummaryClient;

impl SummaryClient for DisabledSummaryClient {
    fn summarize<'a>(
        &'a self,
        _records: &'a [UnifiedProcurement],
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        Box::pin(async { None })
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

/// Deterministic client for tests and local runs.
#[derive(Clone)]
pub struct MockSummaryClient {
    pub fixed: String,
}

impl SummaryClient for MockSummaryClient {
    fn summarize<'a>(
        &'a self,
        _records: &'a [UnifiedProcurement],
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        let out = self.fixed.clone();
        Box::pin(async move { Some(out) })
    }
    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopItem {
    pub id: String,
    pub title: String,
    pub uf: String,
    pub value: Option<f64>,
}

/// Counts, totals, per-region distribution, and top items by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticalSummary {
    pub total: usize,
    pub total_value: f64,
    pub by_uf: BTreeMap<String, usize>,
    pub by_modality: BTreeMap<String, usize>,
    pub top: Vec<TopItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Summary {
    Ai { provider: String, text: String },
    Statistical(StatisticalSummary),
}

/// Pure and deterministic: identical result sets yield identical summaries.
pub fn statistical_summary(records: &[UnifiedProcurement]) -> StatisticalSummary {
    let mut by_uf: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_modality: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_value = 0.0;
    for r in records {
        *by_uf.entry(r.uf.to_string()).or_insert(0) += 1;
        *by_modality
            .entry(format!("{:?}", r.modality))
            .or_insert(0) += 1;
        total_value += r.value.unwrap_or(0.0);
    }

    let mut ranked: Vec<&UnifiedProcurement> = records.iter().collect();
    ranked.sort_by(|a, b| {
        b.value
            .unwrap_or(0.0)
            .partial_cmp(&a.value.unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    StatisticalSummary {
        total: records.len(),
        total_value,
        by_uf,
        by_modality,
        top: ranked
            .into_iter()
            .take(TOP_ITEMS)
            .map(|r| TopItem {
                id: r.id.to_string(),
                title: r.title.clone(),
                uf: r.uf.to_string(),
                value: r.value,
            })
            .collect(),
    }
}

pub struct SummarySelector {
    client: SharedSummaryClient,
    ai_wait: Duration,
}

impl SummarySelector {
    pub fn new(client: SharedSummaryClient, ai_wait: Duration) -> Self {
        Self { client, ai_wait }
    }

    /// AI summary if it answers within the bounded wait, statistical
    /// otherwise. Never blocks search completion beyond `ai_wait`.
    pub async fn select(&self, records: &[UnifiedProcurement]) -> Summary {
        match tokio::time::timeout(self.ai_wait, self.client.summarize(records)).await {
            Ok(Some(text)) if !text.trim().is_empty() => {
                counter!("summary_selected_total", "kind" => "ai").increment(1);
                Summary::Ai {
                    provider: self.client.provider_name().to_string(),
                    text,
                }
            }
            Ok(_) => {
                counter!("summary_selected_total", "kind" => "statistical").increment(1);
                Summary::Statistical(statistical_summary(records))
            }
            Err(_) => {
                warn!(
                    provider = self.client.provider_name(),
                    wait_ms = self.ai_wait.as_millis() as u64,
                    "AI summary timed out; statistical fallback"
                );
                counter!("summary_selected_total", "kind" => "statistical").increment(1);
                Summary::Statistical(statistical_summary(records))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Esfera, Modality, ProcStatus, ProcurementId, Uf};
    use chrono::{TimeZone, Utc};

    fn record(local: &str, uf: Uf, value: Option<f64>) -> UnifiedProcurement {
        UnifiedProcurement {
            id: ProcurementId::new("pncp", local),
            title: format!("Tender {local}"),
            description: String::new(),
            organ: "Org".to_string(),
            uf,
            municipality: None,
            modality: Modality::PregaoEletronico,
            status: ProcStatus::Open,
            esfera: Esfera::Municipal,
            published_at: Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap(),
            deadline_at: None,
            value,
            source: "pncp".to_string(),
            control_number: None,
        }
    }

    #[test]
    fn statistical_summary_counts_and_ranks() {
        let records = vec![
            record("1", Uf::SP, Some(100.0)),
            record("2", Uf::SP, Some(300.0)),
            record("3", Uf::RJ, None),
        ];
        let s = statistical_summary(&records);
        assert_eq!(s.total, 3);
        assert_eq!(s.total_value, 400.0);
        assert_eq!(s.by_uf["SP"], 2);
        assert_eq!(s.by_uf["RJ"], 1);
        assert_eq!(s.top[0].id, "pncp:2");
    }

    #[test]
    fn statistical_summary_is_deterministic() {
        let records = vec![record("1", Uf::SP, Some(1.0)), record("2", Uf::BA, None)];
        assert_eq!(statistical_summary(&records), statistical_summary(&records));
    }

    #[tokio::test]
    async fn selects_ai_when_available() {
        let selector = SummarySelector::new(
            Arc::new(MockSummaryClient {
                fixed: "Three tenders in SP".to_string(),
            }),
            Duration::from_millis(500),
        );
        match selector.select(&[record("1", Uf::SP, None)]).await {
            Summary::Ai { provider, text } => {
                assert_eq!(provider, "mock");
                assert_eq!(text, "Three tenders in SP");
            }
            other => panic!("expected AI summary, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn falls_back_when_disabled() {
        let selector =
            SummarySelector::new(Arc::new(DisabledSummaryClient), Duration::from_millis(500));
        match selector.select(&[record("1", Uf::SP, Some(5.0))]).await {
            Summary::Statistical(s) => assert_eq!(s.total, 1),
            other => panic!("expected statistical summary, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn falls_back_on_timeout() {
        struct SlowClient;
        impl SummaryClient for SlowClient {
            fn summarize<'a>(
                &'a self,
                _records: &'a [UnifiedProcurement],
            ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Some("too late".to_string())
                })
            }
            fn provider_name(&self) -> &'static str {
                "slow"
            }
        }
        let selector = SummarySelector::new(Arc::new(SlowClient), Duration::from_millis(50));
        match selector.select(&[]).await {
            Summary::Statistical(s) => assert_eq!(s.total, 0),
            other => panic!("expected fallback, got {other:?}"),
        }
    }
}
