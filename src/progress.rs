// src/progress.rs
//! Per-search progress fan-out over the coordination pub/sub, so a
//! subscriber may live in a different worker process than the one running
//! the search. Late joiners get a catch-up snapshot of the last known
//! status per (uf, source) before live events.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::coord::SharedCoordination;
use crate::error::CoordinationUnavailable;
use crate::model::ProgressEvent;

pub struct ProgressBroadcaster {
    coord: SharedCoordination,
    /// Snapshot/channel lifetime beyond the search itself.
    grace: Duration,
}

impl ProgressBroadcaster {
    pub fn new(coord: SharedCoordination, grace: Duration) -> Self {
        Self { coord, grace }
    }

    fn channel(search_id: &str) -> String {
        format!("progress:{search_id}")
    }

    fn snapshot_key(search_id: &str) -> String {
        format!("progress:{search_id}:snap")
    }

    /// Producer handle for one search. A single publisher owns the snapshot,
    /// so writing it whole on every event is one atomic key set.
    pub fn publisher(
        &self,
        search_id: &str,
        expected_duration: Duration,
    ) -> ProgressPublisher {
        ProgressPublisher {
            coord: self.coord.clone(),
            search_id: search_id.to_string(),
            snapshot: Mutex::new(BTreeMap::new()),
            snapshot_ttl: expected_duration + self.grace,
        }
    }

    /// Attach a consumer: replays the current snapshot (events already
    /// observed), then forwards live events until the channel dies.
    pub async fn subscribe(
        &self,
        search_id: &str,
    ) -> Result<mpsc::Receiver<ProgressEvent>, CoordinationUnavailable> {
        // Subscribe before reading the snapshot so nothing falls in the gap;
        // an event seen in both is delivered twice, which only re-states the
        // same status.
        let mut live = self.coord.subscribe(&Self::channel(search_id)).await?;

        let snapshot: Vec<ProgressEvent> = match self
            .coord
            .get(&Self::snapshot_key(search_id))
            .await?
        {
            Some(json) => match serde_json::from_str::<BTreeMap<String, ProgressEvent>>(&json) {
                Ok(map) => map.into_values().collect(),
                Err(e) => {
                    warn!(search_id, error = %e, "unreadable progress snapshot; skipping catch-up");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            for event in snapshot {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            while let Some(payload) = live.recv().await {
                match serde_json::from_str::<ProgressEvent>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping unparseable progress payload"),
                }
            }
        });
        Ok(rx)
    }
}

/// Producer side for one search. Region events must go through one
/// publisher to keep per-region causal order.
pub struct ProgressPublisher {
    coord: SharedCoordination,
    search_id: String,
    snapshot: Mutex<BTreeMap<String, ProgressEvent>>,
    snapshot_ttl: Duration,
}

impl ProgressPublisher {
    fn region_tag(event: &ProgressEvent) -> String {
        format!("{}:{}", event.uf, event.source)
    }

    /// Record the event in the snapshot, persist it, then publish. Both
    /// writes are best-effort: progress is ephemeral and must never fail
    /// the search.
    ///
    /// The lock is held across the snapshot write so concurrent region
    /// tasks cannot interleave their key sets and leave a stale snapshot
    /// as the last one persisted.
    pub async fn publish(&self, event: ProgressEvent) {
        {
            let mut snap = self.snapshot.lock().await;
            snap.insert(Self::region_tag(&event), event.clone());
            let snapshot_json =
                serde_json::to_string(&*snap).unwrap_or_else(|_| "{}".to_string());
            let key = ProgressBroadcaster::snapshot_key(&self.search_id);
            if let Err(e) = self
                .coord
                .set(&key, &snapshot_json, Some(self.snapshot_ttl))
                .await
            {
                warn!(search_id = %self.search_id, error = %e, "progress snapshot write failed");
            }
        }

        let channel = ProgressBroadcaster::channel(&self.search_id);
        let payload = match serde_json::to_string(&event) {
            Ok(p) => p,
            Err(_) => return,
        };
        if let Err(e) = self.coord.publish(&channel, &payload).await {
            warn!(search_id = %self.search_id, error = %e, "progress publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::LocalCoordination;
    use crate::model::{ProgressStatus, Uf};
    use std::sync::Arc;

    fn event(uf: Uf, source: &str, status: ProgressStatus, found: usize) -> ProgressEvent {
        ProgressEvent {
            search_id: "s1".to_string(),
            uf,
            source: source.to_string(),
            status,
            found,
            message: None,
        }
    }

    fn broadcaster() -> ProgressBroadcaster {
        ProgressBroadcaster::new(Arc::new(LocalCoordination::new()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn live_events_arrive_in_causal_order_per_region() {
        let b = broadcaster();
        let publisher = b.publisher("s1", Duration::from_secs(10));
        let mut rx = b.subscribe("s1").await.unwrap();

        publisher.publish(event(Uf::SP, "pncp", ProgressStatus::Pending, 0)).await;
        publisher.publish(event(Uf::SP, "pncp", ProgressStatus::Fetching, 0)).await;
        publisher.publish(event(Uf::SP, "pncp", ProgressStatus::Done, 12)).await;

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let e = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            statuses.push(e.status);
        }
        assert_eq!(
            statuses,
            vec![ProgressStatus::Pending, ProgressStatus::Fetching, ProgressStatus::Done]
        );
    }

    #[tokio::test]
    async fn late_subscriber_gets_catchup_snapshot() {
        let b = broadcaster();
        let publisher = b.publisher("s2", Duration::from_secs(10));

        // All events published before anyone subscribes.
        let mut e1 = event(Uf::SP, "pncp", ProgressStatus::Done, 5);
        e1.search_id = "s2".to_string();
        let mut e2 = event(Uf::RJ, "pncp", ProgressStatus::Fetching, 0);
        e2.search_id = "s2".to_string();
        publisher.publish(e1).await;
        publisher.publish(e2).await;

        let mut rx = b.subscribe("s2").await.unwrap();
        let mut got = Vec::new();
        for _ in 0..2 {
            let e = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            got.push((e.uf, e.status));
        }
        got.sort_by_key(|(uf, _)| *uf);
        assert_eq!(
            got,
            vec![(Uf::RJ, ProgressStatus::Fetching), (Uf::SP, ProgressStatus::Done)]
        );
    }

    #[tokio::test]
    async fn concurrent_region_publishes_all_land_in_snapshot() {
        let b = broadcaster();
        let publisher = Arc::new(b.publisher("s4", Duration::from_secs(10)));

        // Many region tasks racing on the same publisher; the persisted
        // snapshot must end up containing every region, not whichever
        // write happened to finish last.
        let regions = [Uf::SP, Uf::RJ, Uf::MG, Uf::BA, Uf::RS, Uf::PR, Uf::SC, Uf::PE];
        let mut handles = Vec::new();
        for uf in regions {
            let publisher = publisher.clone();
            handles.push(tokio::spawn(async move {
                let mut e = event(uf, "pncp", ProgressStatus::Done, 1);
                e.search_id = "s4".to_string();
                publisher.publish(e).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut rx = b.subscribe("s4").await.unwrap();
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..regions.len() {
            let e = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.insert(e.uf);
        }
        assert_eq!(seen.len(), regions.len());
    }

    #[tokio::test]
    async fn snapshot_keeps_only_latest_status_per_region() {
        let b = broadcaster();
        let publisher = b.publisher("s3", Duration::from_secs(10));
        for status in [ProgressStatus::Pending, ProgressStatus::Fetching, ProgressStatus::Done] {
            let mut e = event(Uf::MG, "comprasnet", status, 0);
            e.search_id = "s3".to_string();
            publisher.publish(e).await;
        }

        let mut rx = b.subscribe("s3").await.unwrap();
        let e = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(e.status, ProgressStatus::Done);
        // Nothing further: snapshot collapsed the three events into one.
        let next = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(next.is_err());
    }
}
