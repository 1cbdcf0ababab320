use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::{json, Value as JsonValue};
use tenders_adapters::{ReleasePage, ReleaseSource};
use tenders_core::{SyncRun, SyncRunStatus, TenderPage, TenderQuery, TenderRecord, TenderStats};
use tenders_storage::{
    FetchError, MemorySyncRunTracker, MemoryTenderStore, StoreError, SyncRunTracker, TenderStore, UpsertError,
};
use tenders_sync::{SyncError, SyncPipeline, SyncSettings};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

enum Scripted {
    Page(ReleasePage),
    Status(u16, &'static str),
}

#[derive(Default)]
struct ScriptedSource {
    responses: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<(u32, u32)>>,
    cancel_on_first_fetch: Option<CancellationToken>,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl ScriptedSource {
    fn new(responses: Vec<Scripted>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    fn requests(&self) -> Vec<(u32, u32)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReleaseSource for ScriptedSource {
    async fn fetch_page(
        &self,
        page_number: u32,
        page_size: u32,
        _date_from: NaiveDate,
        _date_to: NaiveDate,
    ) -> Result<ReleasePage, FetchError> {
        self.requests.lock().unwrap().push((page_number, page_size));
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        if page_number == 1 {
            if let Some(cancel) = &self.cancel_on_first_fetch {
                cancel.cancel();
            }
        }
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Page(page)) => Ok(page),
            Some(Scripted::Status(status, body)) => Err(FetchError::HttpStatus {
                status,
                url: "http://upstream.test/api/OCDSReleases".to_string(),
                body: body.to_string(),
            }),
            None => Ok(ReleasePage::default()),
        }
    }
}

/// Accepts nothing; reports a partial write of `written` records.
struct FailingStore {
    written: usize,
}

#[async_trait]
impl TenderStore for FailingStore {
    async fn upsert_batch(&self, _records: &[TenderRecord]) -> Result<usize, UpsertError> {
        Err(UpsertError {
            written: self.written,
            source: StoreError::Backend("disk full".to_string()),
        })
    }

    async fn count(&self) -> Result<i64, StoreError> {
        Ok(0)
    }

    async fn get(&self, _ocid: &str) -> Result<Option<TenderRecord>, StoreError> {
        Ok(None)
    }

    async fn raw_release(&self, _ocid: &str) -> Result<Option<JsonValue>, StoreError> {
        Ok(None)
    }

    async fn list(&self, _query: &TenderQuery) -> Result<TenderPage, StoreError> {
        Err(StoreError::Backend("unsupported".to_string()))
    }

    async fn stats(&self) -> Result<TenderStats, StoreError> {
        Ok(TenderStats::default())
    }
}

fn release(ocid: &str, title: &str) -> JsonValue {
    json!({
        "ocid": ocid,
        "id": format!("{ocid}-release"),
        "date": "2025-01-15T09:30:00Z",
        "tender": { "title": title, "status": "active", "province": "Gauteng" }
    })
}

fn page(ocids: &[&str], has_next_page: bool) -> Scripted {
    Scripted::Page(ReleasePage {
        releases: ocids.iter().map(|ocid| release(ocid, "Water treatment chemicals")).collect(),
        has_next_page,
    })
}

struct Harness {
    source: Arc<ScriptedSource>,
    store: MemoryTenderStore,
    tracker: MemorySyncRunTracker,
    pipeline: SyncPipeline,
}

fn harness_with(source: ScriptedSource, settings: SyncSettings) -> Harness {
    let source = Arc::new(source);
    let store = MemoryTenderStore::new();
    let tracker = MemorySyncRunTracker::new();
    let pipeline = SyncPipeline::new(
        source.clone(),
        Arc::new(store.clone()),
        Arc::new(tracker.clone()),
        settings,
    );
    Harness {
        source,
        store,
        tracker,
        pipeline,
    }
}

fn harness(responses: Vec<Scripted>) -> Harness {
    harness_with(ScriptedSource::new(responses), SyncSettings::default())
}

#[tokio::test]
async fn pages_until_upstream_runs_dry() {
    let h = harness(vec![page(&["ocds-1", "ocds-2", "ocds-3"], true), page(&[], false)]);

    let result = h.pipeline.run().await.unwrap();

    assert_eq!(result.status, SyncRunStatus::Success);
    assert_eq!((result.fetched, result.upserted), (3, 3));
    assert_eq!(result.error, None);
    assert_eq!(h.store.count().await.unwrap(), 3);
    assert_eq!(h.source.requests(), vec![(1, 1000), (2, 1000)]);

    let run = h.tracker.latest().await.unwrap().unwrap();
    assert_eq!(run.id, result.run_id);
    assert_eq!(run.status, SyncRunStatus::Success);
    assert_eq!((run.tenders_fetched, run.tenders_upserted), (3, 3));
    assert!(run.completed_at.is_some());
    assert!(run.date_from < run.date_to);
}

#[tokio::test]
async fn missing_next_link_stops_after_one_page() {
    let h = harness(vec![page(&["ocds-1"], false), page(&["ocds-2"], false)]);

    let result = h.pipeline.run().await.unwrap();

    assert_eq!(result.fetched, 1);
    assert_eq!(h.source.requests().len(), 1);
}

#[tokio::test]
async fn upstream_error_on_first_page_is_reported_not_raised() {
    let h = harness(vec![Scripted::Status(500, "internal error")]);

    let result = h.pipeline.run().await.unwrap();

    assert_eq!(result.status, SyncRunStatus::Error);
    assert_eq!((result.fetched, result.upserted), (0, 0));
    let message = result.error.unwrap();
    assert!(message.contains("500"), "{message}");

    let run = h.tracker.latest().await.unwrap().unwrap();
    assert_eq!(run.status, SyncRunStatus::Error);
    assert_eq!(run.error_message.as_deref(), Some(message.as_str()));
    assert!(run.duration_ms.is_some());
    assert!(!h.tracker.is_running().await.unwrap());
}

#[tokio::test]
async fn mid_run_failure_keeps_earlier_pages() {
    let h = harness(vec![page(&["ocds-1", "ocds-2"], true), Scripted::Status(503, "maintenance")]);

    let result = h.pipeline.run().await.unwrap();

    assert_eq!(result.status, SyncRunStatus::Error);
    assert_eq!((result.fetched, result.upserted), (2, 2));
    assert_eq!(h.store.count().await.unwrap(), 2);

    let run = h.tracker.latest().await.unwrap().unwrap();
    assert_eq!((run.tenders_fetched, run.tenders_upserted), (2, 2));
}

#[tokio::test]
async fn later_release_of_the_same_ocid_wins() {
    let source = ScriptedSource::new(vec![
        Scripted::Page(ReleasePage {
            releases: vec![release("ocds-1", "Original title")],
            has_next_page: false,
        }),
        Scripted::Page(ReleasePage {
            releases: vec![release("ocds-1", "Amended title")],
            has_next_page: false,
        }),
    ]);
    let h = harness_with(source, SyncSettings::default());

    h.pipeline.run().await.unwrap();
    let first = h.store.get("ocds-1").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.pipeline.run().await.unwrap();

    assert_eq!(h.store.count().await.unwrap(), 1);
    let second = h.store.get("ocds-1").await.unwrap().unwrap();
    assert_eq!(second.title, "Amended title");
    assert!(second.synced_at > first.synced_at);
    assert_eq!(second.raw_release["tender"]["title"], "Amended title");
}

#[tokio::test]
async fn rerunning_the_same_data_is_idempotent() {
    let h = harness(vec![page(&["ocds-1", "ocds-2"], false), page(&["ocds-1", "ocds-2"], false)]);

    h.pipeline.run().await.unwrap();
    let before = h.store.get("ocds-2").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let result = h.pipeline.run().await.unwrap();

    assert_eq!(result.upserted, 2);
    assert_eq!(h.store.count().await.unwrap(), 2);
    let after = h.store.get("ocds-2").await.unwrap().unwrap();
    assert_eq!(
        TenderRecord {
            synced_at: None,
            ..after.clone()
        },
        TenderRecord {
            synced_at: None,
            ..before.clone()
        }
    );
    assert!(after.synced_at > before.synced_at);
    assert_eq!(h.tracker.history(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn target_total_caps_requests_and_truncates() {
    let settings = SyncSettings {
        target_total: 5,
        ..SyncSettings::default()
    };
    let source = ScriptedSource::new(vec![
        page(&["ocds-1", "ocds-2", "ocds-3"], true),
        page(&["ocds-4", "ocds-5", "ocds-6"], true),
        page(&["ocds-7"], true),
    ]);
    let h = harness_with(source, settings);

    let result = h.pipeline.run().await.unwrap();

    assert_eq!(result.status, SyncRunStatus::Success);
    assert_eq!(result.fetched, 5);
    assert_eq!(h.store.count().await.unwrap(), 5);
    assert!(h.store.get("ocds-6").await.unwrap().is_none());
    assert_eq!(h.source.requests(), vec![(1, 5), (2, 5)]);
}

/// Serves `total` releases paged by offset, the way the upstream does.
struct OffsetSource {
    total: usize,
    requests: Mutex<Vec<(u32, u32)>>,
}

#[async_trait]
impl ReleaseSource for OffsetSource {
    async fn fetch_page(
        &self,
        page_number: u32,
        page_size: u32,
        _date_from: NaiveDate,
        _date_to: NaiveDate,
    ) -> Result<ReleasePage, FetchError> {
        self.requests.lock().unwrap().push((page_number, page_size));
        let size = page_size as usize;
        let start = (page_number as usize - 1) * size;
        let end = (start + size).min(self.total);
        let releases = (start.min(end)..end)
            .map(|n| release(&format!("ocds-{n}"), "Road maintenance"))
            .collect();
        Ok(ReleasePage {
            releases,
            has_next_page: end < self.total,
        })
    }
}

#[tokio::test]
async fn cap_off_a_page_boundary_keeps_offsets_aligned() {
    let source = Arc::new(OffsetSource {
        total: 10,
        requests: Mutex::new(Vec::new()),
    });
    let store = MemoryTenderStore::new();
    let settings = SyncSettings {
        target_total: 5,
        page_size: 2,
        ..SyncSettings::default()
    };
    let pipeline = SyncPipeline::new(
        source.clone(),
        Arc::new(store.clone()),
        Arc::new(MemorySyncRunTracker::new()),
        settings,
    );

    let result = pipeline.run().await.unwrap();

    assert_eq!(result.fetched, 5);
    assert_eq!(result.upserted, 5);
    assert_eq!(store.count().await.unwrap(), 5);
    for n in 0..5 {
        assert!(store.get(&format!("ocds-{n}")).await.unwrap().is_some(), "ocds-{n} missing");
    }
    assert!(store.get("ocds-5").await.unwrap().is_none());
    assert_eq!(source.requests.lock().unwrap().clone(), vec![(1, 2), (2, 2), (3, 2)]);
}

#[tokio::test]
async fn releases_without_an_ocid_are_skipped() {
    let untitled = json!({ "id": "r-no-ocid-1", "tender": { "title": "Catering" } });
    let blank = json!({ "ocid": "", "id": "r-no-ocid-2", "tender": { "title": "Security" } });
    let h = harness(vec![Scripted::Page(ReleasePage {
        releases: vec![untitled, release("ocds-1", "Fencing"), blank],
        has_next_page: false,
    })]);

    let result = h.pipeline.run().await.unwrap();

    assert_eq!(result.status, SyncRunStatus::Success);
    assert_eq!(result.fetched, 3);
    assert_eq!(result.upserted, 1);
    assert_eq!(h.store.count().await.unwrap(), 1);
    assert!(h.store.get("").await.unwrap().is_none());
}

#[tokio::test]
async fn open_run_blocks_a_new_one() {
    let h = harness(vec![page(&["ocds-1"], false)]);
    let day = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    h.tracker.start(day, day).await.unwrap();

    let err = h.pipeline.run().await.unwrap_err();

    assert!(matches!(err, SyncError::AlreadyRunning));
    assert!(h.source.requests().is_empty());
    assert_eq!(h.tracker.runs().await.len(), 1);
}

#[tokio::test]
async fn concurrent_trigger_is_rejected_while_first_run_is_in_flight() {
    let entered = Arc::new(Notify::new());
    let release_gate = Arc::new(Notify::new());
    let source = ScriptedSource {
        responses: Mutex::new(vec![page(&["ocds-1"], false)].into()),
        gate: Some((entered.clone(), release_gate.clone())),
        ..ScriptedSource::default()
    };
    let h = harness_with(source, SyncSettings::default());
    let pipeline = Arc::new(h.pipeline);

    let first = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run().await }
    });
    entered.notified().await;

    let second = pipeline.run().await;
    assert!(matches!(second, Err(SyncError::AlreadyRunning)));

    release_gate.notify_one();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status, SyncRunStatus::Success);
    assert_eq!(h.tracker.runs().await.len(), 1);
}

#[tokio::test]
async fn cancellation_between_pages_keeps_counts() {
    let cancel = CancellationToken::new();
    let source = ScriptedSource {
        responses: Mutex::new(vec![page(&["ocds-1", "ocds-2", "ocds-3"], true), page(&["ocds-4"], false)].into()),
        cancel_on_first_fetch: Some(cancel.clone()),
        ..ScriptedSource::default()
    };
    let h = harness_with(source, SyncSettings::default());
    let pipeline = h.pipeline.with_cancellation(cancel);

    let result = pipeline.run().await.unwrap();

    assert_eq!(result.status, SyncRunStatus::Cancelled);
    assert_eq!((result.fetched, result.upserted), (3, 3));
    assert_eq!(h.source.requests().len(), 1);

    let run = h.tracker.latest().await.unwrap().unwrap();
    assert_eq!(run.status, SyncRunStatus::Cancelled);
    assert_eq!(run.tenders_upserted, 3);
    assert!(!h.tracker.is_running().await.unwrap());
}

fn abandoned_run() -> SyncRun {
    SyncRun {
        id: 41,
        status: SyncRunStatus::Running,
        started_at: Utc::now() - chrono::Duration::hours(2),
        completed_at: None,
        date_from: None,
        date_to: None,
        tenders_fetched: 120,
        tenders_upserted: 120,
        duration_ms: None,
        error_message: None,
    }
}

#[tokio::test]
async fn stale_running_rows_block_until_reaping_is_configured() {
    let h = harness(vec![page(&["ocds-1"], false)]);
    h.tracker.insert_run(abandoned_run()).await;
    assert!(matches!(h.pipeline.run().await, Err(SyncError::AlreadyRunning)));

    let settings = SyncSettings {
        stale_run_after: Some(chrono::Duration::minutes(30)),
        ..SyncSettings::default()
    };
    let pipeline = SyncPipeline::new(
        h.source.clone(),
        Arc::new(h.store.clone()),
        Arc::new(h.tracker.clone()),
        settings,
    );
    let result = pipeline.run().await.unwrap();
    assert_eq!(result.status, SyncRunStatus::Success);

    let runs = h.tracker.runs().await;
    let reaped = runs.iter().find(|r| r.id == 41).unwrap();
    assert_eq!(reaped.status, SyncRunStatus::Error);
    assert!(reaped.error_message.as_deref().unwrap().starts_with("abandoned"));
}

#[tokio::test]
async fn partial_upsert_failure_reports_written_count() {
    let source = Arc::new(ScriptedSource::new(vec![page(&["ocds-1", "ocds-2", "ocds-3"], true)]));
    let tracker = MemorySyncRunTracker::new();
    let pipeline = SyncPipeline::new(
        source,
        Arc::new(FailingStore { written: 2 }),
        Arc::new(tracker.clone()),
        SyncSettings::default(),
    );

    let result = pipeline.run().await.unwrap();

    assert_eq!(result.status, SyncRunStatus::Error);
    assert_eq!((result.fetched, result.upserted), (3, 2));
    assert!(result.error.unwrap().contains("disk full"));
    assert_eq!(tracker.latest().await.unwrap().unwrap().status, SyncRunStatus::Error);
}

#[tokio::test]
async fn status_reports_count_and_last_run() {
    let h = harness(vec![page(&["ocds-1", "ocds-2"], false)]);

    let before = h.pipeline.status().await.unwrap();
    assert_eq!(before.tender_count, 0);
    assert!(before.last_run.is_none());

    h.pipeline.run().await.unwrap();

    let after = h.pipeline.status().await.unwrap();
    assert_eq!(after.tender_count, 2);
    assert!(!after.is_running);
    assert_eq!(after.last_run.unwrap().status, SyncRunStatus::Success);
}
