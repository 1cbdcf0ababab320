//! In-process backends. Same contracts as [`crate::pg`], no database required.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::Value as JsonValue;
use tenders_core::{
    LabelCount, Pagination, SortKey, SortOrder, SyncRun, SyncRunStatus, TenderPage, TenderQuery, TenderRecord,
    TenderStats,
};
use tokio::sync::Mutex;

use crate::{
    dedupe_by_ocid, non_empty, to_i64, StoreError, SyncRunTracker, TenderStore, TrackerError, UpsertError,
    ABANDONED_RUN_MESSAGE,
};

#[derive(Debug, Clone, Default)]
pub struct MemoryTenderStore {
    tenders: Arc<Mutex<BTreeMap<String, TenderRecord>>>,
}

impl MemoryTenderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn keyword_matches(record: &TenderRecord, keyword: &str) -> bool {
    let haystack = [
        record.title.as_str(),
        record.description.as_str(),
        record.buyer_name.as_str(),
        record.procuring_entity_name.as_str(),
        record.category.as_str(),
        record.province.as_str(),
    ]
    .join(" ")
    .to_lowercase();

    keyword
        .split_whitespace()
        .all(|term| haystack.contains(&term.to_lowercase()))
}

fn matches(record: &TenderRecord, query: &TenderQuery) -> bool {
    if let Some(keyword) = query.keyword_filter() {
        if !keyword_matches(record, keyword) {
            return false;
        }
    }
    if let Some(province) = query.province_filter() {
        if record.province.to_lowercase() != province.to_lowercase() {
            return false;
        }
    }
    if let Some(status) = query.status_filter() {
        if record.status.to_lowercase() != status.to_lowercase() {
            return false;
        }
    }
    true
}

/// Sort value for a record. `None` sorts last regardless of direction.
#[derive(Debug, PartialEq, PartialOrd)]
enum SortValue<'a> {
    Text(&'a str),
    Time(chrono::DateTime<Utc>),
    Number(f64),
}

fn sort_value(record: &TenderRecord, key: SortKey) -> Option<SortValue<'_>> {
    match key {
        SortKey::ReleaseDate => record.release_date.map(SortValue::Time),
        SortKey::TenderPeriodEnd => record.tender_period_end.map(SortValue::Time),
        SortKey::TenderPeriodStart => record.tender_period_start.map(SortValue::Time),
        SortKey::SyncedAt => record.synced_at.map(SortValue::Time),
        SortKey::TotalAwardValue => Some(SortValue::Number(record.total_award_value)),
        SortKey::Title => non_empty(&record.title).map(SortValue::Text),
        SortKey::BuyerName => non_empty(&record.buyer_name).map(SortValue::Text),
        SortKey::Status => non_empty(&record.status).map(SortValue::Text),
        SortKey::Province => non_empty(&record.province).map(SortValue::Text),
    }
}

fn compare(a: &TenderRecord, b: &TenderRecord, key: SortKey, order: SortOrder) -> Ordering {
    let primary = match (sort_value(a, key), sort_value(b, key)) {
        (Some(x), Some(y)) => {
            let ord = x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    primary.then_with(|| a.ocid.cmp(&b.ocid))
}

fn label_counts<'a>(labels: impl Iterator<Item = &'a str>, limit: Option<usize>) -> Vec<LabelCount> {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for label in labels.filter(|l| !l.is_empty()) {
        *counts.entry(label).or_default() += 1;
    }
    let mut out = counts
        .into_iter()
        .map(|(label, count)| LabelCount {
            label: label.to_string(),
            count,
        })
        .collect::<Vec<_>>();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
    if let Some(limit) = limit {
        out.truncate(limit);
    }
    out
}

#[async_trait]
impl TenderStore for MemoryTenderStore {
    async fn upsert_batch(&self, records: &[TenderRecord]) -> Result<usize, UpsertError> {
        let unique = dedupe_by_ocid(records);
        let now = Utc::now();
        let mut tenders = self.tenders.lock().await;
        for record in &unique {
            let mut stored = (*record).clone();
            stored.synced_at = Some(now);
            tenders.insert(stored.ocid.clone(), stored);
        }
        Ok(unique.len())
    }

    async fn count(&self) -> Result<i64, StoreError> {
        Ok(self.tenders.lock().await.len() as i64)
    }

    async fn get(&self, ocid: &str) -> Result<Option<TenderRecord>, StoreError> {
        Ok(self.tenders.lock().await.get(ocid).cloned())
    }

    async fn raw_release(&self, ocid: &str) -> Result<Option<JsonValue>, StoreError> {
        Ok(self
            .tenders
            .lock()
            .await
            .get(ocid)
            .map(|record| record.raw_release.clone()))
    }

    async fn list(&self, query: &TenderQuery) -> Result<TenderPage, StoreError> {
        let tenders = self.tenders.lock().await;
        let mut hits = tenders.values().filter(|r| matches(r, query)).collect::<Vec<_>>();
        hits.sort_by(|a, b| compare(a, b, query.sort_by, query.order));

        let total = hits.len() as u64;
        let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
        let page = hits
            .into_iter()
            .skip(offset)
            .take(query.limit as usize)
            .map(TenderRecord::summary)
            .collect();

        Ok(TenderPage {
            tenders: page,
            pagination: Pagination::new(query.page, query.limit, total),
        })
    }

    async fn stats(&self) -> Result<TenderStats, StoreError> {
        let tenders = self.tenders.lock().await;
        let unique_entities = tenders
            .values()
            .map(|r| r.buyer_name.as_str())
            .filter(|name| !name.is_empty())
            .collect::<HashSet<_>>()
            .len();

        Ok(TenderStats::from_facets(
            tenders.len() as i64,
            label_counts(tenders.values().map(|r| r.status.as_str()), None),
            label_counts(tenders.values().map(|r| r.province.as_str()), None),
            label_counts(tenders.values().map(|r| r.category.as_str()), Some(10)),
            unique_entities as i64,
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySyncRunTracker {
    runs: Arc<Mutex<Vec<SyncRun>>>,
}

impl MemorySyncRunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every run recorded so far, oldest first.
    pub async fn runs(&self) -> Vec<SyncRun> {
        self.runs.lock().await.clone()
    }

    /// Insert a run as-is. Test setup for stale-run handling.
    pub async fn insert_run(&self, run: SyncRun) {
        self.runs.lock().await.push(run);
    }

    async fn with_running<F>(&self, run_id: i64, update: F) -> Result<(), TrackerError>
    where
        F: FnOnce(&mut SyncRun) + Send,
    {
        let mut runs = self.runs.lock().await;
        let run = runs
            .iter_mut()
            .find(|r| r.id == run_id && r.status == SyncRunStatus::Running)
            .ok_or(TrackerError::NotRunning { run_id })?;
        update(run);
        Ok(())
    }
}

fn sorted_newest_first(runs: &[SyncRun]) -> Vec<SyncRun> {
    let mut out = runs.to_vec();
    out.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
    out
}

#[async_trait]
impl SyncRunTracker for MemorySyncRunTracker {
    async fn is_running(&self) -> Result<bool, TrackerError> {
        Ok(self
            .runs
            .lock()
            .await
            .iter()
            .any(|r| r.status == SyncRunStatus::Running))
    }

    async fn start(&self, date_from: NaiveDate, date_to: NaiveDate) -> Result<i64, TrackerError> {
        let mut runs = self.runs.lock().await;
        if runs.iter().any(|r| r.status == SyncRunStatus::Running) {
            return Err(TrackerError::AlreadyRunning);
        }
        let id = runs.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        runs.push(SyncRun {
            id,
            status: SyncRunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            date_from: Some(date_from),
            date_to: Some(date_to),
            tenders_fetched: 0,
            tenders_upserted: 0,
            duration_ms: None,
            error_message: None,
        });
        Ok(id)
    }

    async fn record_progress(&self, run_id: i64, fetched: u64, upserted: u64) -> Result<(), TrackerError> {
        self.with_running(run_id, |run| {
            run.tenders_fetched = to_i64(fetched);
            run.tenders_upserted = to_i64(upserted);
        })
        .await
    }

    async fn record_success(
        &self,
        run_id: i64,
        fetched: u64,
        upserted: u64,
        duration_ms: u64,
    ) -> Result<(), TrackerError> {
        self.with_running(run_id, |run| {
            run.status = SyncRunStatus::Success;
            run.completed_at = Some(Utc::now());
            run.tenders_fetched = to_i64(fetched);
            run.tenders_upserted = to_i64(upserted);
            run.duration_ms = Some(to_i64(duration_ms));
        })
        .await
    }

    async fn record_failure(&self, run_id: i64, error_message: &str, duration_ms: u64) -> Result<(), TrackerError> {
        let message = error_message.to_string();
        self.with_running(run_id, move |run| {
            run.status = SyncRunStatus::Error;
            run.completed_at = Some(Utc::now());
            run.error_message = Some(message);
            run.duration_ms = Some(to_i64(duration_ms));
        })
        .await
    }

    async fn record_cancelled(&self, run_id: i64, duration_ms: u64) -> Result<(), TrackerError> {
        self.with_running(run_id, |run| {
            run.status = SyncRunStatus::Cancelled;
            run.completed_at = Some(Utc::now());
            run.duration_ms = Some(to_i64(duration_ms));
        })
        .await
    }

    async fn latest(&self) -> Result<Option<SyncRun>, TrackerError> {
        let runs = self.runs.lock().await;
        Ok(sorted_newest_first(&runs).into_iter().next())
    }

    async fn history(&self, limit: u32) -> Result<Vec<SyncRun>, TrackerError> {
        let runs = self.runs.lock().await;
        let mut out = sorted_newest_first(&runs);
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn fail_stale(&self, older_than: chrono::Duration) -> Result<u64, TrackerError> {
        let now = Utc::now();
        let cutoff = now - older_than;
        let mut closed = 0u64;
        for run in self.runs.lock().await.iter_mut() {
            if run.status == SyncRunStatus::Running && run.started_at < cutoff {
                run.status = SyncRunStatus::Error;
                run.completed_at = Some(now);
                run.error_message = Some(ABANDONED_RUN_MESSAGE.to_string());
                run.duration_ms = Some((now - run.started_at).num_milliseconds());
                closed += 1;
            }
        }
        Ok(closed)
    }
}
