//! Postgres-backed tender store and sync-run tracker.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tenders_core::{
    LabelCount, Pagination, SyncRun, SyncRunStatus, TenderPage, TenderQuery, TenderRecord, TenderStats,
    TenderSummary,
};

use crate::{
    dedupe_by_ocid, non_empty, to_i64, upsert_in_chunks, StoreError, SyncRunTracker, TenderStore, TrackerError,
    UpsertError, ABANDONED_RUN_MESSAGE, UPSERT_CHUNK_SIZE,
};

/// Written columns, in bind order. `synced_at` is always `NOW()`.
const TENDER_COLUMNS: [&str; 33] = [
    "ocid",
    "release_id",
    "release_date",
    "tender_id",
    "title",
    "status",
    "category",
    "province",
    "delivery_location",
    "special_conditions",
    "main_procurement_category",
    "description",
    "procurement_method",
    "procurement_method_details",
    "estimated_value",
    "currency",
    "tender_period_start",
    "tender_period_end",
    "buyer_id",
    "buyer_name",
    "procuring_entity_id",
    "procuring_entity_name",
    "contact_name",
    "contact_email",
    "contact_phone",
    "briefing_is_session",
    "briefing_compulsory",
    "briefing_date",
    "briefing_venue",
    "document_count",
    "award_count",
    "total_award_value",
    "raw_release",
];

const SUMMARY_COLUMNS: &str = r#"
    ocid, release_id, release_date, tender_id, title, status, category,
    province, delivery_location, special_conditions, main_procurement_category, description,
    procurement_method, procurement_method_details,
    estimated_value, currency, tender_period_start, tender_period_end,
    buyer_id, buyer_name, procuring_entity_id, procuring_entity_name,
    contact_name, contact_email, contact_phone,
    briefing_is_session, briefing_compulsory, briefing_date, briefing_venue,
    document_count, award_count, total_award_value, synced_at
"#;

const SYNC_RUN_COLUMNS: &str = r#"
    id, status, started_at, completed_at, date_from, date_to,
    tenders_fetched, tenders_upserted, duration_ms, error_message
"#;

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the embedded schema migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

fn written_columns() -> impl Iterator<Item = &'static str> {
    TENDER_COLUMNS.into_iter()
}

fn insert_prefix() -> String {
    let columns = written_columns().collect::<Vec<_>>().join(", ");
    format!("INSERT INTO tenders ({columns}, synced_at) ")
}

fn conflict_clause() -> String {
    let updates = written_columns()
        .filter(|c| *c != "ocid")
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(" ON CONFLICT (ocid) DO UPDATE SET {updates}, synced_at = NOW()")
}

#[derive(Debug, Clone)]
pub struct PgTenderStore {
    pool: PgPool,
}

impl PgTenderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_chunk(&self, chunk: &[&TenderRecord]) -> Result<(), sqlx::Error> {
        let mut qb = QueryBuilder::<Postgres>::new(insert_prefix());
        qb.push_values(chunk.iter().copied(), |mut row, r| {
            row.push_bind(r.ocid.as_str())
                .push_bind(r.release_id.as_str())
                .push_bind(r.release_date)
                .push_bind(non_empty(&r.tender_id))
                .push_bind(non_empty(&r.title))
                .push_bind(non_empty(&r.status))
                .push_bind(non_empty(&r.category))
                .push_bind(non_empty(&r.province))
                .push_bind(non_empty(&r.delivery_location))
                .push_bind(non_empty(&r.special_conditions))
                .push_bind(non_empty(&r.main_procurement_category))
                .push_bind(non_empty(&r.description))
                .push_bind(non_empty(&r.procurement_method))
                .push_bind(non_empty(&r.procurement_method_details))
                .push_bind(r.estimated_value)
                .push_bind(r.currency.as_str())
                .push_bind(r.tender_period_start)
                .push_bind(r.tender_period_end)
                .push_bind(non_empty(&r.buyer_id))
                .push_bind(non_empty(&r.buyer_name))
                .push_bind(non_empty(&r.procuring_entity_id))
                .push_bind(non_empty(&r.procuring_entity_name))
                .push_bind(non_empty(&r.contact_name))
                .push_bind(non_empty(&r.contact_email))
                .push_bind(non_empty(&r.contact_phone))
                .push_bind(r.briefing_is_session)
                .push_bind(r.briefing_compulsory)
                .push_bind(r.briefing_date)
                .push_bind(non_empty(&r.briefing_venue))
                .push_bind(r.document_count)
                .push_bind(r.award_count)
                .push_bind(r.total_award_value)
                .push_bind(&r.raw_release)
                .push("NOW()");
        });
        qb.push(conflict_clause());
        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}

/// Apply `WHERE` filters shared by the count and page queries.
fn push_filters<'a>(qb: &mut QueryBuilder<'a, Postgres>, query: &'a TenderQuery) {
    let mut joiner = " WHERE ";
    if let Some(keyword) = query.keyword_filter() {
        qb.push(joiner)
            .push("search_vector @@ plainto_tsquery('english', ")
            .push_bind(keyword)
            .push(")");
        joiner = " AND ";
    }
    if let Some(province) = query.province_filter() {
        qb.push(joiner).push("lower(province) = lower(").push_bind(province).push(")");
        joiner = " AND ";
    }
    if let Some(status) = query.status_filter() {
        qb.push(joiner).push("lower(status) = lower(").push_bind(status).push(")");
    }
}

#[derive(Debug, FromRow)]
struct TenderRow {
    ocid: String,
    release_id: String,
    release_date: Option<DateTime<Utc>>,
    tender_id: Option<String>,
    title: Option<String>,
    status: Option<String>,
    category: Option<String>,
    province: Option<String>,
    delivery_location: Option<String>,
    special_conditions: Option<String>,
    main_procurement_category: Option<String>,
    description: Option<String>,
    procurement_method: Option<String>,
    procurement_method_details: Option<String>,
    estimated_value: Option<f64>,
    currency: Option<String>,
    tender_period_start: Option<DateTime<Utc>>,
    tender_period_end: Option<DateTime<Utc>>,
    buyer_id: Option<String>,
    buyer_name: Option<String>,
    procuring_entity_id: Option<String>,
    procuring_entity_name: Option<String>,
    contact_name: Option<String>,
    contact_email: Option<String>,
    contact_phone: Option<String>,
    briefing_is_session: Option<bool>,
    briefing_compulsory: Option<bool>,
    briefing_date: Option<DateTime<Utc>>,
    briefing_venue: Option<String>,
    document_count: Option<i32>,
    award_count: Option<i32>,
    total_award_value: Option<f64>,
    #[sqlx(default)]
    raw_release: Option<JsonValue>,
    synced_at: DateTime<Utc>,
}

impl TenderRow {
    fn into_record(self) -> TenderRecord {
        TenderRecord {
            ocid: self.ocid,
            release_id: self.release_id,
            release_date: self.release_date,
            tender_id: self.tender_id.unwrap_or_default(),
            title: self.title.unwrap_or_default(),
            status: self.status.unwrap_or_default(),
            category: self.category.unwrap_or_default(),
            province: self.province.unwrap_or_default(),
            delivery_location: self.delivery_location.unwrap_or_default(),
            special_conditions: self.special_conditions.unwrap_or_default(),
            main_procurement_category: self.main_procurement_category.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            procurement_method: self.procurement_method.unwrap_or_default(),
            procurement_method_details: self.procurement_method_details.unwrap_or_default(),
            estimated_value: self.estimated_value.unwrap_or_default(),
            currency: self
                .currency
                .unwrap_or_else(|| tenders_core::HOME_CURRENCY.to_string()),
            tender_period_start: self.tender_period_start,
            tender_period_end: self.tender_period_end,
            buyer_id: self.buyer_id.unwrap_or_default(),
            buyer_name: self.buyer_name.unwrap_or_default(),
            procuring_entity_id: self.procuring_entity_id.unwrap_or_default(),
            procuring_entity_name: self.procuring_entity_name.unwrap_or_default(),
            contact_name: self.contact_name.unwrap_or_default(),
            contact_email: self.contact_email.unwrap_or_default(),
            contact_phone: self.contact_phone.unwrap_or_default(),
            briefing_is_session: self.briefing_is_session.unwrap_or_default(),
            briefing_compulsory: self.briefing_compulsory.unwrap_or_default(),
            briefing_date: self.briefing_date,
            briefing_venue: self.briefing_venue.unwrap_or_default(),
            document_count: self.document_count.unwrap_or_default(),
            award_count: self.award_count.unwrap_or_default(),
            total_award_value: self.total_award_value.unwrap_or_default(),
            raw_release: self.raw_release.unwrap_or(JsonValue::Null),
            synced_at: Some(self.synced_at),
        }
    }
}

#[derive(Debug, FromRow)]
struct LabelCountRow {
    label: String,
    count: i64,
}

impl From<LabelCountRow> for LabelCount {
    fn from(row: LabelCountRow) -> Self {
        LabelCount {
            label: row.label,
            count: row.count,
        }
    }
}

async fn label_counts(pool: &PgPool, column: &str, limit: Option<i64>) -> Result<Vec<LabelCount>, StoreError> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "SELECT {column} AS label, COUNT(*) AS count FROM tenders \
         WHERE {column} IS NOT NULL AND {column} != '' \
         GROUP BY {column} ORDER BY count DESC, {column} ASC"
    ));
    if let Some(limit) = limit {
        qb.push(" LIMIT ").push_bind(limit);
    }
    let rows = qb.build_query_as::<LabelCountRow>().fetch_all(pool).await?;
    Ok(rows.into_iter().map(LabelCount::from).collect())
}

#[async_trait]
impl TenderStore for PgTenderStore {
    async fn upsert_batch(&self, records: &[TenderRecord]) -> Result<usize, UpsertError> {
        let unique = dedupe_by_ocid(records);
        upsert_in_chunks(&unique, UPSERT_CHUNK_SIZE, |chunk| async move {
            self.upsert_chunk(&chunk).await.map_err(StoreError::Database)
        })
        .await
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenders")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn get(&self, ocid: &str) -> Result<Option<TenderRecord>, StoreError> {
        let row = sqlx::query_as::<_, TenderRow>(&format!(
            "SELECT {SUMMARY_COLUMNS}, raw_release FROM tenders WHERE ocid = $1"
        ))
        .bind(ocid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TenderRow::into_record))
    }

    async fn raw_release(&self, ocid: &str) -> Result<Option<JsonValue>, StoreError> {
        let raw: Option<JsonValue> = sqlx::query_scalar("SELECT raw_release FROM tenders WHERE ocid = $1 LIMIT 1")
            .bind(ocid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(raw)
    }

    async fn list(&self, query: &TenderQuery) -> Result<TenderPage, StoreError> {
        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM tenders");
        push_filters(&mut count_qb, query);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {SUMMARY_COLUMNS} FROM tenders"));
        push_filters(&mut qb, query);
        qb.push(format!(
            " ORDER BY {} {} NULLS LAST, ocid ASC",
            query.sort_by.column(),
            query.order.as_sql()
        ));
        qb.push(" LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(to_i64(query.offset()));

        let rows = qb.build_query_as::<TenderRow>().fetch_all(&self.pool).await?;
        let tenders = rows
            .into_iter()
            .map(|row| row.into_record().summary())
            .collect::<Vec<TenderSummary>>();

        Ok(TenderPage {
            tenders,
            pagination: Pagination::new(query.page, query.limit, u64::try_from(total).unwrap_or_default()),
        })
    }

    async fn stats(&self) -> Result<TenderStats, StoreError> {
        let total = self.count().await?;
        let by_status = label_counts(&self.pool, "status", None).await?;
        let by_province = label_counts(&self.pool, "province", None).await?;
        let by_category = label_counts(&self.pool, "category", Some(10)).await?;
        let unique_entities: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT buyer_name)
              FROM tenders
             WHERE buyer_name IS NOT NULL AND buyer_name != ''
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TenderStats::from_facets(
            total,
            by_status,
            by_province,
            by_category,
            unique_entities,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct PgSyncRunTracker {
    pool: PgPool,
}

impl PgSyncRunTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn finish(
        &self,
        run_id: i64,
        status: SyncRunStatus,
        counts: Option<(u64, u64)>,
        error_message: Option<&str>,
        duration_ms: u64,
    ) -> Result<(), TrackerError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_log
               SET status = $2,
                   completed_at = NOW(),
                   tenders_fetched = COALESCE($3, tenders_fetched),
                   tenders_upserted = COALESCE($4, tenders_upserted),
                   error_message = $5,
                   duration_ms = $6
             WHERE id = $1
               AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(counts.map(|(fetched, _)| to_i64(fetched)))
        .bind(counts.map(|(_, upserted)| to_i64(upserted)))
        .bind(error_message)
        .bind(to_i64(duration_ms))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TrackerError::NotRunning { run_id });
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct SyncRunRow {
    id: i64,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    tenders_fetched: i64,
    tenders_upserted: i64,
    duration_ms: Option<i64>,
    error_message: Option<String>,
}

impl TryFrom<SyncRunRow> for SyncRun {
    type Error = StoreError;

    fn try_from(row: SyncRunRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<SyncRunStatus>()
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        Ok(SyncRun {
            id: row.id,
            status,
            started_at: row.started_at,
            completed_at: row.completed_at,
            date_from: row.date_from,
            date_to: row.date_to,
            tenders_fetched: row.tenders_fetched,
            tenders_upserted: row.tenders_upserted,
            duration_ms: row.duration_ms,
            error_message: row.error_message,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505")
}

#[async_trait]
impl SyncRunTracker for PgSyncRunTracker {
    async fn is_running(&self) -> Result<bool, TrackerError> {
        let running: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM sync_log WHERE status = 'running')")
            .fetch_one(&self.pool)
            .await?;
        Ok(running)
    }

    async fn start(&self, date_from: NaiveDate, date_to: NaiveDate) -> Result<i64, TrackerError> {
        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO sync_log (status, date_from, date_to)
            VALUES ('running', $1, $2)
            RETURNING id
            "#,
        )
        .bind(date_from)
        .bind(date_to)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(id) => Ok(id),
            // sync_log_single_running rejects a second open run.
            Err(err) if is_unique_violation(&err) => Err(TrackerError::AlreadyRunning),
            Err(err) => Err(err.into()),
        }
    }

    async fn record_progress(&self, run_id: i64, fetched: u64, upserted: u64) -> Result<(), TrackerError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_log
               SET tenders_fetched = $2,
                   tenders_upserted = $3
             WHERE id = $1
               AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(to_i64(fetched))
        .bind(to_i64(upserted))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TrackerError::NotRunning { run_id });
        }
        Ok(())
    }

    async fn record_success(
        &self,
        run_id: i64,
        fetched: u64,
        upserted: u64,
        duration_ms: u64,
    ) -> Result<(), TrackerError> {
        self.finish(run_id, SyncRunStatus::Success, Some((fetched, upserted)), None, duration_ms)
            .await
    }

    async fn record_failure(&self, run_id: i64, error_message: &str, duration_ms: u64) -> Result<(), TrackerError> {
        self.finish(run_id, SyncRunStatus::Error, None, Some(error_message), duration_ms)
            .await
    }

    async fn record_cancelled(&self, run_id: i64, duration_ms: u64) -> Result<(), TrackerError> {
        self.finish(run_id, SyncRunStatus::Cancelled, None, None, duration_ms)
            .await
    }

    async fn latest(&self) -> Result<Option<SyncRun>, TrackerError> {
        let row = sqlx::query_as::<_, SyncRunRow>(&format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM sync_log ORDER BY started_at DESC, id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SyncRun::try_from).transpose()?)
    }

    async fn history(&self, limit: u32) -> Result<Vec<SyncRun>, TrackerError> {
        let rows = sqlx::query_as::<_, SyncRunRow>(&format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM sync_log ORDER BY started_at DESC, id DESC LIMIT $1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        let runs = rows
            .into_iter()
            .map(SyncRun::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    async fn fail_stale(&self, older_than: chrono::Duration) -> Result<u64, TrackerError> {
        let cutoff = Utc::now() - older_than;
        let result = sqlx::query(
            r#"
            UPDATE sync_log
               SET status = 'error',
                   completed_at = NOW(),
                   error_message = $2,
                   duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT
             WHERE status = 'running'
               AND started_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(ABANDONED_RUN_MESSAGE)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
