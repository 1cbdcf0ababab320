//! Core domain model for the tender index: normalized tender records, sync-run
//! bookkeeping and the read-side query/statistics contracts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "tenders-core";

/// Currency assumed when a release carries no tender value currency.
pub const HOME_CURRENCY: &str = "ZAR";

/// Largest page the upstream OCDS API will serve.
pub const UPSTREAM_MAX_PAGE_SIZE: u32 = 1000;

/// Canonical flattened row for one procurement opportunity, keyed by `ocid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TenderRecord {
    pub ocid: String,
    pub release_id: String,
    pub release_date: Option<DateTime<Utc>>,
    pub tender_id: String,
    pub title: String,
    pub status: String,
    pub category: String,
    pub province: String,
    pub delivery_location: String,
    pub special_conditions: String,
    pub main_procurement_category: String,
    pub description: String,
    pub procurement_method: String,
    pub procurement_method_details: String,
    pub estimated_value: f64,
    pub currency: String,
    pub tender_period_start: Option<DateTime<Utc>>,
    pub tender_period_end: Option<DateTime<Utc>>,
    pub buyer_id: String,
    pub buyer_name: String,
    pub procuring_entity_id: String,
    pub procuring_entity_name: String,
    pub contact_name: String,
    pub contact_email: String,
    pub contact_phone: String,
    pub briefing_is_session: bool,
    pub briefing_compulsory: bool,
    pub briefing_date: Option<DateTime<Utc>>,
    pub briefing_venue: String,
    pub document_count: i32,
    pub award_count: i32,
    pub total_award_value: f64,
    /// Upstream release document, preserved verbatim.
    pub raw_release: JsonValue,
    /// Assigned by the store on every write; unset on freshly transformed records.
    pub synced_at: Option<DateTime<Utc>>,
}

impl TenderRecord {
    pub fn summary(&self) -> TenderSummary {
        TenderSummary {
            ocid: self.ocid.clone(),
            release_id: self.release_id.clone(),
            release_date: self.release_date,
            tender_id: self.tender_id.clone(),
            title: self.title.clone(),
            status: self.status.clone(),
            category: self.category.clone(),
            province: self.province.clone(),
            delivery_location: self.delivery_location.clone(),
            main_procurement_category: self.main_procurement_category.clone(),
            description: self.description.clone(),
            procurement_method: self.procurement_method.clone(),
            procurement_method_details: self.procurement_method_details.clone(),
            estimated_value: self.estimated_value,
            currency: self.currency.clone(),
            tender_period_start: self.tender_period_start,
            tender_period_end: self.tender_period_end,
            buyer_id: self.buyer_id.clone(),
            buyer_name: self.buyer_name.clone(),
            procuring_entity_id: self.procuring_entity_id.clone(),
            procuring_entity_name: self.procuring_entity_name.clone(),
            contact_name: self.contact_name.clone(),
            contact_email: self.contact_email.clone(),
            contact_phone: self.contact_phone.clone(),
            briefing_is_session: self.briefing_is_session,
            briefing_compulsory: self.briefing_compulsory,
            briefing_date: self.briefing_date,
            briefing_venue: self.briefing_venue.clone(),
            document_count: self.document_count,
            award_count: self.award_count,
            total_award_value: self.total_award_value,
            synced_at: self.synced_at,
        }
    }
}

/// List-view projection of a stored tender (everything but the raw release).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TenderSummary {
    pub ocid: String,
    pub release_id: String,
    pub release_date: Option<DateTime<Utc>>,
    pub tender_id: String,
    pub title: String,
    pub status: String,
    pub category: String,
    pub province: String,
    pub delivery_location: String,
    pub main_procurement_category: String,
    pub description: String,
    pub procurement_method: String,
    pub procurement_method_details: String,
    pub estimated_value: f64,
    pub currency: String,
    pub tender_period_start: Option<DateTime<Utc>>,
    pub tender_period_end: Option<DateTime<Utc>>,
    pub buyer_id: String,
    pub buyer_name: String,
    pub procuring_entity_id: String,
    pub procuring_entity_name: String,
    pub contact_name: String,
    pub contact_email: String,
    pub contact_phone: String,
    pub briefing_is_session: bool,
    pub briefing_compulsory: bool,
    pub briefing_date: Option<DateTime<Utc>>,
    pub briefing_venue: String,
    pub document_count: i32,
    pub award_count: i32,
    pub total_award_value: f64,
    pub synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRunStatus {
    Running,
    Success,
    Error,
    Cancelled,
}

impl SyncRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Success => "success",
            SyncRunStatus::Error => "error",
            SyncRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SyncRunStatus::Running)
    }
}

impl fmt::Display for SyncRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSyncRunStatus(pub String);

impl fmt::Display for UnknownSyncRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown sync run status `{}`", self.0)
    }
}

impl std::error::Error for UnknownSyncRunStatus {}

impl FromStr for SyncRunStatus {
    type Err = UnknownSyncRunStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncRunStatus::Running),
            "success" => Ok(SyncRunStatus::Success),
            "error" => Ok(SyncRunStatus::Error),
            "cancelled" => Ok(SyncRunStatus::Cancelled),
            other => Err(UnknownSyncRunStatus(other.to_string())),
        }
    }
}

/// One row of the append-only sync history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub id: i64,
    pub status: SyncRunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub tenders_fetched: i64,
    pub tenders_upserted: i64,
    pub duration_ms: Option<i64>,
    #[serde(rename = "error")]
    pub error_message: Option<String>,
}

/// Outcome handed back to whoever triggered a sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub run_id: i64,
    pub status: SyncRunStatus,
    #[serde(rename = "tendersFetched")]
    pub fetched: u64,
    #[serde(rename = "tendersUpserted")]
    pub upserted: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub tender_count: i64,
    pub is_running: bool,
    pub last_run: Option<SyncRun>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    ReleaseDate,
    Title,
    TenderPeriodEnd,
    TenderPeriodStart,
    BuyerName,
    TotalAwardValue,
    Status,
    Province,
    SyncedAt,
}

impl SortKey {
    pub const ALL: [SortKey; 9] = [
        SortKey::ReleaseDate,
        SortKey::Title,
        SortKey::TenderPeriodEnd,
        SortKey::TenderPeriodStart,
        SortKey::BuyerName,
        SortKey::TotalAwardValue,
        SortKey::Status,
        SortKey::Province,
        SortKey::SyncedAt,
    ];

    /// Column name in the `tenders` table. Only these are ever interpolated into SQL.
    pub fn column(self) -> &'static str {
        match self {
            SortKey::ReleaseDate => "release_date",
            SortKey::Title => "title",
            SortKey::TenderPeriodEnd => "tender_period_end",
            SortKey::TenderPeriodStart => "tender_period_start",
            SortKey::BuyerName => "buyer_name",
            SortKey::TotalAwardValue => "total_award_value",
            SortKey::Status => "status",
            SortKey::Province => "province",
            SortKey::SyncedAt => "synced_at",
        }
    }

    /// Unknown keys fall back to the release date.
    pub fn parse_or_default(input: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|key| key.column() == input.trim())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse_or_default(input: &str) -> Self {
        if input.trim().eq_ignore_ascii_case("asc") {
            SortOrder::Asc
        } else {
            SortOrder::Desc
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Filter/sort/page request against the stored tenders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenderQuery {
    pub keyword: Option<String>,
    pub province: Option<String>,
    pub status: Option<String>,
    pub sort_by: SortKey,
    pub order: SortOrder,
    pub page: u32,
    pub limit: u32,
}

impl Default for TenderQuery {
    fn default() -> Self {
        Self {
            keyword: None,
            province: None,
            status: None,
            sort_by: SortKey::default(),
            order: SortOrder::default(),
            page: 1,
            limit: Self::DEFAULT_LIMIT,
        }
    }
}

impl TenderQuery {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;

    /// Build a query from loosely-typed request parameters, clamping page and limit.
    pub fn from_params(
        keyword: Option<String>,
        province: Option<String>,
        status: Option<String>,
        sort_by: Option<&str>,
        order: Option<&str>,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Self {
        Self {
            keyword,
            province,
            status,
            sort_by: sort_by.map(SortKey::parse_or_default).unwrap_or_default(),
            order: order.map(SortOrder::parse_or_default).unwrap_or_default(),
            page: page.unwrap_or(1).max(1),
            limit: match limit {
                Some(0) | None => Self::DEFAULT_LIMIT,
                Some(n) => n.min(Self::MAX_LIMIT),
            },
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit)
    }

    pub fn keyword_filter(&self) -> Option<&str> {
        non_blank(self.keyword.as_deref())
    }

    pub fn province_filter(&self) -> Option<&str> {
        non_blank(self.province.as_deref()).filter(|p| *p != "All Provinces")
    }

    pub fn status_filter(&self) -> Option<&str> {
        non_blank(self.status.as_deref()).filter(|s| *s != "All Statuses")
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl Pagination {
    pub fn new(page: u32, limit: u32, total: u64) -> Self {
        let total_pages = total.div_ceil(u64::from(limit.max(1)));
        Self {
            page,
            limit,
            total,
            total_pages,
            has_next: u64::from(page) < total_pages,
            has_prev: page > 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenderPage {
    pub tenders: Vec<TenderSummary>,
    pub pagination: Pagination,
}

/// One group of a `GROUP BY` facet, before it is keyed for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelCount {
    pub label: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvinceCount {
    pub province: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: i64,
}

impl From<LabelCount> for StatusCount {
    fn from(c: LabelCount) -> Self {
        Self {
            status: c.label,
            count: c.count,
        }
    }
}

impl From<LabelCount> for ProvinceCount {
    fn from(c: LabelCount) -> Self {
        Self {
            province: c.label,
            count: c.count,
        }
    }
}

impl From<LabelCount> for CategoryCount {
    fn from(c: LabelCount) -> Self {
        Self {
            category: c.label,
            count: c.count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TenderStats {
    pub total: i64,
    pub by_status: Vec<StatusCount>,
    pub by_province: Vec<ProvinceCount>,
    /// Top ten categories only.
    pub by_category: Vec<CategoryCount>,
    pub unique_entities: i64,
}

impl TenderStats {
    pub fn from_facets(
        total: i64,
        by_status: Vec<LabelCount>,
        by_province: Vec<LabelCount>,
        by_category: Vec<LabelCount>,
        unique_entities: i64,
    ) -> Self {
        Self {
            total,
            by_status: by_status.into_iter().map(Into::into).collect(),
            by_province: by_province.into_iter().map(Into::into).collect(),
            by_category: by_category.into_iter().map(Into::into).collect(),
            unique_entities,
        }
    }
}
