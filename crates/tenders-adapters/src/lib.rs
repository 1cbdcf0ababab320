//! Upstream OCDS release adapter: the paging fetcher and the release-to-record
//! normalization.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use reqwest::Url;
use serde_json::Value as JsonValue;
use tenders_core::{TenderRecord, HOME_CURRENCY, UPSTREAM_MAX_PAGE_SIZE};
use tenders_storage::{FetchError, HttpFetcher};
use tracing::debug;

pub const CRATE_NAME: &str = "tenders-adapters";

pub const DEFAULT_API_BASE: &str = "https://ocds-api.etenders.gov.za/api/OCDSReleases";

/// Briefing dates the upstream leaves unset come through as year 1.
const ZERO_DATE_PREFIX: &str = "0001";

/// One page of upstream releases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReleasePage {
    pub releases: Vec<JsonValue>,
    pub has_next_page: bool,
}

impl ReleasePage {
    /// Lenient decode of an OCDS release package: a missing `releases` is an
    /// empty page and only a non-empty `links.next` string signals more pages.
    pub fn from_json(mut package: JsonValue) -> Self {
        let has_next_page = json_str(&package, &["links", "next"]).is_some_and(|next| !next.is_empty());
        let releases = match package.get_mut("releases").map(JsonValue::take) {
            Some(JsonValue::Array(releases)) => releases,
            _ => Vec::new(),
        };
        Self {
            releases,
            has_next_page,
        }
    }
}

/// A paged feed of OCDS releases filtered by release date.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn fetch_page(
        &self,
        page_number: u32,
        page_size: u32,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<ReleasePage, FetchError>;
}

/// The public OCDS releases API.
#[derive(Debug, Clone)]
pub struct OcdsApiSource {
    http: HttpFetcher,
    base_url: Url,
}

impl OcdsApiSource {
    pub fn new(http: HttpFetcher, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("parsing upstream base url {base_url}"))?;
        Ok(Self { http, base_url })
    }

    pub fn page_url(&self, page_number: u32, page_size: u32, date_from: NaiveDate, date_to: NaiveDate) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("PageNumber", &page_number.to_string())
            .append_pair("PageSize", &page_size.min(UPSTREAM_MAX_PAGE_SIZE).to_string())
            .append_pair("dateFrom", &date_from.format("%Y-%m-%d").to_string())
            .append_pair("dateTo", &date_to.format("%Y-%m-%d").to_string());
        url
    }
}

#[async_trait]
impl ReleaseSource for OcdsApiSource {
    async fn fetch_page(
        &self,
        page_number: u32,
        page_size: u32,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<ReleasePage, FetchError> {
        let url = self.page_url(page_number, page_size, date_from, date_to);
        let response = self.http.fetch_bytes(&url, "application/json").await?;
        let package: JsonValue = serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url.clone(),
            source,
        })?;
        let page = ReleasePage::from_json(package);
        debug!(
            page_number,
            releases = page.releases.len(),
            has_next_page = page.has_next_page,
            "fetched release page"
        );
        Ok(page)
    }
}

/// Flatten one OCDS release into a [`TenderRecord`]. Total: anything missing or
/// malformed falls back to an empty/zero/absent value. `synced_at` stays unset.
pub fn transform_release(release: &JsonValue) -> TenderRecord {
    let awards = json_at(release, &["awards"])
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let total_award_value = awards
        .iter()
        .map(|award| json_f64(award, &["value", "amount"]).unwrap_or(0.0))
        .sum();

    let briefing_date = json_str(release, &["tender", "briefingSession", "date"])
        .filter(|raw| !raw.starts_with(ZERO_DATE_PREFIX))
        .and_then(parse_timestamp);

    TenderRecord {
        ocid: text(release, &["ocid"]),
        release_id: text(release, &["id"]),
        release_date: json_date(release, &["date"]),
        tender_id: text(release, &["tender", "id"]),
        title: text(release, &["tender", "title"]),
        status: text(release, &["tender", "status"]),
        category: text(release, &["tender", "category"]),
        province: text(release, &["tender", "province"]),
        delivery_location: text(release, &["tender", "deliveryLocation"]),
        special_conditions: text(release, &["tender", "specialConditions"]),
        main_procurement_category: text(release, &["tender", "mainProcurementCategory"]),
        description: text(release, &["tender", "description"]),
        procurement_method: text(release, &["tender", "procurementMethod"]),
        procurement_method_details: text(release, &["tender", "procurementMethodDetails"]),
        estimated_value: json_f64(release, &["tender", "value", "amount"]).unwrap_or(0.0),
        currency: json_str(release, &["tender", "value", "currency"])
            .filter(|c| !c.is_empty())
            .unwrap_or(HOME_CURRENCY)
            .to_string(),
        tender_period_start: json_date(release, &["tender", "tenderPeriod", "startDate"]),
        tender_period_end: json_date(release, &["tender", "tenderPeriod", "endDate"]),
        buyer_id: text(release, &["buyer", "id"]),
        buyer_name: text(release, &["buyer", "name"]),
        procuring_entity_id: text(release, &["tender", "procuringEntity", "id"]),
        procuring_entity_name: text(release, &["tender", "procuringEntity", "name"]),
        contact_name: text(release, &["tender", "contactPerson", "name"]),
        contact_email: text(release, &["tender", "contactPerson", "email"]),
        contact_phone: text(release, &["tender", "contactPerson", "telephoneNumber"]),
        briefing_is_session: json_bool(release, &["tender", "briefingSession", "isSession"]),
        briefing_compulsory: json_bool(release, &["tender", "briefingSession", "compulsory"]),
        briefing_date,
        briefing_venue: text(release, &["tender", "briefingSession", "venue"]),
        document_count: json_len(release, &["tender", "documents"]),
        award_count: json_len(release, &["awards"]),
        total_award_value,
        raw_release: release.clone(),
        synced_at: None,
    }
}

/// RFC 3339, or a zone-less timestamp / plain date read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Read a captured upstream response (a release package) from disk.
pub fn load_release_page(path: impl AsRef<Path>) -> Result<ReleasePage> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let package: JsonValue = serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(ReleasePage::from_json(package))
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn text(value: &JsonValue, path: &[&str]) -> String {
    json_str(value, path).unwrap_or_default().to_string()
}

// Amounts arrive as numbers or numeric strings.
fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_bool(value: &JsonValue, path: &[&str]) -> bool {
    json_at(value, path).and_then(JsonValue::as_bool).unwrap_or(false)
}

fn json_len(value: &JsonValue, path: &[&str]) -> i32 {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .map(|items| i32::try_from(items.len()).unwrap_or(i32::MAX))
        .unwrap_or(0)
}

fn json_date(value: &JsonValue, path: &[&str]) -> Option<DateTime<Utc>> {
    json_str(value, path).and_then(parse_timestamp)
}
