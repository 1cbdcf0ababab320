//! Axum JSON API over the tender index and the sync trigger.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tenders_core::TenderQuery;
use tenders_sync::{connect_from_config, maybe_build_scheduler, SyncConfig, SyncError, SyncPipeline};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "tenders-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

/// List parameters as sent by clients. Unparseable numbers fall back to defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TendersParams {
    page: Option<String>,
    limit: Option<String>,
    keyword: Option<String>,
    province: Option<String>,
    status: Option<String>,
    sort_by: Option<String>,
    sort_order: Option<String>,
}

impl TendersParams {
    fn into_query(self) -> TenderQuery {
        let number = |raw: Option<String>| raw.and_then(|v| v.trim().parse::<u32>().ok());
        TenderQuery::from_params(
            self.keyword,
            self.province,
            self.status,
            self.sort_by.as_deref(),
            self.sort_order.as_deref(),
            number(self.page),
            number(self.limit),
        )
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sync", get(sync_status_handler).post(sync_trigger_handler))
        .route("/api/tenders", get(tenders_list_handler))
        .route("/api/tenders/stats", get(tenders_stats_handler))
        .route("/api/tenders/{ocid}", get(tender_detail_handler))
        .with_state(Arc::new(state))
}

/// Serve the API, running the cron scheduler alongside when enabled.
pub async fn serve(config: SyncConfig, port: u16) -> anyhow::Result<()> {
    let pool = connect_from_config(&config).await?;
    let pipeline = Arc::new(SyncPipeline::from_config(&config, pool)?);

    let scheduler = maybe_build_scheduler(&config, Arc::clone(&pipeline)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "sync scheduler started");
    }

    let cancel = pipeline.cancellation_token();
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving tender index api");
    axum::serve(listener, app(AppState::new(pipeline)))
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
            cancel.cancel();
        })
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn sync_trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.run().await {
        Ok(result) => Json(result).into_response(),
        Err(SyncError::AlreadyRunning) => json_error(StatusCode::CONFLICT, "A sync is already in progress"),
        Err(err) => server_error(err.into()),
    }
}

async fn tenders_list_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TendersParams>,
) -> Response {
    let query = params.into_query();
    match state.pipeline.store().list(&query).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn tenders_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.store().stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn tender_detail_handler(State(state): State<Arc<AppState>>, Path(ocid): Path<String>) -> Response {
    match state.pipeline.store().raw_release(&ocid).await {
        Ok(Some(raw)) => Json(raw).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Tender not found"),
        Err(err) => server_error(err.into()),
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
}
