//! Axum worker API (lease/report) and operator endpoints.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use lpf_core::normalize_phone;
use lpf_storage::Store;
use lpf_sync::{LeaseOutcome, Pipeline};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lpf-web";

pub struct AppState<S: Store> {
    pub pipeline: Arc<Pipeline<S>>,
}

impl<S: Store> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
        }
    }
}

impl<S: Store> AppState<S> {
    pub fn new(pipeline: Arc<Pipeline<S>>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseRequest {
    worker_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReportStatus {
    Ok,
    Error,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRequest {
    lease_id: Uuid,
    status: ReportStatus,
    phone_number: Option<String>,
    business_title: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ForceQuery {
    #[serde(default)]
    force: bool,
}

pub fn app<S: Store>(state: AppState<S>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/lease", post(lease_handler::<S>))
        .route("/report", post(report_handler::<S>))
        .route("/admin/fetch", post(admin_fetch_handler::<S>))
        .route("/admin/transfer", post(admin_transfer_handler::<S>))
        .route("/admin/transfer-missing", post(admin_transfer_missing_handler::<S>))
        .route("/admin/cursor", get(admin_cursor_handler::<S>))
        .with_state(state)
}

pub async fn serve<S: Store>(state: AppState<S>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "worker api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn lease_handler<S: Store>(State(state): State<AppState<S>>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        LeaseRequest::default()
    } else {
        match serde_json::from_slice::<LeaseRequest>(&body) {
            Ok(request) => request,
            Err(err) => return bad_request(format!("invalid lease request: {err}")),
        }
    };

    match state.pipeline.leases.lease(request.worker_id).await {
        Ok(LeaseOutcome::Granted(grant)) => Json(grant).into_response(),
        Ok(_) => Json(json!({ "status": "empty" })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn report_handler<S: Store>(
    State(state): State<AppState<S>>,
    Json(report): Json<ReportRequest>,
) -> Response {
    let leases = &state.pipeline.leases;
    let result = match report.status {
        ReportStatus::Ok => {
            let Some(phone) = report
                .phone_number
                .as_deref()
                .filter(|p| normalize_phone(p).is_some())
            else {
                return bad_request("status ok requires a phoneNumber".to_string());
            };
            leases
                .report_ok(report.lease_id, phone, report.business_title)
                .await
        }
        ReportStatus::Error => {
            let message = report.error.as_deref().unwrap_or("unknown_error");
            leases.report_error(report.lease_id, message).await
        }
    };

    match result {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => server_error(err),
    }
}

async fn admin_fetch_handler<S: Store>(State(state): State<AppState<S>>) -> Response {
    match state.pipeline.fetcher.step(true).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => server_error(err),
    }
}

async fn admin_transfer_handler<S: Store>(
    State(state): State<AppState<S>>,
    Query(query): Query<ForceQuery>,
) -> Response {
    match state.pipeline.transfers.transfer_one(query.force).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => server_error(err),
    }
}

async fn admin_transfer_missing_handler<S: Store>(
    State(state): State<AppState<S>>,
    Query(query): Query<ForceQuery>,
) -> Response {
    match state
        .pipeline
        .transfers
        .transfer_missing_posts(query.force)
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

async fn admin_cursor_handler<S: Store>(State(state): State<AppState<S>>) -> Response {
    match state.pipeline.fetcher.status().await {
        Ok(cursor) => Json(cursor).into_response(),
        Err(err) => server_error(err),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
