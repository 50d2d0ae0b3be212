use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Serialize;
use serde_json::json;

use super::AppState;
use crate::cleanup::{CleanupError, ReportRecorder, RunOutcome, RunRequest};
use crate::db::{CandidateSample, CandidateSnapshot};

/// Create the router with all routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/cleanup/trigger", post(trigger_cleanup))
        .route("/api/reports/latest", get(latest_report))
        .route("/healthz", get(health))
}

async fn health() -> &'static str {
    "OK"
}

// ========== Cleanup ==========

#[derive(Debug, Serialize)]
struct CleanupResponse {
    report_id: i64,
    deleted: u64,
    active_remaining: i64,
    deleted_users: Vec<CandidateSnapshot>,
}

#[derive(Debug, Serialize)]
struct DryRunResponse {
    status: &'static str,
    candidates: i64,
    sample: Vec<CandidateSample>,
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}

async fn trigger_cleanup(
    State(state): State<AppState>,
    Query(request): Query<RunRequest>,
) -> Response {
    match state.job.run_on_demand(&request).await {
        Ok(RunOutcome::Completed(summary)) => Json(CleanupResponse {
            report_id: summary.report.id,
            deleted: summary.deleted,
            active_remaining: summary.active_remaining,
            deleted_users: summary.deleted_users,
        })
        .into_response(),
        Ok(RunOutcome::DryRun(summary)) => Json(DryRunResponse {
            status: "dry_run",
            candidates: summary.candidates,
            sample: summary.sample,
        })
        .into_response(),
        Ok(RunOutcome::Locked) => detail(StatusCode::CONFLICT, "Cleanup already running"),
        Err(CleanupError::Validation(e)) => detail(StatusCode::BAD_REQUEST, &e.to_string()),
        Err(e) => {
            tracing::error!("On-demand cleanup failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "detail": "Server error during cleanup.",
                    "error": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

// ========== Reports ==========

async fn latest_report(State(state): State<AppState>) -> Response {
    match ReportRecorder::new(state.db.pool()).latest().await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => detail(StatusCode::NOT_FOUND, "No reports yet."),
        Err(e) => {
            tracing::error!("Failed to fetch latest cleanup report: {e}");
            detail(StatusCode::INTERNAL_SERVER_ERROR, "Database error")
        }
    }
}
