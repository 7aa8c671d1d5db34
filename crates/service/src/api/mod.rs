//! HTTP surface.
//!
//! - `POST /usage/:event_type`      — ingest one event
//! - `POST /usagebatch`             — ingest up to 1000 events
//! - `GET  /events`                 — query stored events
//! - `GET  /aggregations`           — query computed aggregations
//! - `POST /aggregations/trigger`   — schedule current-period aggregation
//! - `GET  /config`                 — the loaded configuration
//! - `GET  /health`                 — liveness + store counts

pub mod aggregations;
pub mod events;
pub mod usage;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;
use crate::store::{AggregationStore, EventStore, JobBoard};

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/usage/:event_type", post(usage::ingest_one))
        .route("/usagebatch", post(usage::ingest_batch))
        .route("/events", get(events::list_events))
        .route("/aggregations", get(aggregations::list_aggregations))
        .route("/aggregations/trigger", post(aggregations::trigger))
        .route("/config", get(show_config))
        .route("/health", get(health))
}

/// `GET /config` — the loaded configuration document.
async fn show_config(State(state): State<AppState>) -> Response {
    Json(state.config.as_ref().clone()).into_response()
}

/// `GET /health`
async fn health(State(state): State<AppState>) -> Response {
    let events = state.events.count().await.unwrap_or(0);
    let aggregations = state.aggregations.count().await.unwrap_or(0);
    let pending_jobs = state.jobs.list().await.map(|j| j.len()).unwrap_or(0);
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "events": events,
        "aggregations": aggregations,
        "pendingJobs": pending_jobs,
    }))
    .into_response()
}
