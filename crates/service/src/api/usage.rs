//! Ingest endpoints — single event and batch.
//!
//! Malformed JSON (wrong shape, wrong types) is a 400; well-formed bodies
//! that violate the configuration or value rules are a 422 with a
//! `details` array. A service with no configured event types answers 503.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::Deserialize;

use mt_domain::config::Config;
use mt_domain::model::Event;

use crate::state::AppState;
use crate::store::EventStore;

use super::api_error;

/// Batch size cap for `POST /usagebatch`.
pub const MAX_BATCH: usize = 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBody {
    pub customer_id: String,
    pub value: f64,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub event_type: String,
    pub customer_id: String,
    pub value: f64,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn validate(config: &Config, event_type: &str, customer_id: &str, value: f64, metadata: &Option<serde_json::Value>) -> Vec<String> {
    let mut errors = Vec::new();
    if !config.events.contains_key(event_type) {
        errors.push(format!("eventType '{event_type}' is not configured"));
    }
    if customer_id.trim().is_empty() {
        errors.push("customerId must be a non-empty string".to_string());
    }
    if !value.is_finite() {
        errors.push("value must be a finite number".to_string());
    }
    if let Some(meta) = metadata {
        if !meta.is_object() {
            errors.push("metadata must be an object".to_string());
        }
    }
    errors
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /usage/:event_type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn ingest_one(
    State(state): State<AppState>,
    Path(event_type): Path<String>,
    body: Result<Json<UsageBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("invalid request body: {rejection}"),
            )
        }
    };
    if state.config.events.is_empty() {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no event types configured",
        );
    }

    let errors = validate(
        &state.config,
        &event_type,
        &body.customer_id,
        body.value,
        &body.metadata,
    );
    if !errors.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "error": "validation failed",
                "details": errors,
            })),
        )
            .into_response();
    }

    let event = Event::new(
        body.customer_id,
        event_type,
        body.value,
        body.metadata,
        Utc::now(),
    );
    match state.events.insert(event).await {
        Ok(stored) => (StatusCode::CREATED, Json(stored)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "event insert failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /usagebatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn ingest_batch(
    State(state): State<AppState>,
    body: Result<Json<Vec<BatchItem>>, JsonRejection>,
) -> Response {
    let Json(items) = match body {
        Ok(b) => b,
        Err(rejection) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("invalid request body: {rejection}"),
            )
        }
    };
    if state.config.events.is_empty() {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no event types configured",
        );
    }
    if items.len() > MAX_BATCH {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(serde_json::json!({
                "error": "batch too large",
                "received": items.len(),
                "maxAllowed": MAX_BATCH,
            })),
        )
            .into_response();
    }

    // Validate everything up front; nothing is stored from an invalid batch.
    let mut detail = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let errors = validate(
            &state.config,
            &item.event_type,
            &item.customer_id,
            item.value,
            &item.metadata,
        );
        if !errors.is_empty() {
            detail.push(serde_json::json!({ "index": index, "errors": errors }));
        }
    }
    if !detail.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "error": "validation failed",
                "details": detail,
            })),
        )
            .into_response();
    }

    let now = Utc::now();
    let mut success_count = 0usize;
    let mut failed_count = 0usize;
    for item in items {
        let event = Event::new(item.customer_id, item.event_type, item.value, item.metadata, now);
        match state.events.insert(event).await {
            Ok(_) => success_count += 1,
            Err(e) => {
                tracing::error!(error = %e, "batch event insert failed");
                failed_count += 1;
            }
        }
    }

    if failed_count == 0 {
        (
            StatusCode::CREATED,
            Json(serde_json::json!({ "successCount": success_count })),
        )
            .into_response()
    } else {
        (
            StatusCode::MULTI_STATUS,
            Json(serde_json::json!({
                "successCount": success_count,
                "failedCount": failed_count,
            })),
        )
            .into_response()
    }
}
