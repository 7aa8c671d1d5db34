//! `GET /events` — stored-event queries for dashboards and debugging.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::state::AppState;
use crate::store::{EventFilter, EventStore};

use super::api_error;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub customer_id: Option<String>,
    pub event_type: Option<String>,
    /// ISO-8601 lower bound on `receivedAt`, inclusive.
    pub from: Option<DateTime<Utc>>,
    /// ISO-8601 upper bound on `receivedAt`, inclusive.
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Returns events ordered by `receivedAt` descending.
pub async fn list_events(
    State(state): State<AppState>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(rejection) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("invalid query: {rejection}"),
            )
        }
    };

    let filter = EventFilter {
        customer_id: query.customer_id,
        event_type: query.event_type,
        from: query.from,
        to: query.to,
        limit: query.limit,
    };
    match state.events.query(&filter).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "event query failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}
