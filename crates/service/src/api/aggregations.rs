//! `GET /aggregations` and the manual trigger.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use mt_domain::period::PeriodType;
use mt_domain::Error;

use crate::state::AppState;
use crate::store::{AggregationFilter, AggregationStore};

use super::api_error;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationsQuery {
    pub customer_id: Option<String>,
    pub period: Option<PeriodType>,
    /// ISO-8601 lower bound on `periodStart`, inclusive.
    pub from: Option<DateTime<Utc>>,
    /// ISO-8601 upper bound on `periodStart`, inclusive.
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Returns aggregations ordered by `periodStart` descending. Webhook
/// outcomes are readable here via each document's `webhookStatus`.
pub async fn list_aggregations(
    State(state): State<AppState>,
    query: Result<Query<AggregationsQuery>, QueryRejection>,
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

    let filter = AggregationFilter {
        customer_id: query.customer_id,
        period: query.period,
        from: query.from,
        to: query.to,
        limit: query.limit,
    };
    match state.aggregations.query(&filter).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "aggregation query failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// `POST /aggregations/trigger`
///
/// Schedules current-period aggregation for every customer and returns
/// `202 Accepted` with the scheduling counts; the work itself happens on
/// the worker queue.
pub async fn trigger(State(state): State<AppState>) -> Response {
    match state.scheduler.manual_trigger(Utc::now()).await {
        Ok(report) => (StatusCode::ACCEPTED, Json(report)).into_response(),
        Err(Error::Config(message)) => api_error(StatusCode::SERVICE_UNAVAILABLE, message),
        Err(e) => {
            tracing::error!(error = %e, "manual trigger failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}
