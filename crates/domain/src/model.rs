//! Persisted document model: events, aggregations, and the job worklist.
//!
//! Documents serialize with camelCase field names and a `_id` primary key,
//! matching the collection-store layout. Aggregation result maps are
//! `BTreeMap` so their JSON serialization is canonical (key-sorted) — the
//! webhook signature is computed over that serialization.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::period::{self, PeriodKeys, PeriodType};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable usage record. Created on ingest, never mutated.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub customer_id: String,
    pub event_type: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub received_at: DateTime<Utc>,
    /// The six canonical period keys derived from `received_at`.
    #[serde(flatten)]
    pub periods: PeriodKeys,
}

impl Event {
    /// Build an event for `received_at`, deriving all six period keys from
    /// that instant so the keys and the timestamp can never disagree.
    pub fn new(
        customer_id: impl Into<String>,
        event_type: impl Into<String>,
        value: f64,
        metadata: Option<serde_json::Value>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id: customer_id.into(),
            event_type: event_type.into(),
            value,
            metadata,
            received_at,
            periods: period::period_keys(received_at),
        }
    }

    /// The period key this event carries for the given period type.
    pub fn period_key(&self, period: PeriodType) -> &str {
        period::key_for(period, &self.periods)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Aggregations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deterministic aggregation id: `{customerId}_{period}_{periodKey}`.
///
/// Primary key for both `aggregations` and `pending_agg_jobs`; at most one
/// row per id may exist in either collection.
pub fn aggregation_id(customer_id: &str, period: PeriodType, period_key: &str) -> String {
    format!("{customer_id}_{period}_{period_key}")
}

/// Lock keyspace entry guarding one aggregation id.
pub fn lock_key(aggregation_id: &str) -> String {
    format!("agg_lock_{aggregation_id}")
}

/// Delivery bookkeeping stored inside the aggregation document, so webhook
/// outcomes stay observable through the `/aggregations` read path.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookStatus {
    #[serde(default)]
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
}

/// Completed or in-progress reduction for one (customer, period, key).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregation {
    #[serde(rename = "_id")]
    pub id: String,
    pub customer_id: String,
    pub period: PeriodType,
    pub period_start: DateTime<Utc>,
    /// Inclusive, at `.999` milliseconds.
    pub period_end: DateTime<Utc>,
    pub period_key: String,
    /// When this reduction was (last) computed.
    pub timestamp: DateTime<Utc>,
    /// Reduced value per event type. Event types with no data are absent.
    pub events: BTreeMap<String, f64>,
    /// Contributing-event count per event type.
    pub event_counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub webhook_status: WebhookStatus,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending aggregation jobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
}

/// Which scheduler entry point created a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Cron,
    Trigger,
}

/// Durable worklist row. Shares its `_id` with the aggregation it will
/// produce, which is what makes scheduler runs idempotent.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAggJob {
    #[serde(rename = "_id")]
    pub id: String,
    pub customer_id: String,
    pub period_type: PeriodType,
    pub period_key: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    pub source: JobSource,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Webhook delivery jobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Queue message for one delivery: (aggregation, subscriber) pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookJob {
    pub aggregation_id: String,
    pub webhook_url: String,
    pub webhook_secret: String,
    pub customer_id: String,
    pub period: PeriodType,
}
