//! Storage contracts — the abstract collection + KV surface the engine
//! consumes.
//!
//! The scheduler, worker, and dispatcher only ever see these traits. The
//! in-memory implementations in [`memory`] back the service and the test
//! suite; a document-store backend would implement the same six-operation
//! surface per collection.

pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mt_domain::model::{Aggregation, Event, PendingAggJob};
use mt_domain::operator::Operator;
use mt_domain::period::PeriodType;
use mt_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared result / filter types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of a deterministic-id upsert.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Result of the `{customerId}`-projection scan.
#[derive(Clone, Debug, Default)]
pub struct CustomerScan {
    pub customers: BTreeSet<String>,
    pub events_scanned: u64,
}

/// Filter for the `GET /events` read path.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub customer_id: Option<String>,
    pub event_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Filter for the `GET /aggregations` read path.
#[derive(Clone, Debug, Default)]
pub struct AggregationFilter {
    pub customer_id: Option<String>,
    pub period: Option<PeriodType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Nested-field patch for `webhookStatus.*`. `increment_attempts` is an
/// increment, not an absolute write, so concurrent deliveries never lose
/// counts. Only the dispatcher uses this; aggregation-result updates go
/// through [`AggregationStore::update_results`] and cannot touch delivery
/// state.
#[derive(Clone, Debug, Default)]
pub struct WebhookStatusPatch {
    pub delivered: Option<bool>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub increment_attempts: bool,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub dry_run: Option<bool>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The `events` collection.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert(&self, event: Event) -> Result<Event>;

    /// Stream all events projecting only `customerId`, returning the set of
    /// unique customers. Implementations must not materialize full event
    /// documents for this scan.
    async fn scan_customer_ids(&self) -> Result<CustomerScan>;

    /// One-document probe: does any event carry this period key?
    async fn any_with_period_key(&self, period: PeriodType, key: &str) -> Result<bool>;

    /// Events feeding one (customer, eventType, period) reduction.
    /// Stable-sorted ascending by `receivedAt` for `first`, descending for
    /// `last`; unsorted otherwise. Materializing is fine here — the filter
    /// is bounded by one period for one event type.
    async fn query_for_aggregation(
        &self,
        customer_id: &str,
        event_type: &str,
        period: PeriodType,
        key: &str,
        op: Operator,
    ) -> Result<Vec<Event>>;

    /// Read path for `GET /events`, ordered by `receivedAt` descending.
    async fn query(&self, filter: &EventFilter) -> Result<Vec<Event>>;

    async fn count(&self) -> Result<u64>;
}

/// The `aggregations` collection, keyed by the deterministic id.
#[async_trait]
pub trait AggregationStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Aggregation>>;

    /// Create a new document. Fails on a duplicate id — the worker checks
    /// existence first, and at most one row per id may ever exist.
    async fn insert(&self, doc: Aggregation) -> Result<()>;

    /// Refresh the computed results of an existing document. Never touches
    /// `webhookStatus`. Returns false when the id is unknown.
    async fn update_results(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
        events: BTreeMap<String, f64>,
        event_counts: BTreeMap<String, u64>,
    ) -> Result<bool>;

    /// Patch `webhookStatus.*` fields. Returns false when the id is unknown.
    async fn update_webhook_status(&self, id: &str, patch: WebhookStatusPatch) -> Result<bool>;

    /// Read path for `GET /aggregations`, ordered by `periodStart`
    /// descending.
    async fn query(&self, filter: &AggregationFilter) -> Result<Vec<Aggregation>>;

    async fn count(&self) -> Result<u64>;
}

/// The `pending_agg_jobs` worklist, keyed by the deterministic id.
#[async_trait]
pub trait JobBoard: Send + Sync {
    /// Insert or refresh a row in place, always resetting the status to
    /// pending and the timestamps.
    async fn upsert_pending(&self, job: PendingAggJob) -> Result<UpsertOutcome>;

    /// Enqueue one message per pending row onto the named queue. The
    /// payload is the full job document.
    async fn bulk_enqueue_pending(&self, queue: &str) -> Result<u64>;

    /// Transition all pending rows to queued, stamping `queuedAt`.
    async fn mark_queued(&self) -> Result<u64>;

    async fn delete(&self, id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<PendingAggJob>>;

    /// Operational recovery: flip queued rows whose `queuedAt` is older
    /// than `older_than` back to pending so the next bulk enqueue re-emits
    /// them.
    async fn requeue_stuck(&self, older_than: chrono::Duration) -> Result<u64>;
}

/// Short-TTL keyspace providing advisory locks per aggregation id.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Atomic set-if-absent. An entry older than its TTL counts as absent.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Best-effort delete. Failures are logged, never propagated.
    async fn release(&self, key: &str);
}
