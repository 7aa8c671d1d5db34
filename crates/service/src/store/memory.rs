//! In-memory store implementations.
//!
//! Back the service in its default configuration and make the whole
//! pipeline testable without a live backend. Collections are maps behind
//! `tokio::sync::RwLock`; the lock keyspace is a TTL map.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use mt_domain::model::{Aggregation, Event, JobStatus, PendingAggJob};
use mt_domain::operator::Operator;
use mt_domain::period::PeriodType;
use mt_domain::{Error, Result};

use crate::queue::QueueHub;

use super::{
    AggregationFilter, AggregationStore, CustomerScan, EventFilter, EventStore, JobBoard,
    LockService, UpsertOutcome, WebhookStatusPatch,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append-only event collection. Insertion order is preserved, which is
/// what backs the `first`/`last` tie-break contract.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: RwLock<Vec<Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, event: Event) -> Result<Event> {
        self.inner.write().await.push(event.clone());
        Ok(event)
    }

    async fn scan_customer_ids(&self) -> Result<CustomerScan> {
        let inner = self.inner.read().await;
        let mut scan = CustomerScan::default();
        // Projection: only the customerId field is touched.
        for event in inner.iter() {
            scan.events_scanned += 1;
            if !scan.customers.contains(&event.customer_id) {
                scan.customers.insert(event.customer_id.clone());
            }
        }
        Ok(scan)
    }

    async fn any_with_period_key(&self, period: PeriodType, key: &str) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner.iter().any(|e| e.period_key(period) == key))
    }

    async fn query_for_aggregation(
        &self,
        customer_id: &str,
        event_type: &str,
        period: PeriodType,
        key: &str,
        op: Operator,
    ) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut matched: Vec<Event> = inner
            .iter()
            .filter(|e| {
                e.customer_id == customer_id
                    && e.event_type == event_type
                    && e.period_key(period) == key
            })
            .cloned()
            .collect();
        // Stable sorts keep insertion order among equal timestamps.
        match op {
            Operator::First => matched.sort_by_key(|e| e.received_at),
            Operator::Last => matched.sort_by(|a, b| b.received_at.cmp(&a.received_at)),
            _ => {}
        }
        Ok(matched)
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut matched: Vec<Event> = inner
            .iter()
            .filter(|e| {
                filter
                    .customer_id
                    .as_ref()
                    .is_none_or(|c| &e.customer_id == c)
                    && filter.event_type.as_ref().is_none_or(|t| &e.event_type == t)
                    && filter.from.is_none_or(|from| e.received_at >= from)
                    && filter.to.is_none_or(|to| e.received_at <= to)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        if filter.limit > 0 {
            matched.truncate(filter.limit);
        }
        Ok(matched)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.inner.read().await.len() as u64)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Aggregations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryAggregationStore {
    inner: RwLock<HashMap<String, Aggregation>>,
}

impl MemoryAggregationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AggregationStore for MemoryAggregationStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Aggregation>> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn insert(&self, doc: Aggregation) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.contains_key(&doc.id) {
            return Err(Error::Store(format!("duplicate aggregation id: {}", doc.id)));
        }
        inner.insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn update_results(
        &self,
        id: &str,
        timestamp: DateTime<Utc>,
        events: BTreeMap<String, f64>,
        event_counts: BTreeMap<String, u64>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.get_mut(id) {
            Some(doc) => {
                doc.timestamp = timestamp;
                doc.events = events;
                doc.event_counts = event_counts;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_webhook_status(&self, id: &str, patch: WebhookStatusPatch) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.get_mut(id) {
            Some(doc) => {
                let status = &mut doc.webhook_status;
                if let Some(delivered) = patch.delivered {
                    status.delivered = delivered;
                }
                if let Some(at) = patch.delivered_at {
                    status.delivered_at = Some(at);
                }
                if patch.increment_attempts {
                    status.attempts += 1;
                }
                if let Some(err) = patch.last_error {
                    status.last_error = Some(err);
                }
                if let Some(at) = patch.last_attempt_at {
                    status.last_attempt_at = Some(at);
                }
                if let Some(dry) = patch.dry_run {
                    status.dry_run = Some(dry);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query(&self, filter: &AggregationFilter) -> Result<Vec<Aggregation>> {
        let inner = self.inner.read().await;
        let mut matched: Vec<Aggregation> = inner
            .values()
            .filter(|a| {
                filter
                    .customer_id
                    .as_ref()
                    .is_none_or(|c| &a.customer_id == c)
                    && filter.period.is_none_or(|p| a.period == p)
                    && filter.from.is_none_or(|from| a.period_start >= from)
                    && filter.to.is_none_or(|to| a.period_start <= to)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.period_start.cmp(&a.period_start));
        if filter.limit > 0 {
            matched.truncate(filter.limit);
        }
        Ok(matched)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.inner.read().await.len() as u64)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job board
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MemoryJobBoard {
    inner: RwLock<HashMap<String, PendingAggJob>>,
    queue: Arc<QueueHub>,
}

impl MemoryJobBoard {
    pub fn new(queue: Arc<QueueHub>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            queue,
        }
    }
}

#[async_trait]
impl JobBoard for MemoryJobBoard {
    async fn upsert_pending(&self, job: PendingAggJob) -> Result<UpsertOutcome> {
        let mut inner = self.inner.write().await;
        let outcome = if inner.contains_key(&job.id) {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Created
        };
        inner.insert(job.id.clone(), job);
        Ok(outcome)
    }

    async fn bulk_enqueue_pending(&self, queue: &str) -> Result<u64> {
        let inner = self.inner.read().await;
        let mut enqueued = 0u64;
        for job in inner.values().filter(|j| j.status == JobStatus::Pending) {
            self.queue.publish(queue, serde_json::to_value(job)?);
            enqueued += 1;
        }
        Ok(enqueued)
    }

    async fn mark_queued(&self) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut marked = 0u64;
        for job in inner.values_mut().filter(|j| j.status == JobStatus::Pending) {
            job.status = JobStatus::Queued;
            job.queued_at = Some(now);
            marked += 1;
        }
        Ok(marked)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.inner.write().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<PendingAggJob>> {
        Ok(self.inner.read().await.values().cloned().collect())
    }

    async fn requeue_stuck(&self, older_than: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - older_than;
        let mut inner = self.inner.write().await;
        let mut flipped = 0u64;
        for job in inner.values_mut() {
            if job.status == JobStatus::Queued && job.queued_at.is_some_and(|at| at < cutoff) {
                job.status = JobStatus::Pending;
                job.queued_at = None;
                flipped += 1;
            }
        }
        Ok(flipped)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Locks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// TTL keyspace. Tracks held keys with their acquisition instant; an entry
/// past its TTL counts as absent, so a crashed holder self-heals.
#[derive(Default)]
pub struct MemoryLockService {
    held: parking_lot::Mutex<HashMap<String, (DateTime<Utc>, chrono::Duration)>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Store(format!("lock ttl out of range: {e}")))?;
        let now = Utc::now();
        let mut held = self.held.lock();

        // Lazy cleanup when the map grows large.
        if held.len() > 10_000 {
            held.retain(|_, (at, ttl)| now.signed_duration_since(*at) < *ttl);
        }

        if let Some((at, ttl)) = held.get(key) {
            if now.signed_duration_since(*at) < *ttl {
                return Ok(false);
            }
        }
        held.insert(key.to_owned(), (now, ttl));
        Ok(true)
    }

    async fn release(&self, key: &str) {
        self.held.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mt_domain::model::{aggregation_id, JobSource};
    use mt_domain::period;

    fn job_at(customer: &str, now: DateTime<Utc>) -> PendingAggJob {
        let bounds = period::current_period_bounds(PeriodType::Daily, now);
        PendingAggJob {
            id: aggregation_id(customer, PeriodType::Daily, &bounds.key),
            customer_id: customer.into(),
            period_type: PeriodType::Daily,
            period_key: bounds.key,
            period_start: bounds.start,
            period_end: bounds.end,
            status: JobStatus::Pending,
            created_at: now,
            queued_at: None,
            source: JobSource::Trigger,
        }
    }

    #[tokio::test]
    async fn upsert_dedups_on_deterministic_id() {
        let board = MemoryJobBoard::new(Arc::new(QueueHub::new()));
        let now = Utc.with_ymd_and_hms(2026, 1, 13, 9, 0, 0).unwrap();

        assert_eq!(
            board.upsert_pending(job_at("cA", now)).await.unwrap(),
            UpsertOutcome::Created
        );
        assert_eq!(
            board.upsert_pending(job_at("cA", now)).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(board.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bulk_enqueue_publishes_pending_rows_and_mark_queued_flips_them() {
        let hub = Arc::new(QueueHub::new());
        let mut rx = hub.take_receiver("jobs").expect("fresh queue");
        let board = MemoryJobBoard::new(hub);
        let now = Utc.with_ymd_and_hms(2026, 1, 13, 9, 0, 0).unwrap();

        board.upsert_pending(job_at("cA", now)).await.unwrap();
        board.upsert_pending(job_at("cB", now)).await.unwrap();

        assert_eq!(board.bulk_enqueue_pending("jobs").await.unwrap(), 2);
        assert_eq!(board.mark_queued().await.unwrap(), 2);

        let msg = rx.try_recv().unwrap();
        let job: PendingAggJob = serde_json::from_value(msg.payload).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "exactly two messages");

        // A second pass finds nothing pending.
        assert_eq!(board.bulk_enqueue_pending("jobs").await.unwrap(), 0);
        assert!(board
            .list()
            .await
            .unwrap()
            .iter()
            .all(|j| j.status == JobStatus::Queued && j.queued_at.is_some()));
    }

    #[tokio::test]
    async fn requeue_stuck_flips_old_queued_rows() {
        let board = MemoryJobBoard::new(Arc::new(QueueHub::new()));
        let now = Utc::now();

        board.upsert_pending(job_at("cA", now)).await.unwrap();
        board.mark_queued().await.unwrap();

        // Nothing is older than an hour yet.
        assert_eq!(
            board.requeue_stuck(chrono::Duration::hours(1)).await.unwrap(),
            0
        );
        // With a zero threshold the row counts as stuck.
        assert_eq!(
            board.requeue_stuck(chrono::Duration::zero()).await.unwrap(),
            1
        );
        assert!(board
            .list()
            .await
            .unwrap()
            .iter()
            .all(|j| j.status == JobStatus::Pending));
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let locks = MemoryLockService::new();
        let ttl = Duration::from_secs(120);

        assert!(locks.acquire("agg_lock_x", ttl).await.unwrap());
        assert!(!locks.acquire("agg_lock_x", ttl).await.unwrap());
        assert!(locks.acquire("agg_lock_y", ttl).await.unwrap());

        locks.release("agg_lock_x").await;
        assert!(locks.acquire("agg_lock_x", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_counts_as_absent() {
        let locks = MemoryLockService::new();
        assert!(locks
            .acquire("agg_lock_x", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(locks
            .acquire("agg_lock_x", Duration::from_millis(20))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn update_results_leaves_webhook_status_alone() {
        let store = MemoryAggregationStore::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 13, 9, 0, 0).unwrap();
        let bounds = period::current_period_bounds(PeriodType::Daily, now);
        let id = aggregation_id("cA", PeriodType::Daily, &bounds.key);

        store
            .insert(Aggregation {
                id: id.clone(),
                customer_id: "cA".into(),
                period: PeriodType::Daily,
                period_start: bounds.start,
                period_end: bounds.end,
                period_key: bounds.key,
                timestamp: now,
                events: BTreeMap::new(),
                event_counts: BTreeMap::new(),
                webhook_status: Default::default(),
            })
            .await
            .unwrap();

        store
            .update_webhook_status(
                &id,
                WebhookStatusPatch {
                    delivered: Some(true),
                    delivered_at: Some(now),
                    increment_attempts: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut events = BTreeMap::new();
        events.insert("api.calls".to_string(), 42.0);
        store
            .update_results(&id, now, events, BTreeMap::new())
            .await
            .unwrap();

        let doc = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(doc.events["api.calls"], 42.0);
        assert!(doc.webhook_status.delivered, "results update must not reset delivery state");
        assert_eq!(doc.webhook_status.attempts, 1);
    }

    #[tokio::test]
    async fn duplicate_aggregation_insert_is_rejected() {
        let store = MemoryAggregationStore::new();
        let now = Utc.with_ymd_and_hms(2026, 1, 13, 9, 0, 0).unwrap();
        let bounds = period::current_period_bounds(PeriodType::Daily, now);
        let doc = Aggregation {
            id: aggregation_id("cA", PeriodType::Daily, &bounds.key),
            customer_id: "cA".into(),
            period: PeriodType::Daily,
            period_start: bounds.start,
            period_end: bounds.end,
            period_key: bounds.key,
            timestamp: now,
            events: BTreeMap::new(),
            event_counts: BTreeMap::new(),
            webhook_status: Default::default(),
        };
        store.insert(doc.clone()).await.unwrap();
        assert!(store.insert(doc).await.is_err());
    }
}
