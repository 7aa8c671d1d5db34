//! Aggregation worker — consumes `process-aggregation-job` messages.
//!
//! One invocation per job. Correctness under parallel delivery rests on
//! two things: the advisory lock (fast skip when another worker holds the
//! id) and the existence checks against the deterministic aggregation id,
//! which make redeliveries and duplicate jobs safe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use mt_domain::config::Config;
use mt_domain::model::{lock_key, Aggregation, PendingAggJob, WebhookJob, WebhookStatus};
use mt_domain::operator::{self, Operator, Reduced};
use mt_domain::Result;

use crate::queue::QueueHub;
use crate::store::{AggregationStore, EventStore, JobBoard, LockService};

use super::WEBHOOK_QUEUE;

/// Lock TTL: a crashed worker's lock heals itself after this long.
pub const LOCK_TTL: Duration = Duration::from_secs(120);

/// What a worker run did, for logging and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Another worker holds the lock for this id.
    LockBusy,
    /// The period is closed and its aggregation already exists.
    AlreadyFinal,
    /// No event type produced data; nothing was written.
    Empty,
    /// A new aggregation document was created. Carries the number of
    /// webhook deliveries enqueued (zero for open periods).
    Inserted { webhooks_enqueued: usize },
    /// An existing open-period aggregation was refreshed.
    Updated,
}

pub struct AggregationWorker {
    config: Arc<Config>,
    events: Arc<dyn EventStore>,
    aggregations: Arc<dyn AggregationStore>,
    jobs: Arc<dyn JobBoard>,
    locks: Arc<dyn LockService>,
    queue: Arc<QueueHub>,
}

impl AggregationWorker {
    pub fn new(
        config: Arc<Config>,
        events: Arc<dyn EventStore>,
        aggregations: Arc<dyn AggregationStore>,
        jobs: Arc<dyn JobBoard>,
        locks: Arc<dyn LockService>,
        queue: Arc<QueueHub>,
    ) -> Self {
        Self {
            config,
            events,
            aggregations,
            jobs,
            locks,
            queue,
        }
    }

    /// Process one job against the wall clock.
    pub async fn process(&self, job: PendingAggJob) -> Result<WorkerOutcome> {
        self.process_at(job, Utc::now()).await
    }

    /// Process one job at an explicit instant (the test seam).
    ///
    /// An `Err` leaves the lock to expire on its TTL and the job row in
    /// place, and bubbles up so the queue redelivers the message.
    pub async fn process_at(
        &self,
        job: PendingAggJob,
        now: DateTime<Utc>,
    ) -> Result<WorkerOutcome> {
        let lock = lock_key(&job.id);
        if !self.locks.acquire(&lock, LOCK_TTL).await? {
            tracing::info!(aggregation_id = %job.id, "lock held elsewhere, skipping");
            return Ok(WorkerOutcome::LockBusy);
        }

        let outcome = self.run_locked(&job, now).await?;

        self.locks.release(&lock).await;
        self.jobs.delete(&job.id).await?;
        Ok(outcome)
    }

    async fn run_locked(&self, job: &PendingAggJob, now: DateTime<Utc>) -> Result<WorkerOutcome> {
        // Fast skip: a closed period whose aggregation already exists is
        // final; nothing may rewrite it.
        if now >= job.period_end && self.aggregations.find_by_id(&job.id).await?.is_some() {
            tracing::debug!(aggregation_id = %job.id, "period closed and aggregation present, skipping");
            return Ok(WorkerOutcome::AlreadyFinal);
        }

        let mut events = BTreeMap::new();
        let mut event_counts = BTreeMap::new();
        for (event_type, type_config) in &self.config.events {
            match self.reduce_one(job, event_type, type_config.op).await {
                Ok(Some(Reduced { value, count })) => {
                    events.insert(event_type.clone(), value);
                    event_counts.insert(event_type.clone(), count);
                }
                Ok(None) => {}
                Err(e) => {
                    // One failing event type does not sink the job.
                    tracing::warn!(
                        aggregation_id = %job.id,
                        event_type = %event_type,
                        error = %e,
                        "event type aggregation failed, omitting"
                    );
                }
            }
        }

        if events.is_empty() {
            // Delete the job anyway, or empty work re-enqueues forever.
            tracing::debug!(aggregation_id = %job.id, "no data for period, dropping job");
            return Ok(WorkerOutcome::Empty);
        }

        match self.aggregations.find_by_id(&job.id).await? {
            None => {
                let doc = Aggregation {
                    id: job.id.clone(),
                    customer_id: job.customer_id.clone(),
                    period: job.period_type,
                    period_start: job.period_start,
                    period_end: job.period_end,
                    period_key: job.period_key.clone(),
                    timestamp: now,
                    events,
                    event_counts,
                    webhook_status: WebhookStatus::default(),
                };
                self.aggregations.insert(doc).await?;

                let webhooks_enqueued = if now > job.period_end {
                    self.enqueue_webhooks(job)?
                } else {
                    0
                };
                tracing::info!(
                    aggregation_id = %job.id,
                    webhooks_enqueued,
                    "aggregation inserted"
                );
                Ok(WorkerOutcome::Inserted { webhooks_enqueued })
            }
            Some(_) => {
                // Open-period refresh. Delivery state is never touched
                // here, so an already-sent webhook can't be resurrected.
                self.aggregations
                    .update_results(&job.id, now, events, event_counts)
                    .await?;
                tracing::info!(aggregation_id = %job.id, "aggregation refreshed");
                Ok(WorkerOutcome::Updated)
            }
        }
    }

    async fn reduce_one(
        &self,
        job: &PendingAggJob,
        event_type: &str,
        op: Operator,
    ) -> Result<Option<Reduced>> {
        let matched = self
            .events
            .query_for_aggregation(
                &job.customer_id,
                event_type,
                job.period_type,
                &job.period_key,
                op,
            )
            .await?;
        Ok(operator::reduce(op, &matched))
    }

    /// One delivery job per enabled webhook. Returns how many were
    /// enqueued.
    fn enqueue_webhooks(&self, job: &PendingAggJob) -> Result<usize> {
        let mut enqueued = 0;
        for hook in self.config.enabled_webhooks() {
            let delivery = WebhookJob {
                aggregation_id: job.id.clone(),
                webhook_url: hook.url.clone(),
                webhook_secret: hook.secret.clone(),
                customer_id: job.customer_id.clone(),
                period: job.period_type,
            };
            self.queue
                .publish(WEBHOOK_QUEUE, serde_json::to_value(&delivery)?);
            enqueued += 1;
        }
        Ok(enqueued)
    }
}
