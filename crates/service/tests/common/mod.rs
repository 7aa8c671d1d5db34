//! Shared fixture: the full engine wired over the in-memory stores.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedReceiver;

use mt_domain::config::{Config, EventTypeConfig, WebhookConfig};
use mt_domain::model::{Event, PendingAggJob, WebhookJob};
use mt_domain::operator::Operator;
use mt_domain::period::PeriodType;

use mt_service::queue::{QueueHub, QueueMessage};
use mt_service::runtime::worker::{AggregationWorker, WorkerOutcome};
use mt_service::runtime::{scheduler::JobScheduler, AGGREGATION_QUEUE, WEBHOOK_QUEUE};
use mt_service::store::memory::{
    MemoryAggregationStore, MemoryEventStore, MemoryJobBoard, MemoryLockService,
};
use mt_service::store::{AggregationStore, EventStore, JobBoard, LockService};

pub struct TestStack {
    pub config: Arc<Config>,
    pub events: Arc<dyn EventStore>,
    pub aggregations: Arc<dyn AggregationStore>,
    pub jobs: Arc<dyn JobBoard>,
    pub locks: Arc<dyn LockService>,
    pub scheduler: JobScheduler,
    pub worker: AggregationWorker,
    pub agg_rx: UnboundedReceiver<QueueMessage>,
    pub webhook_rx: UnboundedReceiver<QueueMessage>,
}

pub fn event_types(entries: &[(&str, Operator)]) -> Config {
    let mut config = Config::default();
    config.periods = vec![PeriodType::Hourly, PeriodType::Daily];
    for (name, op) in entries {
        config
            .events
            .insert(name.to_string(), EventTypeConfig { op: *op });
    }
    config
}

pub fn with_webhook(mut config: Config, url: &str, secret: &str) -> Config {
    config.webhooks.push(WebhookConfig {
        url: url.to_string(),
        secret: secret.to_string(),
        enabled: true,
    });
    config
}

pub fn stack(config: Config) -> TestStack {
    let config = Arc::new(config);
    let hub = Arc::new(QueueHub::new());
    let agg_rx = hub.take_receiver(AGGREGATION_QUEUE).expect("fresh queue");
    let webhook_rx = hub.take_receiver(WEBHOOK_QUEUE).expect("fresh queue");

    let events: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
    let aggregations: Arc<dyn AggregationStore> = Arc::new(MemoryAggregationStore::new());
    let jobs: Arc<dyn JobBoard> = Arc::new(MemoryJobBoard::new(hub.clone()));
    let locks: Arc<dyn LockService> = Arc::new(MemoryLockService::new());

    let scheduler = JobScheduler::new(
        config.clone(),
        events.clone(),
        aggregations.clone(),
        jobs.clone(),
    );
    let worker = AggregationWorker::new(
        config.clone(),
        events.clone(),
        aggregations.clone(),
        jobs.clone(),
        locks.clone(),
        hub,
    );

    TestStack {
        config,
        events,
        aggregations,
        jobs,
        locks,
        scheduler,
        worker,
        agg_rx,
        webhook_rx,
    }
}

impl TestStack {
    pub async fn seed(
        &self,
        customer: &str,
        event_type: &str,
        value: f64,
        at: DateTime<Utc>,
    ) {
        self.events
            .insert(Event::new(customer, event_type, value, None, at))
            .await
            .expect("insert event");
    }

    /// Drain the aggregation queue, processing every job at `now`.
    pub async fn run_workers(&mut self, now: DateTime<Utc>) -> Vec<WorkerOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(msg) = self.agg_rx.try_recv() {
            let job: PendingAggJob =
                serde_json::from_value(msg.payload).expect("job payload");
            outcomes.push(self.worker.process_at(job, now).await.expect("worker run"));
        }
        outcomes
    }

    /// Drain the webhook queue without delivering.
    pub fn drain_webhook_jobs(&mut self) -> Vec<WebhookJob> {
        let mut jobs = Vec::new();
        while let Ok(msg) = self.webhook_rx.try_recv() {
            jobs.push(serde_json::from_value(msg.payload).expect("webhook payload"));
        }
        jobs
    }
}
