//! The aggregation engine: scheduler, worker, and webhook dispatcher.

pub mod dispatcher;
pub mod scheduler;
pub mod worker;

/// Queue consumed by [`worker::AggregationWorker`].
pub const AGGREGATION_QUEUE: &str = "process-aggregation-job";

/// Queue consumed by [`dispatcher::WebhookDispatcher`].
pub const WEBHOOK_QUEUE: &str = "deliver-aggregation-webhook";
