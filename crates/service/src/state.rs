use std::sync::Arc;

use mt_domain::config::Config;

use crate::queue::QueueHub;
use crate::runtime::dispatcher::WebhookDispatcher;
use crate::runtime::scheduler::JobScheduler;
use crate::runtime::worker::AggregationWorker;
use crate::store::{AggregationStore, EventStore, JobBoard, LockService};

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core** — the immutable configuration
/// - **Stores** — the four storage seams
/// - **Engine** — queue hub, scheduler, worker, dispatcher
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,

    // ── Stores ────────────────────────────────────────────────────────
    pub events: Arc<dyn EventStore>,
    pub aggregations: Arc<dyn AggregationStore>,
    pub jobs: Arc<dyn JobBoard>,
    pub locks: Arc<dyn LockService>,

    // ── Engine ────────────────────────────────────────────────────────
    pub queue: Arc<QueueHub>,
    pub scheduler: Arc<JobScheduler>,
    pub worker: Arc<AggregationWorker>,
    pub dispatcher: Arc<WebhookDispatcher>,
}
