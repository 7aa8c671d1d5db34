//! Job scheduling — the cron pass and the manual trigger.
//!
//! Both entry points only discover work and enqueue it; aggregation itself
//! is always delegated to the worker queue. Deterministic job ids make
//! repeated passes idempotent: re-running a scheduler never duplicates a
//! job or an aggregation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use mt_domain::config::Config;
use mt_domain::model::{aggregation_id, JobSource, JobStatus, PendingAggJob};
use mt_domain::period::{self, PeriodBounds, PeriodType};
use mt_domain::{Error, Result};

use crate::store::{AggregationStore, EventStore, JobBoard, UpsertOutcome};

use super::AGGREGATION_QUEUE;

/// Counts returned by the manual trigger (`202 Accepted` body).
#[derive(Clone, Copy, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerReport {
    pub jobs_created: u64,
    pub jobs_updated: u64,
    pub jobs_queued: u64,
    pub customers_found: u64,
    pub periods_configured: u64,
    pub events_scanned: u64,
}

pub struct JobScheduler {
    config: Arc<Config>,
    events: Arc<dyn EventStore>,
    aggregations: Arc<dyn AggregationStore>,
    jobs: Arc<dyn JobBoard>,
}

impl JobScheduler {
    pub fn new(
        config: Arc<Config>,
        events: Arc<dyn EventStore>,
        aggregations: Arc<dyn AggregationStore>,
        jobs: Arc<dyn JobBoard>,
    ) -> Self {
        Self {
            config,
            events,
            aggregations,
            jobs,
        }
    }

    fn build_job(
        customer: &str,
        period: PeriodType,
        bounds: &PeriodBounds,
        source: JobSource,
        now: DateTime<Utc>,
    ) -> PendingAggJob {
        PendingAggJob {
            id: aggregation_id(customer, period, &bounds.key),
            customer_id: customer.to_owned(),
            period_type: period,
            period_key: bounds.key.clone(),
            period_start: bounds.start,
            period_end: bounds.end,
            status: JobStatus::Pending,
            created_at: now,
            queued_at: None,
            source,
        }
    }

    /// Cron entry point: enqueue jobs closing the previous completed
    /// period of every enabled period type.
    pub async fn cron_pass(&self, now: DateTime<Utc>) -> Result<()> {
        if self.config.periods.is_empty() {
            tracing::info!("no periods configured, skipping cron pass");
            return Ok(());
        }

        let scan = self.events.scan_customer_ids().await?;
        if scan.customers.is_empty() {
            tracing::debug!("no customers found, nothing to schedule");
            return Ok(());
        }

        let mut upserted = 0u64;
        for &period in &self.config.periods {
            let bounds = period::previous_completed_period_bounds(period, now);

            // One-document probe: skip period types with no events at all.
            if !self.events.any_with_period_key(period, &bounds.key).await? {
                tracing::debug!(period = %period, key = %bounds.key, "no events in period, skipping");
                continue;
            }

            for customer in &scan.customers {
                let agg_id = aggregation_id(customer, period, &bounds.key);
                if self.aggregations.find_by_id(&agg_id).await?.is_some() {
                    // Already finalized on an earlier pass.
                    continue;
                }
                self.jobs
                    .upsert_pending(Self::build_job(customer, period, &bounds, JobSource::Cron, now))
                    .await?;
                upserted += 1;
            }
        }

        let enqueued = self.jobs.bulk_enqueue_pending(AGGREGATION_QUEUE).await?;
        self.jobs.mark_queued().await?;
        tracing::info!(
            customers = scan.customers.len(),
            upserted,
            enqueued,
            "cron pass complete"
        );
        Ok(())
    }

    /// Manual trigger: enqueue jobs for the *current* period of every
    /// enabled period type, so dashboards can read in-progress aggregates.
    pub async fn manual_trigger(&self, now: DateTime<Utc>) -> Result<TriggerReport> {
        if self.config.periods.is_empty() {
            return Err(Error::Config("no periods configured".into()));
        }

        let scan = self.events.scan_customer_ids().await?;
        let mut report = TriggerReport {
            customers_found: scan.customers.len() as u64,
            periods_configured: self.config.periods.len() as u64,
            events_scanned: scan.events_scanned,
            ..Default::default()
        };

        for customer in &scan.customers {
            for &period in &self.config.periods {
                let bounds = period::current_period_bounds(period, now);
                let job = Self::build_job(customer, period, &bounds, JobSource::Trigger, now);
                match self.jobs.upsert_pending(job).await? {
                    UpsertOutcome::Created => report.jobs_created += 1,
                    UpsertOutcome::Updated => report.jobs_updated += 1,
                }
            }
        }

        report.jobs_queued = self.jobs.bulk_enqueue_pending(AGGREGATION_QUEUE).await?;
        self.jobs.mark_queued().await?;
        tracing::info!(
            jobs_created = report.jobs_created,
            jobs_updated = report.jobs_updated,
            jobs_queued = report.jobs_queued,
            "manual trigger complete"
        );
        Ok(report)
    }
}
