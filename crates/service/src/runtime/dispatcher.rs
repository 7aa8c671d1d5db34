//! Webhook dispatcher — consumes `deliver-aggregation-webhook` messages.
//!
//! Delivery is at-least-once: a non-2xx response or transport error is
//! recorded on the aggregation and surfaced to the queue for redelivery.
//! Receivers dedup on the aggregation id carried in the payload.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use mt_domain::model::{Aggregation, WebhookJob};
use mt_domain::period::PeriodType;
use mt_domain::{Error, Result};

use crate::store::{AggregationStore, WebhookStatusPatch};

type HmacSha256 = Hmac<Sha256>;

/// Hard timeout per delivery attempt.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Receiver-side tolerance for the signed timestamp.
pub const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
const UA: &str = concat!("Codehooks-Metering/", env!("CARGO_PKG_VERSION"));

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wire payload for one completed aggregation. Serialization is canonical:
/// struct field order plus key-sorted maps, so signing the string is
/// stable.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    customer_id: &'a str,
    period: PeriodType,
    data: EnvelopeData<'a>,
    /// Unix seconds at send time.
    created: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeData<'a> {
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    period_key: &'a str,
    timestamp: DateTime<Utc>,
    events: &'a BTreeMap<String, f64>,
    event_counts: &'a BTreeMap<String, u64>,
}

fn build_payload(agg: &Aggregation, created: i64) -> Result<String> {
    let envelope = WebhookEnvelope {
        kind: "aggregation.completed",
        customer_id: &agg.customer_id,
        period: agg.period,
        data: EnvelopeData {
            period_start: agg.period_start,
            period_end: agg.period_end,
            period_key: &agg.period_key,
            timestamp: agg.timestamp,
            events: &agg.events,
            event_counts: &agg.event_counts,
        },
        created,
    };
    Ok(serde_json::to_string(&envelope)?)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `v1=<hex(HMAC_SHA256(secret, "{timestamp}.{payload}"))>`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    format!("v1={}", hex::encode(mac.finalize().into_bytes()))
}

/// Receiver-side verification: recompute, compare in constant time, and
/// reject timestamps skewed more than [`TIMESTAMP_TOLERANCE_SECS`].
pub fn verify_signature(
    secret: &str,
    timestamp: i64,
    payload: &str,
    signature: &str,
    now: DateTime<Utc>,
) -> bool {
    if (now.timestamp() - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
        return false;
    }
    let expected = sign_payload(secret, timestamp, payload);
    expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() == 1
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WebhookDispatcher {
    aggregations: Arc<dyn AggregationStore>,
    http: reqwest::Client,
    dry_run: bool,
}

impl WebhookDispatcher {
    pub fn new(aggregations: Arc<dyn AggregationStore>, dry_run: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            aggregations,
            http,
            dry_run,
        })
    }

    /// Deliver one (aggregation, webhook) pair.
    pub async fn deliver(&self, job: WebhookJob) -> Result<()> {
        let now = Utc::now();
        let Some(agg) = self.aggregations.find_by_id(&job.aggregation_id).await? else {
            // Nothing to deliver; swallow the message.
            tracing::warn!(
                aggregation_id = %job.aggregation_id,
                "aggregation missing, dropping webhook delivery"
            );
            return Ok(());
        };

        let ts = now.timestamp();
        let payload = build_payload(&agg, ts)?;
        let signature = sign_payload(&job.webhook_secret, ts, &payload);

        if self.dry_run {
            tracing::info!(
                aggregation_id = %job.aggregation_id,
                url = %job.webhook_url,
                timestamp = ts,
                signature = %signature,
                payload = %payload,
                "dry run, skipping HTTP delivery"
            );
            self.aggregations
                .update_webhook_status(
                    &job.aggregation_id,
                    WebhookStatusPatch {
                        delivered: Some(true),
                        delivered_at: Some(now),
                        increment_attempts: true,
                        dry_run: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        let response = self
            .http
            .post(&job.webhook_url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, &signature)
            .header(TIMESTAMP_HEADER, ts.to_string())
            .header(USER_AGENT, UA)
            .body(payload)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                self.aggregations
                    .update_webhook_status(
                        &job.aggregation_id,
                        WebhookStatusPatch {
                            delivered: Some(true),
                            delivered_at: Some(now),
                            increment_attempts: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                tracing::info!(
                    aggregation_id = %job.aggregation_id,
                    url = %job.webhook_url,
                    "webhook delivered"
                );
                Ok(())
            }
            Ok(resp) => {
                let message = format!("webhook returned {}", resp.status());
                self.record_failure(&job, &message, now).await;
                Err(Error::Delivery(message))
            }
            Err(e) => {
                let message = format!("webhook request failed: {e}");
                self.record_failure(&job, &message, now).await;
                Err(Error::Delivery(message))
            }
        }
    }

    async fn record_failure(&self, job: &WebhookJob, message: &str, now: DateTime<Utc>) {
        tracing::warn!(
            aggregation_id = %job.aggregation_id,
            url = %job.webhook_url,
            error = %message,
            "webhook delivery failed"
        );
        let patch = WebhookStatusPatch {
            last_error: Some(message.to_owned()),
            last_attempt_at: Some(now),
            increment_attempts: true,
            ..Default::default()
        };
        // The delivery error is what matters; a failed status write only
        // costs observability.
        if let Err(e) = self
            .aggregations
            .update_webhook_status(&job.aggregation_id, patch)
            .await
        {
            tracing::warn!(
                aggregation_id = %job.aggregation_id,
                error = %e,
                "failed to record webhook failure"
            );
        }
    }
}
