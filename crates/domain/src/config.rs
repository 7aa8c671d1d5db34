//! Service configuration — loaded once at startup, immutable afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::operator::Operator;
use crate::period::PeriodType;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Period granularities the schedulers enqueue work for, in order.
    #[serde(default)]
    pub periods: Vec<PeriodType>,
    /// Event types accepted at ingest, with the reduction applied to each.
    #[serde(default)]
    pub events: BTreeMap<String, EventTypeConfig>,
    /// Webhook subscribers notified of completed aggregations.
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Per-event-type settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTypeConfig {
    pub op: Operator,
}

/// One webhook subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// HMAC-SHA256 signing secret shared with the receiver.
    pub secret: String,
    #[serde(default = "d_true")]
    pub enabled: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Allowed CORS origins; `["*"]` allows all.
    #[serde(default = "d_origins")]
    pub cors_allowed_origins: Vec<String>,
    #[serde(default = "d_256")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            cors_allowed_origins: d_origins(),
            max_concurrent_requests: 256,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler & delivery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between cron passes.
    #[serde(default = "d_900")]
    pub cron_interval_secs: u64,
    /// Parallel consumers per queue.
    #[serde(default = "d_4")]
    pub worker_parallelism: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cron_interval_secs: 900,
            worker_parallelism: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeliveryConfig {
    /// Simulate webhook deliveries instead of issuing HTTP requests.
    /// The `DRY_RUN` environment variable overrides this at startup.
    #[serde(default)]
    pub dry_run: bool,
}

fn d_true() -> bool {
    true
}
fn d_host() -> String {
    "127.0.0.1".to_string()
}
fn d_port() -> u16 {
    3770
}
fn d_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn d_256() -> usize {
    256
}
fn d_900() -> u64 {
    900
}
fn d_4() -> usize {
    4
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Config {
    /// Parse a TOML document. Unknown operators and period types fail here,
    /// before the service starts.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Sanity-check the loaded configuration. Warnings leave the service
    /// runnable in a degraded mode; errors should abort startup.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let mut warn = |message: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message,
            })
        };

        if self.periods.is_empty() {
            warn("periods is empty — the schedulers will not enqueue any work".into());
        }
        if self.events.is_empty() {
            warn("events is empty — ingest endpoints will return 503".into());
        }
        let mut seen = std::collections::HashSet::new();
        for period in &self.periods {
            if !seen.insert(period) {
                warn(format!("period '{period}' is listed more than once"));
            }
        }

        let mut error = |message: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message,
            })
        };
        for (i, hook) in self.webhooks.iter().enumerate() {
            if !hook.enabled {
                continue;
            }
            if hook.url.is_empty() {
                error(format!("webhooks[{i}]: enabled webhook has an empty url"));
            } else if !hook.url.starts_with("http://") && !hook.url.starts_with("https://") {
                error(format!("webhooks[{i}]: url must be http(s): {}", hook.url));
            }
            if hook.secret.is_empty() {
                error(format!("webhooks[{i}]: enabled webhook has an empty secret"));
            }
        }
        if self.scheduler.cron_interval_secs == 0 {
            error("scheduler.cron_interval_secs must be greater than zero".into());
        }
        if self.scheduler.worker_parallelism == 0 {
            error("scheduler.worker_parallelism must be greater than zero".into());
        }

        issues
    }

    /// Webhooks that should receive deliveries.
    pub fn enabled_webhooks(&self) -> impl Iterator<Item = &WebhookConfig> {
        self.webhooks.iter().filter(|w| w.enabled)
    }
}
