//! Period indexing — canonical period keys and bounds, all UTC.
//!
//! The single source of truth for when a period begins and ends. Keys are
//! fixed-width strings (`day = YYYYMMDD`, `week = YYYYWW` with ISO-8601
//! week numbering) so they compare and sort lexically. Bounds are
//! inclusive on both ends: a period starts at `.000` and ends at `.999`.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Period granularities the aggregation pipeline operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl PeriodType {
    pub const ALL: [PeriodType; 5] = [
        PeriodType::Hourly,
        PeriodType::Daily,
        PeriodType::Weekly,
        PeriodType::Monthly,
        PeriodType::Yearly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Hourly => "hourly",
            PeriodType::Daily => "daily",
            PeriodType::Weekly => "weekly",
            PeriodType::Monthly => "monthly",
            PeriodType::Yearly => "yearly",
        }
    }
}

impl std::fmt::Display for PeriodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PeriodType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "hourly" => Ok(PeriodType::Hourly),
            "daily" => Ok(PeriodType::Daily),
            "weekly" => Ok(PeriodType::Weekly),
            "monthly" => Ok(PeriodType::Monthly),
            "yearly" => Ok(PeriodType::Yearly),
            other => Err(Error::Config(format!("unknown period type: {other}"))),
        }
    }
}

/// The six canonical period keys for one instant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodKeys {
    pub minute: String,
    pub hour: String,
    pub day: String,
    pub week: String,
    pub month: String,
    pub year: String,
}

/// Inclusive bounds and key of one period.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeriodBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub key: String,
}

impl PeriodBounds {
    /// A period is complete iff its end lies strictly before `now`.
    pub fn is_complete(&self, now: DateTime<Utc>) -> bool {
        now > self.end
    }
}

/// Compute the six canonical period keys for `t`, zero-padded, UTC.
///
/// The `week` key uses the ISO week-based year, which can differ from the
/// calendar year near January 1st (e.g. 2024-12-30 is `202501`).
pub fn period_keys(t: DateTime<Utc>) -> PeriodKeys {
    let iso = t.iso_week();
    PeriodKeys {
        minute: t.format("%Y%m%d%H%M").to_string(),
        hour: t.format("%Y%m%d%H").to_string(),
        day: t.format("%Y%m%d").to_string(),
        week: format!("{:04}{:02}", iso.year(), iso.week()),
        month: t.format("%Y%m").to_string(),
        year: t.format("%Y").to_string(),
    }
}

/// Which of the six event keys an aggregation of `period` filters by.
pub fn period_field(period: PeriodType) -> &'static str {
    match period {
        PeriodType::Hourly => "hour",
        PeriodType::Daily => "day",
        PeriodType::Weekly => "week",
        PeriodType::Monthly => "month",
        PeriodType::Yearly => "year",
    }
}

/// The key an event carries for the given period type.
pub fn key_for(period: PeriodType, keys: &PeriodKeys) -> &str {
    match period {
        PeriodType::Hourly => &keys.hour,
        PeriodType::Daily => &keys.day,
        PeriodType::Weekly => &keys.week,
        PeriodType::Monthly => &keys.month,
        PeriodType::Yearly => &keys.year,
    }
}

fn utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&naive)
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).expect("midnight is a valid time")
}

/// Start of the period containing `t`.
fn period_start(period: PeriodType, t: DateTime<Utc>) -> DateTime<Utc> {
    let date = t.date_naive();
    match period {
        PeriodType::Hourly => utc(date
            .and_hms_opt(t.hour(), 0, 0)
            .expect("whole hour is a valid time")),
        PeriodType::Daily => utc(midnight(date)),
        PeriodType::Weekly => {
            let monday = date - Duration::days(t.weekday().num_days_from_monday() as i64);
            utc(midnight(monday))
        }
        PeriodType::Monthly => {
            let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
                .expect("first of month is a valid date");
            utc(midnight(first))
        }
        PeriodType::Yearly => {
            let first = NaiveDate::from_ymd_opt(date.year(), 1, 1)
                .expect("January 1st is a valid date");
            utc(midnight(first))
        }
    }
}

/// Start of the period immediately following the one starting at `start`.
fn next_period_start(period: PeriodType, start: DateTime<Utc>) -> DateTime<Utc> {
    match period {
        PeriodType::Hourly => start + Duration::hours(1),
        PeriodType::Daily => start + Duration::days(1),
        PeriodType::Weekly => start + Duration::days(7),
        PeriodType::Monthly => {
            let (year, month) = if start.month() == 12 {
                (start.year() + 1, 1)
            } else {
                (start.year(), start.month() + 1)
            };
            let first = NaiveDate::from_ymd_opt(year, month, 1)
                .expect("first of month is a valid date");
            utc(midnight(first))
        }
        PeriodType::Yearly => {
            let first = NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)
                .expect("January 1st is a valid date");
            utc(midnight(first))
        }
    }
}

/// Bounds and key of the period *containing* `now`.
pub fn current_period_bounds(period: PeriodType, now: DateTime<Utc>) -> PeriodBounds {
    let start = period_start(period, now);
    let end = next_period_start(period, start) - Duration::milliseconds(1);
    let keys = period_keys(now);
    PeriodBounds {
        start,
        end,
        key: key_for(period, &keys).to_owned(),
    }
}

/// Bounds and key of the period immediately *preceding* the one
/// containing `now` — the most recent completed period.
pub fn previous_completed_period_bounds(period: PeriodType, now: DateTime<Utc>) -> PeriodBounds {
    let current = current_period_bounds(period, now);
    current_period_bounds(period, current.start - Duration::milliseconds(1))
}
