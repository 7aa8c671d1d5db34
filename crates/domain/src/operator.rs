//! Operator engine — pure reduction of event values.

use serde::{Deserialize, Serialize};

use crate::model::Event;

/// The reduction applied to one event type within a period.
///
/// A closed set: unknown operator names fail when the configuration is
/// deserialized, not at aggregation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    First,
    Last,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Sum => "sum",
            Operator::Avg => "avg",
            Operator::Min => "min",
            Operator::Max => "max",
            Operator::Count => "count",
            Operator::First => "first",
            Operator::Last => "last",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of reducing one event type: the value plus how many events fed it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reduced {
    pub value: f64,
    pub count: u64,
}

/// Reduce `events` with `op`. Returns `None` when there is no data, for
/// every operator — an empty input never produces a zero row.
///
/// `first`/`last` order by `received_at`; ties keep store insertion order
/// (slice position). All arithmetic is `f64`; no rounding is applied.
pub fn reduce(op: Operator, events: &[Event]) -> Option<Reduced> {
    if events.is_empty() {
        return None;
    }
    let count = events.len() as u64;
    let value = match op {
        Operator::Sum => events.iter().map(|e| e.value).sum(),
        Operator::Avg => events.iter().map(|e| e.value).sum::<f64>() / count as f64,
        Operator::Min => events.iter().map(|e| e.value).fold(f64::INFINITY, f64::min),
        Operator::Max => events.iter().map(|e| e.value).fold(f64::NEG_INFINITY, f64::max),
        Operator::Count => count as f64,
        Operator::First => {
            let mut best = &events[0];
            for e in &events[1..] {
                if e.received_at < best.received_at {
                    best = e;
                }
            }
            best.value
        }
        Operator::Last => {
            let mut best = &events[0];
            for e in &events[1..] {
                if e.received_at >= best.received_at {
                    best = e;
                }
            }
            best.value
        }
    };
    Some(Reduced { value, count })
}
