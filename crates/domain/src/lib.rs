//! Core domain for the metering service: configuration, period indexing,
//! the operator engine, and the persisted document model.
//!
//! Everything in this crate is pure — no I/O, no clocks. Callers pass
//! `DateTime<Utc>` instants in explicitly, which keeps the period math and
//! the reducers directly testable.

pub mod config;
pub mod error;
pub mod model;
pub mod operator;
pub mod period;

pub use error::{Error, Result};
