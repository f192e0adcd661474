//! Durable time series of sensor samples.
//!
//! The acquisition worker is the only writer. Stats queries read
//! concurrently from request-handling threads, so stores take `&self` and
//! synchronize internally.

pub mod file_store;
pub mod memory;

use core::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file_store::FileStore;
pub use memory::MemoryStore;

/// One timestamped temperature/humidity reading.
///
/// Values are kept at full sensor precision. Rounding only happens when a
/// live update is built for observers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
    /// Capture time, stored as epoch milliseconds
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub captured_at: DateTime<Utc>,
}

impl Sample {
    pub fn new(temperature: f64, humidity: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            temperature,
            humidity,
            captured_at,
        }
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "[Sample] captured_at: {}, temperature: {:.2}°C, humidity: {:.2}%",
            self.captured_at.to_rfc3339(),
            self.temperature,
            self.humidity
        )
    }
}

/// Inclusive capture-time range used for store queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sample encoding error: {0}")]
    Encode(#[from] postcard::Error),
}

/// Append-only sink of timestamped samples, queryable by capture time.
pub trait TimeSeriesStore: Send + Sync {
    /// Durably append one sample.
    fn append(&self, sample: &Sample) -> Result<(), StoreError>;

    /// All samples captured within `range`, ascending by capture time.
    fn query(&self, range: TimeRange) -> Result<Vec<Sample>, StoreError>;
}
