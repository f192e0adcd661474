//! Time-bucketed statistics over the persisted sample series.
//!
//! Four fixed timeframes each pair a lookback window with a bucket width:
//!
//! | Timeframe | Lookback | Bucket width |
//! |-----------|----------|--------------|
//! | `1h`      | 1 hour   | 1 minute     |
//! | `24h`     | 24 hours | 15 minutes   |
//! | `7d`      | 7 days   | 1 hour       |
//! | `30d`     | 30 days  | 3 hours      |
//!
//! Buckets are labelled by truncating capture times down to a multiple of
//! the width counted from the Unix epoch, so labels from different queries
//! line up.

pub mod engine;

use core::fmt::Display;
use core::str::FromStr;
use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::Sample;

pub use engine::{AggregationEngine, AggregationError};

/// A named (lookback, bucket width) pair used for rollup queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "24h")]
    OneDay,
    #[serde(rename = "7d")]
    SevenDays,
    #[serde(rename = "30d")]
    ThirtyDays,
}

impl Timeframe {
    /// Every timeframe, in the order rollup snapshots list them.
    pub const ALL: [Timeframe; 4] = [
        Self::OneHour,
        Self::OneDay,
        Self::SevenDays,
        Self::ThirtyDays,
    ];

    /// Token used in stats queries and snapshot keys
    pub const fn label(self) -> &'static str {
        match self {
            Self::OneHour => "1h",
            Self::OneDay => "24h",
            Self::SevenDays => "7d",
            Self::ThirtyDays => "30d",
        }
    }

    pub const fn lookback_minutes(self) -> u32 {
        match self {
            Self::OneHour => 60,
            Self::OneDay => 24 * 60,
            Self::SevenDays => 7 * 24 * 60,
            Self::ThirtyDays => 30 * 24 * 60,
        }
    }

    pub const fn bucket_width_minutes(self) -> u32 {
        match self {
            Self::OneHour => 1,
            Self::OneDay => 15,
            Self::SevenDays => 60,
            Self::ThirtyDays => 180,
        }
    }

    pub fn lookback(self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.lookback_minutes()))
    }

    pub fn bucket_width(self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.bucket_width_minutes()))
    }

    /// Most buckets a single query can return.
    pub const fn max_buckets(self) -> u32 {
        self.lookback_minutes() / self.bucket_width_minutes()
    }
}

impl Display for Timeframe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown timeframe {0:?} (expected one of 1h, 24h, 7d, 30d)")]
pub struct InvalidTimeframe(pub String);

impl FromStr for Timeframe {
    type Err = InvalidTimeframe;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.label() == s)
            .ok_or_else(|| InvalidTimeframe(s.to_string()))
    }
}

/// Truncate `ts` down to a multiple of `width_minutes` counted from the
/// Unix epoch. Sub-second precision is dropped.
pub fn truncate_to_bucket(ts: DateTime<Utc>, width_minutes: u32) -> DateTime<Utc> {
    let width = i64::from(width_minutes.max(1)) * 60;
    let secs = ts.timestamp().div_euclid(width) * width;
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Aggregated statistics for one time-truncated group of samples.
///
/// Only ever built from at least one sample, so `count >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    /// Truncated capture time shared by every sample in the bucket
    #[serde(with = "extended_date")]
    pub bucket_start: DateTime<Utc>,
    pub avg_temp: f64,
    pub avg_humidity: f64,
    pub min_temp: f64,
    pub max_temp: f64,
    pub min_humidity: f64,
    pub max_humidity: f64,
    pub count: u32,
}

impl Bucket {
    /// Calculates a bucket from a slice of samples.
    ///
    /// Returns None if the samples slice is empty.
    pub fn from_samples(bucket_start: DateTime<Utc>, samples: &[Sample]) -> Option<Self> {
        let mut acc = BucketAccumulator::default();
        samples.iter().for_each(|s| acc.push(s));
        acc.finish(bucket_start)
    }
}

/// Running sums and extrema for one bucket.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BucketAccumulator {
    sum_temp: f64,
    sum_humidity: f64,
    min_temp: f64,
    max_temp: f64,
    min_humidity: f64,
    max_humidity: f64,
    count: u32,
}

impl Default for BucketAccumulator {
    fn default() -> Self {
        Self {
            sum_temp: 0.0,
            sum_humidity: 0.0,
            min_temp: f64::INFINITY,
            max_temp: f64::NEG_INFINITY,
            min_humidity: f64::INFINITY,
            max_humidity: f64::NEG_INFINITY,
            count: 0,
        }
    }
}

impl BucketAccumulator {
    pub(crate) fn push(&mut self, sample: &Sample) {
        self.sum_temp += sample.temperature;
        self.sum_humidity += sample.humidity;
        self.min_temp = self.min_temp.min(sample.temperature);
        self.max_temp = self.max_temp.max(sample.temperature);
        self.min_humidity = self.min_humidity.min(sample.humidity);
        self.max_humidity = self.max_humidity.max(sample.humidity);
        self.count += 1;
    }

    pub(crate) fn finish(self, bucket_start: DateTime<Utc>) -> Option<Bucket> {
        if self.count == 0 {
            return None;
        }

        let n = f64::from(self.count);
        Some(Bucket {
            bucket_start,
            avg_temp: self.sum_temp / n,
            avg_humidity: self.sum_humidity / n,
            min_temp: self.min_temp,
            max_temp: self.max_temp,
            min_humidity: self.min_humidity,
            max_humidity: self.max_humidity,
            count: self.count,
        })
    }
}

/// Group `samples` by truncated capture time and reduce each group.
///
/// The result is sparse (empty groups never appear) and strictly ascending
/// by `bucket_start`.
pub fn bucketize(samples: &[Sample], width_minutes: u32) -> Vec<Bucket> {
    let mut groups: BTreeMap<DateTime<Utc>, BucketAccumulator> = BTreeMap::new();
    for sample in samples {
        groups
            .entry(truncate_to_bucket(sample.captured_at, width_minutes))
            .or_default()
            .push(sample);
    }

    groups
        .into_iter()
        .filter_map(|(start, acc)| acc.finish(start))
        .collect()
}

/// Rollups for all four timeframes computed against one reference instant.
///
/// Serializes as a map from timeframe token to its bucket array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RollupSnapshot(BTreeMap<Timeframe, Vec<Bucket>>);

impl RollupSnapshot {
    pub fn insert(&mut self, timeframe: Timeframe, buckets: Vec<Bucket>) {
        self.0.insert(timeframe, buckets);
    }

    /// Buckets for `timeframe`; empty if it was never filled in.
    pub fn get(&self, timeframe: Timeframe) -> &[Bucket] {
        self.0.get(&timeframe).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (Timeframe, &[Bucket])> {
        self.0.iter().map(|(tf, b)| (*tf, b.as_slice()))
    }
}

/// `{"$date": "2024-05-01T12:00:00.000Z"}` representation of a UTC instant.
pub(crate) mod extended_date {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct ExtendedDate {
        #[serde(rename = "$date")]
        date: String,
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        ExtendedDate {
            date: ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let ExtendedDate { date } = ExtendedDate::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&date)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}
