use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::warn;
use thiserror::Error;

use super::{Bucket, RollupSnapshot, Timeframe, bucketize};
use crate::storage::{StoreError, TimeRange, TimeSeriesStore};

#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("rollup query failed: {0}")]
    Store(#[from] StoreError),
}

/// Computes bucketed rollups on demand from whatever has been persisted.
///
/// Pure read and reduce: it never writes to the store and holds no state of
/// its own, so any number of request threads may share one instance with
/// the acquisition worker.
pub struct AggregationEngine<T> {
    store: Arc<T>,
}

impl<T> Clone for AggregationEngine<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<T: TimeSeriesStore> AggregationEngine<T> {
    pub fn new(store: Arc<T>) -> Self {
        Self { store }
    }

    /// Capture-time range covered by `timeframe` as seen from `now`.
    ///
    /// The oldest bucket may be partial; it keeps its truncated label, which
    /// can fall up to one bucket width before `now - lookback`.
    pub fn window(timeframe: Timeframe, now: DateTime<Utc>) -> TimeRange {
        TimeRange::new(now - timeframe.lookback(), now)
    }

    /// Buckets for `timeframe`, ascending by `bucket_start`.
    pub fn compute(
        &self,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Result<Vec<Bucket>, AggregationError> {
        let samples = self.store.query(Self::window(timeframe, now))?;
        Ok(bucketize(&samples, timeframe.bucket_width_minutes()))
    }

    /// All four timeframes against the same reference instant.
    ///
    /// A failed query leaves that timeframe empty instead of failing the
    /// whole snapshot.
    pub fn compute_all(&self, now: DateTime<Utc>) -> RollupSnapshot {
        let mut snapshot = RollupSnapshot::default();
        for timeframe in Timeframe::ALL {
            let buckets = self.compute(timeframe, now).unwrap_or_else(|e| {
                warn!("Using empty {} rollup: {}", timeframe, e);
                Vec::new()
            });
            snapshot.insert(timeframe, buckets);
        }
        snapshot
    }

    /// Stats query for a raw timeframe token.
    ///
    /// Unknown tokens and failed queries both answer with an empty list.
    pub fn query_token(&self, token: &str, now: DateTime<Utc>) -> Vec<Bucket> {
        let Ok(timeframe) = token.parse::<Timeframe>() else {
            warn!("Rejected stats query for unknown timeframe {:?}", token);
            return Vec::new();
        };

        self.compute(timeframe, now).unwrap_or_else(|e| {
            warn!("Stats query for {} failed: {}", timeframe, e);
            Vec::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::truncate_to_bucket;
    use crate::storage::{MemoryStore, Sample};
    use chrono::{TimeDelta, TimeZone};

    struct BrokenStore;

    impl TimeSeriesStore for BrokenStore {
        fn append(&self, _: &Sample) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("read-only")))
        }

        fn query(&self, _: TimeRange) -> Result<Vec<Sample>, StoreError> {
            Err(StoreError::Io(std::io::Error::other("connection reset")))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 31, 12, 34, 56).unwrap()
    }

    /// One sample every 7 minutes going back 35 days.
    fn seeded_engine() -> AggregationEngine<MemoryStore> {
        let store = MemoryStore::new();
        let mut t = now() - TimeDelta::days(35);
        let mut i = 0.0;
        while t <= now() {
            store.append(&Sample::new(20.0 + i % 5.0, 40.0 + i % 7.0, t)).unwrap();
            t += TimeDelta::minutes(7);
            i += 1.0;
        }
        AggregationEngine::new(Arc::new(store))
    }

    #[test]
    fn test_buckets_are_nonempty_and_strictly_ascending() {
        let engine = seeded_engine();
        for tf in Timeframe::ALL {
            let buckets = engine.compute(tf, now()).unwrap();
            assert!(!buckets.is_empty(), "{tf}");
            assert!(buckets.iter().all(|b| b.count >= 1), "{tf}");
            assert!(
                buckets.windows(2).all(|w| w[0].bucket_start < w[1].bucket_start),
                "{tf}"
            );
            assert!(buckets.len() <= tf.max_buckets() as usize + 1, "{tf}");
        }
    }

    #[test]
    fn test_buckets_stay_inside_window_and_aligned() {
        let engine = seeded_engine();
        for tf in Timeframe::ALL {
            for b in engine.compute(tf, now()).unwrap() {
                let oldest = truncate_to_bucket(now() - tf.lookback(), tf.bucket_width_minutes());
                assert!(b.bucket_start >= oldest, "{tf}");
                assert!(b.bucket_start <= now(), "{tf}");
                let width_secs = i64::from(tf.bucket_width_minutes()) * 60;
                assert_eq!(b.bucket_start.timestamp() % width_secs, 0, "{tf}");
                assert_eq!(truncate_to_bucket(b.bucket_start, tf.bucket_width_minutes()), b.bucket_start);
            }
        }
    }

    #[test]
    fn test_counts_add_up_to_samples_in_window() {
        let engine = seeded_engine();
        for tf in Timeframe::ALL {
            let window = AggregationEngine::<MemoryStore>::window(tf, now());
            let expected = engine.store.query(window).unwrap().len() as u32;
            let total: u32 = engine.compute(tf, now()).unwrap().iter().map(|b| b.count).sum();
            assert_eq!(total, expected, "{tf}");
        }
    }

    #[test]
    fn test_oldest_partial_bucket_is_kept() {
        for (tf, age) in [
            (Timeframe::OneHour, TimeDelta::minutes(59) + TimeDelta::seconds(58)),
            (Timeframe::ThirtyDays, TimeDelta::days(30) - TimeDelta::minutes(10)),
        ] {
            let store = Arc::new(MemoryStore::new());
            let captured_at = now() - age;
            store.append(&Sample::new(21.0, 45.0, captured_at)).unwrap();

            let buckets = AggregationEngine::new(store).compute(tf, now()).unwrap();
            assert_eq!(buckets.len(), 1, "{tf}");
            assert_eq!(buckets[0].count, 1, "{tf}");
            assert_eq!(
                buckets[0].bucket_start,
                truncate_to_bucket(captured_at, tf.bucket_width_minutes()),
                "{tf}"
            );
        }
    }

    #[test]
    fn test_sample_just_outside_lookback_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        store
            .append(&Sample::new(21.0, 45.0, now() - TimeDelta::minutes(60) - TimeDelta::seconds(1)))
            .unwrap();
        store.append(&Sample::new(22.0, 45.0, now() - TimeDelta::minutes(60))).unwrap();

        let buckets = AggregationEngine::new(store).compute(Timeframe::OneHour, now()).unwrap();
        let total: u32 = buckets.iter().map(|b| b.count).sum();
        assert_eq!(total, 1);
        assert_eq!(buckets[0].max_temp, 22.0);
    }

    #[test]
    fn test_compute_is_idempotent() {
        let engine = seeded_engine();
        for tf in Timeframe::ALL {
            assert_eq!(engine.compute(tf, now()).unwrap(), engine.compute(tf, now()).unwrap());
        }
        assert_eq!(engine.compute_all(now()), engine.compute_all(now()));
    }

    #[test]
    fn test_samples_after_reference_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        store.append(&Sample::new(20.0, 40.0, now())).unwrap();
        store
            .append(&Sample::new(30.0, 60.0, now() + TimeDelta::seconds(1)))
            .unwrap();

        let buckets = AggregationEngine::new(store).compute(Timeframe::OneHour, now()).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].max_temp, 20.0);
    }

    #[test]
    fn test_empty_store_yields_empty_rollups() {
        let engine = AggregationEngine::new(Arc::new(MemoryStore::new()));
        let snapshot = engine.compute_all(now());
        assert_eq!(snapshot.iter().count(), 4);
        assert!(snapshot.iter().all(|(_, b)| b.is_empty()));
    }

    #[test]
    fn test_store_failure_is_an_empty_rollup() {
        let engine = AggregationEngine::new(Arc::new(BrokenStore));
        assert!(matches!(
            engine.compute(Timeframe::OneDay, now()),
            Err(AggregationError::Store(_))
        ));

        let snapshot = engine.compute_all(now());
        assert_eq!(snapshot.iter().count(), 4);
        assert!(snapshot.iter().all(|(_, b)| b.is_empty()));
        assert!(engine.query_token("7d", now()).is_empty());
    }

    #[test]
    fn test_query_token() {
        let engine = seeded_engine();
        assert_eq!(
            engine.query_token("24h", now()),
            engine.compute(Timeframe::OneDay, now()).unwrap()
        );
        assert!(engine.query_token("1y", now()).is_empty());
    }
}
