use core::cell::RefCell;

use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};

use super::{Sample, StoreError, TimeRange, TimeSeriesStore};

/// In-memory time series kept sorted by capture time.
///
/// Queries binary-search the range bounds, which stands in for the capture
/// time index a database-backed store would have. Used by tests and by
/// deployments that do not need history across restarts.
pub struct MemoryStore {
    samples: Mutex<CriticalSectionRawMutex, RefCell<Vec<Sample>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(RefCell::new(Vec::new())),
        }
    }

    /// Number of stored samples
    pub fn len(&self) -> usize {
        self.samples.lock(|s| s.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSeriesStore for MemoryStore {
    fn append(&self, sample: &Sample) -> Result<(), StoreError> {
        self.samples.lock(|s| {
            let mut samples = s.borrow_mut();
            // Samples almost always arrive in order; this keeps equal
            // timestamps in arrival order when they don't.
            let at = samples.partition_point(|x| x.captured_at <= sample.captured_at);
            samples.insert(at, *sample);
        });
        Ok(())
    }

    fn query(&self, range: TimeRange) -> Result<Vec<Sample>, StoreError> {
        Ok(self.samples.lock(|s| {
            let samples = s.borrow();
            let lo = samples.partition_point(|x| x.captured_at < range.start);
            let hi = samples.partition_point(|x| x.captured_at <= range.end);
            samples[lo..hi.max(lo)].to_vec()
        }))
    }
}
