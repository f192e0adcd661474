//! The acquisition loop: one worker that reads the sensor on a fixed tick
//! and routes each reading by two independent cadences.
//!
//! - **Emit cadence**: at most one rounded live update per `emit_interval`.
//! - **Persist cadence**: at most one full-precision append per
//!   `persist_interval`, each followed in the same tick by a recompute and
//!   broadcast of all rollups.
//!
//! Sensor failures only back off: 0.5s retries, stretched to 5s once more
//! than five reads in a row have failed.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use log::{debug, error, info, warn};

use crate::fanout::{Fanout, LiveUpdate};
use crate::rollup::AggregationEngine;
use crate::sensors::SensorSource;
use crate::storage::{Sample, TimeSeriesStore};

/// Pacing and backoff policy of the acquisition loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    /// Sleep between successful ticks
    pub tick_interval: Duration,
    /// Minimum spacing of live updates
    pub emit_interval: Duration,
    /// Minimum spacing of persisted samples
    pub persist_interval: Duration,
    /// Retry delay after a failed read
    pub short_backoff: Duration,
    /// Retry delay once the failure streak exceeds `long_backoff_after`
    pub long_backoff: Duration,
    pub long_backoff_after: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            emit_interval: Duration::from_secs(2),
            persist_interval: Duration::from_secs(60),
            short_backoff: Duration::from_millis(500),
            long_backoff: Duration::from_secs(5),
            long_backoff_after: 5,
        }
    }
}

/// Cadence bookkeeping, mutated only by the acquisition worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopState {
    pub last_emit_at: Option<DateTime<Utc>>,
    pub last_persist_at: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
}

/// Shared cell holding the worker's [`LoopState`].
///
/// Readers always get a whole snapshot taken under the lock.
pub struct LoopStateCell(Mutex<CriticalSectionRawMutex, Cell<LoopState>>);

impl LoopStateCell {
    pub fn new() -> Self {
        Self(Mutex::new(Cell::new(LoopState::default())))
    }

    pub fn snapshot(&self) -> LoopState {
        self.0.lock(Cell::get)
    }

    fn store(&self, state: LoopState) {
        self.0.lock(|s| s.set(state));
    }
}

impl Default for LoopStateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative stop request for the acquisition worker.
///
/// Checked at every tick boundary. A pending sleep is cut short, so a stop
/// lands within one tick even during the long backoff.
pub struct StopSignal {
    requested: AtomicBool,
    wake: Signal<CriticalSectionRawMutex, ()>,
}

impl StopSignal {
    pub const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            wake: Signal::new(),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
        self.wake.signal(());
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Clear a previous request before the worker is started again.
    pub fn reset(&self) {
        self.requested.store(false, Ordering::Release);
        self.wake.reset();
    }

    /// Sleep for `duration`; returns true if a stop was requested meanwhile.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_requested() {
            return true;
        }
        match select(Timer::after(duration), self.wake.wait()).await {
            Either::First(()) => self.is_requested(),
            Either::Second(()) => true,
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// A live update went out
    pub emitted: bool,
    /// A sample was appended to the store (and rollups were broadcast)
    pub persisted: bool,
    /// The sensor read failed
    pub sensor_failed: bool,
    /// How long to wait before the next tick
    pub next_delay: Duration,
}

/// True if `interval` has passed since `last`, or nothing happened yet.
fn is_due(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    match last {
        None => true,
        Some(last) => (now - last).num_milliseconds() >= interval.as_millis() as i64,
    }
}

pub struct AcquisitionLoop<S, T> {
    sensor: S,
    store: Arc<T>,
    aggregation: AggregationEngine<T>,
    fanout: Arc<Fanout>,
    config: LoopConfig,
    state: Arc<LoopStateCell>,
}

impl<S, T> AcquisitionLoop<S, T>
where
    S: SensorSource,
    T: TimeSeriesStore,
{
    pub fn new(
        sensor: S,
        store: Arc<T>,
        fanout: Arc<Fanout>,
        config: LoopConfig,
        state: Arc<LoopStateCell>,
    ) -> Self {
        Self {
            sensor,
            aggregation: AggregationEngine::new(Arc::clone(&store)),
            store,
            fanout,
            config,
            state,
        }
    }

    /// Give the sensor back once the loop is done with it.
    pub fn into_sensor(self) -> S {
        self.sensor
    }

    pub fn state(&self) -> LoopState {
        self.state.snapshot()
    }

    /// Read the sensor once and apply both cadences as of `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let mut state = self.state.snapshot();

        let reading = match self.sensor.sample().await {
            Ok(reading) => reading,
            Err(e) => {
                state.consecutive_errors = state.consecutive_errors.saturating_add(1);
                let next_delay = if state.consecutive_errors > self.config.long_backoff_after {
                    self.config.long_backoff
                } else {
                    self.config.short_backoff
                };

                if state.consecutive_errors == self.config.long_backoff_after + 1 {
                    warn!(
                        "{} consecutive sensor failures, backing off to {}ms: {}",
                        state.consecutive_errors,
                        next_delay.as_millis(),
                        e
                    );
                } else {
                    debug!("Sensor read failed ({}): {}", state.consecutive_errors, e);
                }

                self.state.store(state);
                return TickOutcome {
                    emitted: false,
                    persisted: false,
                    sensor_failed: true,
                    next_delay,
                };
            }
        };

        state.consecutive_errors = 0;
        let sample = Sample::new(reading.temperature, reading.humidity, now);

        let emitted = is_due(state.last_emit_at, now, self.config.emit_interval);
        if emitted {
            self.fanout.publish_live(LiveUpdate::from_sample(&sample));
            state.last_emit_at = Some(now);
        }

        let mut persisted = false;
        if is_due(state.last_persist_at, now, self.config.persist_interval) {
            match self.store.append(&sample) {
                Ok(()) => {
                    debug!("Persisted {}", sample);
                    state.last_persist_at = Some(now);
                    persisted = true;

                    let snapshot = self.aggregation.compute_all(now);
                    self.fanout.publish_rollups(snapshot);
                }
                // The cadence is left untouched so the next good read retries.
                Err(e) => error!("Failed to persist sample: {}", e),
            }
        }

        self.state.store(state);
        TickOutcome {
            emitted,
            persisted,
            sensor_failed: false,
            next_delay: self.config.tick_interval,
        }
    }

    /// Tick until `stop` is requested.
    pub async fn run(&mut self, stop: &StopSignal) {
        info!(
            "Acquisition loop started (emit every {}ms, persist every {}s)",
            self.config.emit_interval.as_millis(),
            self.config.persist_interval.as_secs()
        );

        while !stop.is_requested() {
            let outcome = self.tick(Utc::now()).await;
            if stop.sleep(outcome.next_delay).await {
                break;
            }
        }

        info!("Acquisition loop stopped");
    }
}
