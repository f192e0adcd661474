//! Owner of the acquisition worker and everything it shares with request
//! handlers.
//!
//! The transport layer holds one `EngineHandle` (usually in an `Arc`) and
//! calls into it from any number of threads:
//!
//! - [`EngineHandle::connect`] on every new observer, which also starts the
//!   worker the first time;
//! - [`EngineHandle::stats`] / [`EngineHandle::stats_json`] for on-demand
//!   rollup queries;
//! - [`EngineHandle::stop`] during teardown, before the sensor and store are
//!   released.

use core::sync::atomic::{AtomicBool, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use chrono::Utc;
use futures::executor::block_on;
use log::{error, info, warn};
use thiserror::Error;

use crate::config::ConfigError;
use crate::fanout::{Fanout, Observer};
use crate::rollup::{AggregationEngine, Bucket, RollupSnapshot};
use crate::sampling::{AcquisitionLoop, LoopConfig, LoopState, LoopStateCell, StopSignal};
use crate::sensors::SensorSource;
use crate::storage::{StoreError, TimeSeriesStore};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("sample store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to spawn acquisition worker: {0}")]
    Spawn(std::io::Error),
    #[error("acquisition worker panicked")]
    WorkerPanicked,
    #[error("sensor was lost by a failed worker")]
    SensorUnavailable,
}

/// Where the sensor currently lives.
enum Worker<S> {
    /// Parked in the handle, ready for the next start
    Idle(S),
    /// Owned by the worker thread, handed back when it is joined
    Running(JoinHandle<S>),
    /// A worker died with it
    Lost,
}

pub struct EngineHandle<S, T>
where
    S: SensorSource + Send + 'static,
    T: TimeSeriesStore + 'static,
{
    store: Arc<T>,
    fanout: Arc<Fanout>,
    aggregation: AggregationEngine<T>,
    loop_config: LoopConfig,
    loop_state: Arc<LoopStateCell>,
    stop: Arc<StopSignal>,
    /// Cleared by the worker itself when it exits.
    running: Arc<AtomicBool>,
    /// Serializes start and stop; held across the join.
    worker: Mutex<Worker<S>>,
}

impl<S, T> EngineHandle<S, T>
where
    S: SensorSource + Send + 'static,
    T: TimeSeriesStore + 'static,
{
    pub fn new(sensor: S, store: Arc<T>, loop_config: LoopConfig) -> Self {
        Self {
            aggregation: AggregationEngine::new(Arc::clone(&store)),
            store,
            fanout: Arc::new(Fanout::new()),
            loop_config,
            loop_state: Arc::new(LoopStateCell::new()),
            stop: Arc::new(StopSignal::new()),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(Worker::Idle(sensor)),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Worker<S>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the acquisition worker unless it is already running.
    ///
    /// Returns `Ok(true)` if this call started it.
    pub fn ensure_started(&self) -> Result<bool, EngineError> {
        if self.running.load(Ordering::Acquire) {
            return Ok(false);
        }

        let mut worker = self.worker();
        let sensor = match core::mem::replace(&mut *worker, Worker::Lost) {
            Worker::Idle(sensor) => sensor,
            Worker::Running(handle) if self.running.load(Ordering::Acquire) => {
                // Started by a concurrent caller.
                *worker = Worker::Running(handle);
                return Ok(false);
            }
            // The worker cleared `running` on its way out without being
            // asked to stop.
            Worker::Running(handle) => match handle.join() {
                Ok(sensor) => {
                    warn!("Restarting acquisition worker that exited on its own");
                    sensor
                }
                Err(_) => return Err(EngineError::WorkerPanicked),
            },
            Worker::Lost => return Err(EngineError::SensorUnavailable),
        };

        self.running.store(true, Ordering::Release);
        self.stop.reset();
        let mut acquisition = AcquisitionLoop::new(
            sensor,
            Arc::clone(&self.store),
            Arc::clone(&self.fanout),
            self.loop_config,
            Arc::clone(&self.loop_state),
        );
        let stop = Arc::clone(&self.stop);
        let running = Arc::clone(&self.running);

        let spawned = std::thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || {
                let ran = panic::catch_unwind(AssertUnwindSafe(|| block_on(acquisition.run(&stop))));
                if ran.is_err() {
                    error!("Acquisition worker panicked; it restarts on the next connect");
                }
                running.store(false, Ordering::Release);
                acquisition.into_sensor()
            });

        match spawned {
            Ok(handle) => {
                *worker = Worker::Running(handle);
                Ok(true)
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(EngineError::Spawn(e))
            }
        }
    }

    /// Signal the worker to stop and wait for it to exit.
    ///
    /// Returns once the worker has been joined, so the sensor and store are
    /// no longer in use. Stopping an idle engine does nothing.
    pub fn stop(&self) -> Result<(), EngineError> {
        let mut worker = self.worker();
        let handle = match core::mem::replace(&mut *worker, Worker::Lost) {
            Worker::Running(handle) => handle,
            other => {
                *worker = other;
                return Ok(());
            }
        };

        self.stop.request();
        let joined = handle.join();
        self.running.store(false, Ordering::Release);

        match joined {
            Ok(sensor) => {
                *worker = Worker::Idle(sensor);
                Ok(())
            }
            Err(_) => {
                error!("Acquisition worker panicked");
                Err(EngineError::WorkerPanicked)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register a new observer and make sure the worker is running.
    ///
    /// The observer immediately holds the last live update, if any. A start
    /// failure is logged; the observer still gets rollups on demand.
    pub fn connect(&self) -> Observer {
        let observer = self.fanout.connect();
        match self.ensure_started() {
            Ok(true) => info!("Acquisition started by observer {}", observer.id()),
            Ok(false) => {}
            Err(e) => error!("Could not start acquisition: {}", e),
        }
        observer
    }

    /// Rollup buckets for a timeframe token; empty for unknown tokens or a
    /// failed query.
    pub fn stats(&self, timeframe: &str) -> Vec<Bucket> {
        self.aggregation.query_token(timeframe, Utc::now())
    }

    /// [`EngineHandle::stats`] rendered as a JSON array.
    pub fn stats_json(&self, timeframe: &str) -> String {
        serde_json::to_string(&self.stats(timeframe)).unwrap_or_else(|e| {
            error!("Failed to render stats: {}", e);
            "[]".to_string()
        })
    }

    /// All four rollups as of now.
    pub fn rollups(&self) -> RollupSnapshot {
        self.aggregation.compute_all(Utc::now())
    }

    /// Consistent snapshot of the worker's cadence bookkeeping.
    pub fn loop_state(&self) -> LoopState {
        self.loop_state.snapshot()
    }

    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    pub fn store(&self) -> &Arc<T> {
        &self.store
    }
}

impl<S, T> Drop for EngineHandle<S, T>
where
    S: SensorSource + Send + 'static,
    T: TimeSeriesStore + 'static,
{
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Acquisition worker did not shut down cleanly: {}", e);
        }
    }
}
