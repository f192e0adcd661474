mod simulated;

use core::future::Future;

use thiserror::Error;

pub use simulated::SimulatedSensor;

/// Failure reported by a sensor read.
///
/// Every variant is transient as far as the acquisition loop is concerned:
/// it backs off and retries, nothing is surfaced to observers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("{sensor}: read failed ({details})")]
    ReadFailed {
        sensor: &'static str,
        details: &'static str,
    },
    #[error("{sensor}: timed out waiting for measurement")]
    Timeout { sensor: &'static str },
    #[error("{sensor}: invalid reading ({details})")]
    InvalidReading {
        sensor: &'static str,
        details: &'static str,
    },
}

/// Typed readings from a temperature/humidity sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
}

impl Reading {
    pub const fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature,
            humidity,
        }
    }
}

/// Trait for the hardware capability that yields one reading per call.
///
/// Implementations must tolerate being called repeatedly at sub-second
/// cadence. A DHT-class part fails intermittently; report that as a
/// [`SensorError`] rather than blocking until a good read arrives.
pub trait SensorSource {
    /// Read the sensor once.
    fn sample(&mut self) -> impl Future<Output = Result<Reading, SensorError>>;
}

impl<S: SensorSource + ?Sized> SensorSource for &mut S {
    fn sample(&mut self) -> impl Future<Output = Result<Reading, SensorError>> {
        (**self).sample()
    }
}
