//! Synthetic DHT-style sensor for running the station without hardware.

use embassy_time::Instant;

use super::{Reading, SensorError, SensorSource};

/// Generates readings that drift sinusoidally over time.
///
/// `fail_rate` (0.0..=1.0) injects [`SensorError::ReadFailed`] at an evenly
/// spread fraction of reads, which is how a real DHT22 behaves on a busy bus.
pub struct SimulatedSensor {
    started: Instant,
    fail_rate: f64,
    fail_budget: f64,
}

impl SimulatedSensor {
    pub fn new(fail_rate: f64) -> Self {
        Self {
            started: Instant::now(),
            fail_rate: fail_rate.clamp(0.0, 1.0),
            fail_budget: 0.0,
        }
    }

    /// Deterministic reading for `t` seconds since start.
    pub fn reading_at(t: f64) -> Reading {
        // Temperature: 20–26 °C with a slow drift
        let temperature = 23.0 + 3.0 * (t / 120.0).sin() + 0.5 * (t / 37.0).cos();
        // Humidity: 40–60 % on a different period
        let humidity = 50.0 + 10.0 * (t / 180.0).sin() + 2.0 * (t / 23.0).cos();

        Reading::new(temperature, humidity)
    }

    fn should_fail(&mut self) -> bool {
        self.fail_budget += self.fail_rate;
        if self.fail_budget >= 1.0 {
            self.fail_budget -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl SensorSource for SimulatedSensor {
    async fn sample(&mut self) -> Result<Reading, SensorError> {
        if self.should_fail() {
            return Err(SensorError::ReadFailed {
                sensor: "simulated",
                details: "checksum mismatch",
            });
        }

        let t = self.started.elapsed().as_micros() as f64 / 1_000_000.0;
        Ok(Self::reading_at(t))
    }
}
