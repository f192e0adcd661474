//! Station configuration, read from the process environment after an
//! optional `.env` file.
//!
//! | Variable                     | Default               |
//! |------------------------------|-----------------------|
//! | `DATA_COLLECTION_INTERVAL`   | `60` (seconds)        |
//! | `EMIT_INTERVAL`              | `2` (seconds)         |
//! | `TICK_INTERVAL_MS`           | `500`                 |
//! | `STORE_PATH`                 | `sensor_readings.bin` |
//! | `SIMULATED_SENSOR_FAIL_RATE` | `0.0`                 |

use core::str::FromStr;
use std::path::PathBuf;

use embassy_time::Duration;
use thiserror::Error;

use crate::sampling::LoopConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub persist_interval_secs: u64,
    pub emit_interval_secs: u64,
    pub tick_interval_ms: u64,
    pub store_path: PathBuf,
    pub sensor_fail_rate: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            persist_interval_secs: 60,
            emit_interval_secs: 2,
            tick_interval_ms: 500,
            store_path: PathBuf::from("sensor_readings.bin"),
            sensor_fail_rate: 0.0,
        }
    }
}

fn parse<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

fn nonzero(key: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        })
    } else {
        Ok(value)
    }
}

impl Config {
    /// Load `.env` (if present) and read the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key/value source; unset keys keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("DATA_COLLECTION_INTERVAL") {
            config.persist_interval_secs = parse("DATA_COLLECTION_INTERVAL", v)?;
        }
        if let Some(v) = lookup("EMIT_INTERVAL") {
            config.emit_interval_secs = parse("EMIT_INTERVAL", v)?;
        }
        if let Some(v) = lookup("TICK_INTERVAL_MS") {
            config.tick_interval_ms = parse("TICK_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("STORE_PATH") {
            config.store_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SIMULATED_SENSOR_FAIL_RATE") {
            config.sensor_fail_rate = parse("SIMULATED_SENSOR_FAIL_RATE", v)?;
        }

        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        nonzero("DATA_COLLECTION_INTERVAL", self.persist_interval_secs)?;
        nonzero("EMIT_INTERVAL", self.emit_interval_secs)?;
        nonzero("TICK_INTERVAL_MS", self.tick_interval_ms)?;
        if !(0.0..=1.0).contains(&self.sensor_fail_rate) {
            return Err(ConfigError::InvalidValue {
                key: "SIMULATED_SENSOR_FAIL_RATE",
                value: self.sensor_fail_rate.to_string(),
            });
        }
        Ok(self)
    }

    /// Pacing for the acquisition loop. Backoff delays are fixed.
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            emit_interval: Duration::from_secs(self.emit_interval_secs),
            persist_interval: Duration::from_secs(self.persist_interval_secs),
            ..LoopConfig::default()
        }
    }
}
