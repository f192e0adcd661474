//! Sampling and rollup engine for a temperature/humidity station.
//!
//! A single acquisition worker polls a [`sensors::SensorSource`] on a short
//! tick, pushes rounded live readings to connected observers on one cadence
//! and persists full-precision samples on another. Every persist recomputes
//! the multi-resolution rollups in [`rollup`] and broadcasts them through
//! [`fanout`].
//!
//! [`engine::EngineHandle`] owns the whole thing: it lazily starts the
//! worker on the first observer connect and joins it on stop.

pub mod config;
pub mod engine;
pub mod fanout;
pub mod rollup;
pub mod sampling;
pub mod sensors;
pub mod storage;

pub use engine::{EngineError, EngineHandle};
