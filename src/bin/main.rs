//! Station runner.
//!
//! Wires the simulated sensor to the on-disk sample log, attaches a console
//! observer that logs every fanout message, and answers rollup queries typed
//! on stdin.
//!
//! # Commands
//!
//! | Input              | Action                          |
//! |--------------------|---------------------------------|
//! | `1h` `24h` `7d` `30d` | Print that rollup as JSON    |
//! | `state`            | Print the acquisition loop state |
//! | `q` / EOF          | Stop and exit                    |

use std::io::BufRead;
use std::process::ExitCode;
use std::sync::Arc;

use futures::executor::block_on;
use log::{error, info};

use hygro::config::Config;
use hygro::sensors::SimulatedSensor;
use hygro::storage::FileStore;
use hygro::{EngineError, EngineHandle};

fn run() -> Result<(), EngineError> {
    let config = Config::from_env()?;
    info!("Configuration: {:?}", config);

    // Fatal before anything starts sampling.
    let store = Arc::new(FileStore::open(&config.store_path)?);
    info!("Sample log: {}", store.path().display());

    let sensor = SimulatedSensor::new(config.sensor_fail_rate);
    let engine = EngineHandle::new(sensor, store, config.loop_config());

    let console = engine.connect();
    std::thread::Builder::new()
        .name("console-observer".into())
        .spawn(move || {
            loop {
                let message = block_on(console.recv());
                match message.to_json() {
                    Ok(json) => info!("[{}] {}", message.event_name(), json),
                    Err(e) => error!("Failed to render {}: {}", message.event_name(), e),
                }
            }
        })
        .map_err(EngineError::Spawn)?;

    info!("Type 1h/24h/7d/30d for rollups, state for loop state, q to quit");

    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        match line.trim() {
            "q" | "quit" => break,
            "" => {}
            "state" => info!("{:?} running={}", engine.loop_state(), engine.is_running()),
            token => info!("[stats {}] {}", token, engine.stats_json(token)),
        }
    }

    info!("Shutting down...");
    engine.stop()
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Starting hygro-rs");

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
