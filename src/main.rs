//! CLI entry point for daq-pubsub
//!
//! Provides a command-line interface for:
//! - Running a simulated acquisition: device threads publish through the
//!   relay while the dispatch loop drains it
//! - Printing the topic tree of a freshly configured bus
//!
//! # Usage
//!
//! ```bash
//! daq-pubsub simulate --devices 3 --samples 100
//! daq-pubsub tree --config config/daq_pubsub.toml
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use daq_pubsub::prelude::*;
use daq_pubsub::{capabilities, logging};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::info;

const ANY_OPEN_TOPIC: &str = "app/any_device_open";

#[derive(Parser)]
#[command(name = "daq-pubsub")]
#[command(about = "Hierarchical pub/sub registry for DAQ applications", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run simulated devices against the bus
    Simulate {
        /// Number of simulated devices
        #[arg(long, default_value = "2")]
        devices: usize,

        /// Samples posted by each device
        #[arg(long, default_value = "10")]
        samples: usize,

        /// Delay between samples in milliseconds
        #[arg(long, default_value = "1")]
        interval_ms: u64,
    },

    /// Print the topic tree as JSON
    Tree,
}

/// A device whose state and samples arrive from its own I/O thread.
struct SimDevice;

impl SettingAccessor for SimDevice {}

impl Registrant for SimDevice {
    fn declaration(&self) -> Declaration {
        Declaration::instance("SimDevice")
            .capability("device@")
            .capability(capabilities::SIGNAL_SOURCE)
            .setting(
                "state",
                Metadata::new(Dtype::U8)
                    .with_brief("Device state")
                    .with_options(vec![
                        vec![json!(0), json!("closed")],
                        vec![json!(1), json!("opening")],
                        vec![json!(2), json!("open")],
                        vec![json!(3), json!("closing")],
                    ])
                    .with_default(0)
                    .with_flags(&[Flag::SkipUndo]),
            )
            .setting(
                "sample",
                Metadata::new(Dtype::Float)
                    .with_brief("Most recent sample")
                    .with_default(0.0)
                    .with_flags(&[Flag::SkipUndo]),
            )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => BusConfig::load_from(path)?,
        None => BusConfig::load()?,
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Simulate {
            devices,
            samples,
            interval_ms,
        } => simulate(config, devices, samples, Duration::from_millis(interval_ms)).await,
        Commands::Tree => {
            let bus = PubSub::with_config(config)?;
            println!("{}", serde_json::to_string_pretty(&bus.snapshot())?);
            Ok(())
        }
    }
}

async fn simulate(config: BusConfig, devices: usize, samples: usize, interval: Duration) -> Result<()> {
    let mut bus = PubSub::with_config(config)?;
    bus.topic_add(
        ANY_OPEN_TOPIC,
        Metadata::new(Dtype::Bool)
            .with_brief("Any device open")
            .with_flags(&[Flag::SkipUndo]),
        false,
    )?;
    let any_open = Aggregator::new(
        &mut bus,
        capabilities::DEVICE_OBJECT,
        "settings/state",
        reduce::any,
        ANY_OPEN_TOPIC,
    )?;

    let mut ids = Vec::with_capacity(devices);
    for _ in 0..devices {
        ids.push(bus.register(Arc::new(SimDevice), None)?);
    }
    info!(devices = ids.len(), "Simulated devices registered");

    let mut workers = Vec::with_capacity(ids.len());
    for (index, id) in ids.iter().enumerate() {
        let relay = bus.relay();
        let state = setting_topic(id, "state");
        let sample = setting_topic(id, "sample");
        workers.push(std::thread::spawn(move || -> BusResult<()> {
            relay.post(&state, 1)?;
            relay.post(&state, 2)?;
            for n in 0..samples {
                let value = (index as f64) + (n as f64 * 0.1).sin();
                relay.post(&sample, value)?;
                std::thread::sleep(interval);
            }
            relay.post(&state, 3)?;
            relay.post(&state, 0)
        }));
    }

    let (done_tx, mut done_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let results: Vec<_> = workers.into_iter().map(|w| w.join()).collect();
        let _ = done_tx.send(results);
    });

    let results = loop {
        tokio::select! {
            () = bus.process_next() => {}
            results = &mut done_rx => break results?,
        }
    };
    let drained = bus.process();
    info!(drained, "Relay drained after workers finished");

    for result in results {
        match result {
            Ok(outcome) => outcome?,
            Err(_) => anyhow::bail!("device thread panicked"),
        }
    }

    let summary: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({
                "device": id,
                "state": bus.query_or(&setting_topic(id, "state"), Value::Null),
                "sample": bus.query_or(&setting_topic(id, "sample"), Value::Null),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!(
        "{} = {}",
        ANY_OPEN_TOPIC,
        bus.query_or(ANY_OPEN_TOPIC, Value::Null)
    );

    any_open.close(&mut bus);
    for id in &ids {
        bus.unregister(id, true)?;
    }
    Ok(())
}
