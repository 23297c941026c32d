//! Tracing setup
//!
//! Installs a `tracing-subscriber` fmt layer for the bus and its host
//! application. `RUST_LOG` overrides the configured level. Relay traffic
//! arrives from producer threads, so thread names are included by default.
//!
//! # Example
//! ```no_run
//! use daq_pubsub::{config::BusConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BusConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("bus starting");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use crate::config::BusConfig;
use crate::error::{BusError, BusResult};

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored.
    Pretty,
    /// Single line, no colors.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level for every target.
    pub level: Level,
    /// Separate level for the bus's own dispatch logging.
    pub bus_level: Option<Level>,
    /// Output format
    pub format: OutputFormat,
    /// Include the name of the emitting thread.
    pub with_thread_names: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            bus_level: None,
            format: OutputFormat::Pretty,
            with_thread_names: true,
        }
    }
}

impl TracingConfig {
    /// Map the `[logging]` section of a [`BusConfig`].
    pub fn from_bus_config(config: &BusConfig) -> BusResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.logging.level)?,
            format: parse_format(&config.logging.format)?,
            ..Default::default()
        })
    }

    /// Options with the given default level.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log `daq_pubsub` targets at `level`, independently of the default.
    pub fn with_bus_level(mut self, level: Level) -> Self {
        self.bus_level = Some(level);
        self
    }

    fn filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.level).into())
            .from_env_lossy();
        if let Some(level) = self.bus_level {
            if let Ok(directive) = format!("daq_pubsub={}", level).parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

/// Initialize tracing from a loaded [`BusConfig`].
pub fn init_from_config(config: &BusConfig) -> BusResult<()> {
    init(TracingConfig::from_bus_config(config)?)
}

/// Install the global subscriber.
///
/// Does nothing when one is already installed, so tests and embedding
/// applications may call it freely.
pub fn init(config: TracingConfig) -> BusResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let filter = config.filter();
    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_names(config.with_thread_names)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_thread_names(config.with_thread_names)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_thread_names(config.with_thread_names)
            .boxed(),
    };
    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .or_else(|e| {
            // Lost a race with another initializer.
            if tracing::dispatcher::has_been_set() {
                Ok(())
            } else {
                Err(BusError::Configuration(format!("Failed to initialize tracing: {}", e)))
            }
        })
}

fn parse_log_level(level: &str) -> BusResult<Level> {
    level.parse::<Level>().map_err(|_| {
        BusError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))
    })
}

fn parse_format(format: &str) -> BusResult<OutputFormat> {
    match format.to_lowercase().as_str() {
        "pretty" => Ok(OutputFormat::Pretty),
        "compact" => Ok(OutputFormat::Compact),
        "json" => Ok(OutputFormat::Json),
        _ => Err(BusError::Configuration(format!(
            "Invalid log format '{}'. Must be one of: pretty, compact, json",
            format
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);
        assert!(matches!(parse_log_level("loud"), Err(BusError::Configuration(_))));
    }

    #[test]
    fn test_tracing_config_from_bus_config() {
        let mut bus_config = BusConfig::default();
        bus_config.logging.level = "debug".to_string();
        bus_config.logging.format = "json".to_string();

        let tracing_config = TracingConfig::from_bus_config(&bus_config).unwrap();
        assert_eq!(tracing_config.level, Level::DEBUG);
        assert_eq!(tracing_config.format, OutputFormat::Json);
        assert!(tracing_config.bus_level.is_none());

        bus_config.logging.format = "xml".to_string();
        assert!(TracingConfig::from_bus_config(&bus_config).is_err());
    }

    #[test]
    fn test_bus_level_directive() {
        let config = TracingConfig::new(Level::WARN).with_bus_level(Level::TRACE);
        let rendered = config.filter().to_string();
        assert!(rendered.to_lowercase().contains("daq_pubsub=trace"), "{}", rendered);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = TracingConfig::new(Level::ERROR).with_format(OutputFormat::Compact);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
