//! Bus configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. built-in defaults ([`BusConfig::default`])
//! 2. a TOML file (`config/daq_pubsub.toml` unless another path is given)
//! 3. environment variables prefixed with `DAQ_PUBSUB_`, nested keys split
//!    on `__` (e.g. `DAQ_PUBSUB_UNDO__MAX_ENTRIES=500`)
//!
//! # Example
//! ```no_run
//! use daq_pubsub::config::BusConfig;
//!
//! let config = BusConfig::load()?;
//! println!("Undo history: {}", config.undo.max_entries);
//! # Ok::<(), daq_pubsub::error::BusError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::capabilities;
use crate::error::{BusError, BusResult};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_pubsub.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_PUBSUB_";

/// Top-level bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Undo engine settings
    #[serde(default)]
    pub undo: UndoConfig,
    /// Cross-thread relay settings
    #[serde(default)]
    pub relay: RelayConfig,
    /// Capability tags whose list topics exist from construction
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_format")]
    pub format: String,
}

/// Undo engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoConfig {
    /// Start with recording suppressed
    #[serde(default)]
    pub skip_core_undo: bool,
    /// Maximum undo entries kept, trimmed by whole groups
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Deadline for [`Relay::request`](crate::relay::Relay::request) in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "pretty".to_string()
}

fn default_max_entries() -> usize {
    1000
}

fn default_request_timeout() -> u64 {
    1000
}

fn default_capabilities() -> Vec<String> {
    capabilities::WELL_KNOWN
        .iter()
        .map(|tag| tag.to_string())
        .collect()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            skip_core_undo: false,
            max_entries: default_max_entries(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            undo: UndoConfig::default(),
            relay: RelayConfig::default(),
            capabilities: default_capabilities(),
        }
    }
}

impl BusConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// A missing file is not an error; the defaults apply.
    pub fn load() -> BusResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific TOML file and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> BusResult<Self> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered provider stack, before extraction.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> BusResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(BusError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(BusError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        if self.undo.max_entries == 0 {
            return Err(BusError::Configuration(
                "undo.max_entries must be at least 1".to_string(),
            ));
        }

        for tag in &self.capabilities {
            if tag.is_empty() || tag.contains('/') {
                return Err(BusError::Configuration(format!(
                    "Invalid capability tag '{}'",
                    tag
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = BusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.undo.max_entries, 1000);
        assert!(config.capabilities.iter().any(|t| t == "device.object"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BusConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.relay.request_timeout_ms, 1000);
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
capabilities = ["device.object", "pump.object"]

[logging]
level = "debug"
format = "json"

[undo]
skip_core_undo = true
max_entries = 25
"#,
        );
        let config = BusConfig::load_from(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert!(config.undo.skip_core_undo);
        assert_eq!(config.undo.max_entries, 25);
        assert_eq!(config.relay.request_timeout_ms, 1000);
        assert_eq!(config.capabilities, vec!["device.object", "pump.object"]);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = BusConfig::default();
        config.logging.level = "loud".to_string();
        assert!(matches!(config.validate(), Err(BusError::Configuration(_))));
    }

    #[test]
    fn test_invalid_format() {
        let mut config = BusConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_history_rejected() {
        let file = write_config("[undo]\nmax_entries = 0\n");
        assert!(matches!(
            BusConfig::load_from(file.path()),
            Err(BusError::Configuration(_))
        ));
    }

    #[test]
    fn test_bad_capability_tag() {
        let mut config = BusConfig::default();
        config.capabilities.push("a/b".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file() {
        let file = write_config("[undo\nmax_entries = ");
        assert!(matches!(BusConfig::load_from(file.path()), Err(BusError::Config(_))));
    }
}
