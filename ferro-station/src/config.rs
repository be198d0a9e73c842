//! Bootstrap configuration
//!
//! Static TOML settings read once at startup: device node, database path,
//! pipeline tuning, logging, and optional channel-label overrides. Session
//! parameters (operator, thresholds) come from the command line, not from
//! here — they change per run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use ferro_common::error::{Error, Result};
use ferro_common::types::Channel;

use crate::parser::ChannelLabels;
use crate::pipeline::PipelineOptions;

/// Bootstrap configuration loaded from a TOML file
#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    /// Device node carrying the measurement stream
    #[serde(default = "default_device_path")]
    pub device_path: PathBuf,

    /// Path to the SQLite station database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Bounded frame queue depth between reader and consumer
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Bound on a single persistence call, in milliseconds
    #[serde(default = "default_gateway_timeout_ms")]
    pub gateway_timeout_ms: u64,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Channel-label overrides, e.g. `"Meter 1" = "headshot"`.
    /// When absent the fixture's stock meter names apply.
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_device_path() -> PathBuf {
    PathBuf::from("/dev/ttyUSB0")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("ferro-station.db")
}

fn default_queue_depth() -> usize {
    64
}

fn default_gateway_timeout_ms() -> u64 {
    250
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            device_path: default_device_path(),
            database_path: default_database_path(),
            queue_depth: default_queue_depth(),
            gateway_timeout_ms: default_gateway_timeout_ms(),
            logging: LoggingConfig::default(),
            labels: None,
        }
    }
}

impl StationConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Build the channel-label table, validating any overrides
    pub fn channel_labels(&self) -> Result<ChannelLabels> {
        let Some(overrides) = &self.labels else {
            return Ok(ChannelLabels::default());
        };

        let mut table = ChannelLabels::empty();
        for (label, channel) in overrides {
            let channel = match channel.to_lowercase().as_str() {
                "headshot" => Channel::Headshot,
                "coilshot" => Channel::Coilshot,
                other => {
                    return Err(Error::Config(format!(
                        "label {label:?} maps to unknown channel {other:?}"
                    )))
                }
            };
            table.insert(label, channel);
        }
        if table.is_empty() {
            return Err(Error::Config("label table is empty".into()));
        }
        Ok(table)
    }

    pub fn pipeline_options(&self) -> Result<PipelineOptions> {
        Ok(PipelineOptions {
            queue_depth: self.queue_depth,
            gateway_timeout: Duration::from_millis(self.gateway_timeout_ms),
            labels: self.channel_labels()?,
        })
    }
}
