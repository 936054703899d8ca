//! Configuration loading and validation using Figment.
//!
//! Settings are merged from two sources:
//! 1. a TOML file (`thermolog.toml` by default)
//! 2. environment variables prefixed with `THERMOLOG_`, with `__` as the
//!    section separator (e.g. `THERMOLOG_LOG__SAMPLE_PERIOD_S=0.25`)
//!
//! # Example
//! ```toml
//! [log]
//! directory = "logs"
//! file_prefix = "cryostat"
//! sample_period_s = 2.0
//!
//! [display]
//! unit = "kelvin"
//! history_capacity = 1024
//!
//! [[sensor]]
//! channel = 0
//! mode = 3
//!
//! [[sensor]]
//! channel = 3
//! mode = 0
//! slope = 0.0629
//! intercept = 70.7
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sensor::{ConversionMode, Unit, BASE_ADDRESS, CHANNEL_COUNT, MODES};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "thermolog.toml";

/// Fastest supported sampling period: one conversion at the 240 Hz rate.
pub const MIN_SAMPLE_PERIOD_S: f64 = 1.0 / 240.0;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log file settings
    #[serde(default)]
    pub log: LogConfig,
    /// Live display settings
    #[serde(default)]
    pub display: DisplayConfig,
    /// Sensor definitions, one `[[sensor]]` table per channel
    #[serde(default, rename = "sensor")]
    pub sensors: Vec<SensorConfig>,
}

/// Log file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory the timestamped log file is created in
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Log file name prefix; the start timestamp is appended
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    /// Seconds between sampling ticks
    #[serde(default = "default_sample_period")]
    pub sample_period_s: f64,
}

/// Live display configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Unit cooked values are converted to for display (celsius, kelvin,
    /// fahrenheit); the log file always keeps the sensor-native unit
    #[serde(default = "default_unit")]
    pub unit: Unit,
    /// Readings retained per sensor for the display history
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

/// One sensor definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Bus channel 0-7, mapping to device address 0x68 + channel
    pub channel: u8,
    /// Conversion mode index 0-3 (12, 14, 16 or 18 bits)
    pub mode: u8,
    /// Calibration slope override; the mode's factory value when absent
    #[serde(default)]
    pub slope: Option<f64>,
    /// Calibration intercept override; the mode's factory value when absent
    #[serde(default)]
    pub intercept: Option<f64>,
    /// Whether this sensor participates in acquisition
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_file_prefix() -> String {
    "thermolog".to_string()
}

fn default_sample_period() -> f64 {
    1.0
}

fn default_unit() -> Unit {
    Unit::Celsius
}

fn default_history_capacity() -> usize {
    512
}

fn default_enabled() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            file_prefix: default_file_prefix(),
            sample_period_s: default_sample_period(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            unit: default_unit(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl Settings {
    /// Load configuration from `thermolog.toml` and environment variables
    ///
    /// Environment variables can override configuration with prefix THERMOLOG_
    /// Example: THERMOLOG_LOG__SAMPLE_PERIOD_S=0.25
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("THERMOLOG_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if !self.log.sample_period_s.is_finite() || self.log.sample_period_s < MIN_SAMPLE_PERIOD_S {
            return Err(format!(
                "Invalid sample_period_s {}. Must be at least 1/240 s ({:.6})",
                self.log.sample_period_s, MIN_SAMPLE_PERIOD_S
            ));
        }

        if self.log.file_prefix.is_empty() {
            return Err("Log file_prefix must not be empty".to_string());
        }

        if self.display.history_capacity == 0 {
            return Err("Display history_capacity must be at least 1".to_string());
        }

        if self.enabled_sensors().is_empty() {
            return Err("No enabled sensors configured".to_string());
        }

        let mut channels = HashSet::new();
        for sensor in &self.sensors {
            if sensor.channel >= CHANNEL_COUNT {
                return Err(format!(
                    "Invalid channel {}. Must be 0-{}",
                    sensor.channel,
                    CHANNEL_COUNT - 1
                ));
            }
            if usize::from(sensor.mode) >= MODES.len() {
                return Err(format!(
                    "Invalid mode {}. Must be 0-{}",
                    sensor.mode,
                    MODES.len() - 1
                ));
            }
            for (name, value) in [("slope", sensor.slope), ("intercept", sensor.intercept)] {
                if let Some(value) = value {
                    if !value.is_finite() {
                        return Err(format!(
                            "Invalid {} {} for channel {}. Must be finite",
                            name, value, sensor.channel
                        ));
                    }
                }
            }
            if !channels.insert(sensor.channel) {
                return Err(format!("Duplicate sensor channel: {}", sensor.channel));
            }
        }

        Ok(())
    }

    /// Sampling period as a [`Duration`]
    pub fn sample_period(&self) -> Duration {
        Duration::from_secs_f64(self.log.sample_period_s)
    }

    /// Get all enabled sensors
    pub fn enabled_sensors(&self) -> Vec<&SensorConfig> {
        self.sensors.iter().filter(|sensor| sensor.enabled).collect()
    }
}

impl SensorConfig {
    /// Device address on the bus: 0x68 + channel.
    pub fn address(&self) -> u8 {
        BASE_ADDRESS + self.channel
    }

    /// Conversion mode for this sensor; `None` for an out-of-range index.
    pub fn conversion_mode(&self) -> Option<&'static ConversionMode> {
        ConversionMode::from_index(usize::from(self.mode))
    }

    /// Calibration pair with overrides applied over the mode's factory values.
    pub fn calibration(&self, mode: &ConversionMode) -> (f64, f64) {
        (
            self.slope.unwrap_or(mode.default_slope),
            self.intercept.unwrap_or(mode.default_intercept),
        )
    }
}
