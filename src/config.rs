//! Configuration module for the press counter daemon.
//!
//! This module provides environment-based configuration for every stage of the
//! pipeline: the input line, the edge filter thresholds, the flush and upload
//! cycles, and the collector endpoint.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default collector endpoint
const DEFAULT_API_URL: &str = "http://localhost:8000/api/iot/events";

/// Default source identifier sent as `raspi_no`
const DEFAULT_SOURCE_ID: &str = "raspi_01";

/// Default SQLite database file
const DEFAULT_DB_PATH: &str = "press_events.db";

/// Default libgpiod chip and line (BCM 27 on a Raspberry Pi header)
const DEFAULT_GPIO_CHIP: &str = "gpiochip0";
const DEFAULT_GPIO_LINE: u32 = 27;

/// Default hardware glitch filter in microseconds
const DEFAULT_GLITCH_FILTER_US: u32 = 1_000;

/// Glitch filters longer than this would swallow real presses
const MAX_GLITCH_FILTER_US: u32 = 300_000;

const DEFAULT_MIN_PULSE_MS: u64 = 10;
const DEFAULT_MIN_INTERVAL_MS: u64 = 120;
const DEFAULT_STARTUP_QUIET_SECS: u64 = 5;

const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 3;
const DEFAULT_UPLOAD_TICK_SECS: u64 = 1;
const DEFAULT_MIN_SEND_INTERVAL_SECS: u64 = 20;

/// Default number of records per upload
const DEFAULT_MAX_BATCH: usize = 100;

/// The collector rejects batches larger than this
pub const COLLECTOR_MAX_BATCH: usize = 1_000;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Default staging buffer bound
const DEFAULT_BUFFER_CAPACITY: usize = 100_000;

/// Bounds shared by the two periodic cycles
const MIN_CYCLE_SECS: u64 = 1;
const MAX_CYCLE_SECS: u64 = 300;

/// Where raw edges come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// libgpiod `gpiomon` attached to a real input line
    Gpiomon,
    /// Synthetic operator, for bench runs without hardware
    Simulated,
}

impl FromStr for InputKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpiomon" => Ok(InputKind::Gpiomon),
            "simulated" => Ok(InputKind::Simulated),
            other => Err(format!("'{}' is not one of: gpiomon, simulated", other)),
        }
    }
}

/// Configuration for the press counter daemon.
///
/// All settings can be configured via `PRESS_COUNTER_*` environment variables;
/// see [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Full URL of the collector's batch endpoint
    pub api_url: String,

    /// Identifier of this device, sent as `raspi_no`
    pub source_id: String,

    /// SQLite database holding the durable event log
    pub db_path: PathBuf,

    /// Which edge source to attach
    pub input: InputKind,

    /// libgpiod chip name
    pub gpio_chip: String,

    /// Line offset on the chip
    pub gpio_line: u32,

    /// Whether a low level means "pressed" (switch to ground, pull-up bias)
    pub active_low: bool,

    /// Driver-side glitch filter, in microseconds
    pub glitch_filter_us: u32,

    /// Pulses shorter than this are contact bounce
    pub min_pulse: Duration,

    /// Releases closer than this to the previous accepted press are double-triggers
    pub min_interval: Duration,

    /// Edges are ignored for this long after startup
    pub startup_quiet: Duration,

    /// Period of the buffer → log flush cycle
    pub flush_interval: Duration,

    /// Period of the upload cycle
    pub upload_tick: Duration,

    /// Partial batches wait at least this long after the last successful send
    pub min_send_interval: Duration,

    /// Maximum records per upload request
    pub max_batch: usize,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Maximum number of timestamps held in the staging buffer
    pub buffer_capacity: usize,
}

/// Error type for configuration loading failures
#[derive(Debug, Error)]
#[error("Configuration error{}: {message}", var_suffix(.env_var))]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

fn var_suffix(env_var: &Option<String>) -> String {
    env_var
        .as_ref()
        .map(|var| format!(" for {}", var))
        .unwrap_or_default()
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but cannot be parsed, or if
    /// its value falls outside the accepted range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use press_counter::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Collector: {}", config.api_url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let api_url = vars
            .get("PRESS_COUNTER_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let source_id = vars
            .get("PRESS_COUNTER_SOURCE_ID")
            .unwrap_or_else(|| DEFAULT_SOURCE_ID.to_string());
        if source_id.trim().is_empty() {
            return Err(ConfigError::for_var(
                "PRESS_COUNTER_SOURCE_ID",
                "source id must not be empty",
            ));
        }

        let db_path = vars
            .get("PRESS_COUNTER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        let input = vars.parse("PRESS_COUNTER_INPUT", InputKind::Gpiomon)?;
        let gpio_chip = vars
            .get("PRESS_COUNTER_GPIO_CHIP")
            .unwrap_or_else(|| DEFAULT_GPIO_CHIP.to_string());
        let gpio_line = vars.parse("PRESS_COUNTER_GPIO_LINE", DEFAULT_GPIO_LINE)?;
        let active_low = vars.parse_bool("PRESS_COUNTER_ACTIVE_LOW", true)?;

        let glitch_filter_us =
            vars.parse("PRESS_COUNTER_GLITCH_FILTER_US", DEFAULT_GLITCH_FILTER_US)?;
        if glitch_filter_us > MAX_GLITCH_FILTER_US {
            return Err(ConfigError::for_var(
                "PRESS_COUNTER_GLITCH_FILTER_US",
                format!(
                    "glitch filter {}us exceeds maximum ({}us)",
                    glitch_filter_us, MAX_GLITCH_FILTER_US
                ),
            ));
        }

        let min_pulse = Duration::from_millis(
            vars.parse("PRESS_COUNTER_MIN_PULSE_MS", DEFAULT_MIN_PULSE_MS)?,
        );
        let min_interval = Duration::from_millis(
            vars.parse("PRESS_COUNTER_MIN_INTERVAL_MS", DEFAULT_MIN_INTERVAL_MS)?,
        );
        let startup_quiet = Duration::from_secs(
            vars.parse("PRESS_COUNTER_STARTUP_QUIET_SECS", DEFAULT_STARTUP_QUIET_SECS)?,
        );

        let flush_interval =
            vars.cycle_secs("PRESS_COUNTER_FLUSH_INTERVAL_SECS", DEFAULT_FLUSH_INTERVAL_SECS)?;
        let upload_tick =
            vars.cycle_secs("PRESS_COUNTER_UPLOAD_TICK_SECS", DEFAULT_UPLOAD_TICK_SECS)?;
        let min_send_interval = Duration::from_secs(vars.parse(
            "PRESS_COUNTER_MIN_SEND_INTERVAL_SECS",
            DEFAULT_MIN_SEND_INTERVAL_SECS,
        )?);

        let max_batch = Self::parse_max_batch(&vars)?;

        let request_timeout_secs: u64 = vars.parse(
            "PRESS_COUNTER_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;
        if request_timeout_secs == 0 {
            return Err(ConfigError::for_var(
                "PRESS_COUNTER_REQUEST_TIMEOUT_SECS",
                "request timeout must be greater than 0",
            ));
        }

        let buffer_capacity: usize =
            vars.parse("PRESS_COUNTER_BUFFER_CAPACITY", DEFAULT_BUFFER_CAPACITY)?;
        if buffer_capacity == 0 {
            return Err(ConfigError::for_var(
                "PRESS_COUNTER_BUFFER_CAPACITY",
                "buffer capacity must be greater than 0",
            ));
        }

        Ok(Self {
            api_url,
            source_id,
            db_path,
            input,
            gpio_chip,
            gpio_line,
            active_low,
            glitch_filter_us,
            min_pulse,
            min_interval,
            startup_quiet,
            flush_interval,
            upload_tick,
            min_send_interval,
            max_batch,
            request_timeout: Duration::from_secs(request_timeout_secs),
            buffer_capacity,
        })
    }

    /// Parse the upload batch size; the collector refuses more than 1000 events.
    fn parse_max_batch<F>(vars: &Vars<F>) -> Result<usize, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_var = "PRESS_COUNTER_MAX_BATCH";
        let max_batch: usize = vars.parse(env_var, DEFAULT_MAX_BATCH)?;

        if max_batch == 0 {
            return Err(ConfigError::for_var(
                env_var,
                "batch size must be greater than 0",
            ));
        }

        if max_batch > COLLECTOR_MAX_BATCH {
            return Err(ConfigError::for_var(
                env_var,
                format!(
                    "batch size {} exceeds maximum allowed ({})",
                    max_batch, COLLECTOR_MAX_BATCH
                ),
            ));
        }

        Ok(max_batch)
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            source_id: DEFAULT_SOURCE_ID.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            input: InputKind::Gpiomon,
            gpio_chip: DEFAULT_GPIO_CHIP.to_string(),
            gpio_line: DEFAULT_GPIO_LINE,
            active_low: true,
            glitch_filter_us: DEFAULT_GLITCH_FILTER_US,
            min_pulse: Duration::from_millis(DEFAULT_MIN_PULSE_MS),
            min_interval: Duration::from_millis(DEFAULT_MIN_INTERVAL_MS),
            startup_quiet: Duration::from_secs(DEFAULT_STARTUP_QUIET_SECS),
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            upload_tick: Duration::from_secs(DEFAULT_UPLOAD_TICK_SECS),
            min_send_interval: Duration::from_secs(DEFAULT_MIN_SEND_INTERVAL_SECS),
            max_batch: DEFAULT_MAX_BATCH,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Typed access to the variable lookup.
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
    {
        match self.get(key) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::for_var(key, format!("'{}' is not a valid value", value))),
            None => Ok(default),
        }
    }

    fn parse_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::for_var(
                    key,
                    format!("'{}' is not a valid boolean", value),
                )),
            },
            None => Ok(default),
        }
    }

    /// Parse a cycle period in seconds, bounded to [1, 300].
    fn cycle_secs(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        let secs: u64 = self.parse(key, default)?;

        if secs < MIN_CYCLE_SECS {
            return Err(ConfigError::for_var(
                key,
                format!("interval {} is below minimum ({}s)", secs, MIN_CYCLE_SECS),
            ));
        }

        if secs > MAX_CYCLE_SECS {
            return Err(ConfigError::for_var(
                key,
                format!("interval {} exceeds maximum ({}s)", secs, MAX_CYCLE_SECS),
            ));
        }

        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api_url, "http://localhost:8000/api/iot/events");
        assert_eq!(config.source_id, "raspi_01");
        assert_eq!(config.max_batch, 100);
        assert_eq!(config.min_pulse, Duration::from_millis(10));
        assert_eq!(config.min_interval, Duration::from_millis(120));
        assert_eq!(config.startup_quiet, Duration::from_secs(5));
        assert_eq!(config.flush_interval, Duration::from_secs(3));
        assert_eq!(config.upload_tick, Duration::from_secs(1));
        assert_eq!(config.min_send_interval, Duration::from_secs(20));
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.gpio_line, 27);
        assert!(config.active_low);
    }

    #[test]
    fn test_empty_lookup_matches_defaults() {
        let config = load(&[]).expect("Should load with defaults");
        let defaults = Config::default();
        assert_eq!(config.api_url, defaults.api_url);
        assert_eq!(config.max_batch, defaults.max_batch);
        assert_eq!(config.flush_interval, defaults.flush_interval);
        assert_eq!(config.input, InputKind::Gpiomon);
    }

    #[test]
    fn test_custom_values() {
        let config = load(&[
            ("PRESS_COUNTER_API_URL", "http://collector:9000/api/iot/events/"),
            ("PRESS_COUNTER_SOURCE_ID", "raspi_07"),
            ("PRESS_COUNTER_INPUT", "Simulated"),
            ("PRESS_COUNTER_ACTIVE_LOW", "no"),
            ("PRESS_COUNTER_MAX_BATCH", "250"),
            ("PRESS_COUNTER_MIN_PULSE_MS", "25"),
            ("PRESS_COUNTER_FLUSH_INTERVAL_SECS", "10"),
        ])
        .expect("Should load custom values");

        // Trailing slash removed
        assert_eq!(config.api_url, "http://collector:9000/api/iot/events");
        assert_eq!(config.source_id, "raspi_07");
        assert_eq!(config.input, InputKind::Simulated);
        assert!(!config.active_low);
        assert_eq!(config.max_batch, 250);
        assert_eq!(config.min_pulse, Duration::from_millis(25));
        assert_eq!(config.flush_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[("PRESS_COUNTER_GPIO_LINE", "not_a_number")]).unwrap_err();
        assert!(err.message.contains("not a valid value"));
        assert_eq!(err.env_var.as_deref(), Some("PRESS_COUNTER_GPIO_LINE"));
    }

    #[test]
    fn test_zero_batch_size() {
        let err = load(&[("PRESS_COUNTER_MAX_BATCH", "0")]).unwrap_err();
        assert!(err.message.contains("greater than 0"));
    }

    #[test]
    fn test_batch_size_above_collector_limit() {
        let err = load(&[("PRESS_COUNTER_MAX_BATCH", "1001")]).unwrap_err();
        assert!(err.message.contains("exceeds maximum"));

        let config = load(&[("PRESS_COUNTER_MAX_BATCH", "1000")]).unwrap();
        assert_eq!(config.max_batch, COLLECTOR_MAX_BATCH);
    }

    #[test]
    fn test_cycle_interval_bounds() {
        let err = load(&[("PRESS_COUNTER_FLUSH_INTERVAL_SECS", "0")]).unwrap_err();
        assert!(err.message.contains("below minimum"));

        let err = load(&[("PRESS_COUNTER_UPLOAD_TICK_SECS", "999")]).unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn test_rejects_bad_input_kind_and_bool() {
        let err = load(&[("PRESS_COUNTER_INPUT", "serial")]).unwrap_err();
        assert_eq!(err.env_var.as_deref(), Some("PRESS_COUNTER_INPUT"));

        let err = load(&[("PRESS_COUNTER_ACTIVE_LOW", "maybe")]).unwrap_err();
        assert!(err.message.contains("not a valid boolean"));
    }

    #[test]
    fn test_rejects_empty_source_id_and_zero_timeout() {
        assert!(load(&[("PRESS_COUNTER_SOURCE_ID", "  ")]).is_err());
        assert!(load(&[("PRESS_COUNTER_REQUEST_TIMEOUT_SECS", "0")]).is_err());
        assert!(load(&[("PRESS_COUNTER_BUFFER_CAPACITY", "0")]).is_err());
        assert!(load(&[("PRESS_COUNTER_GLITCH_FILTER_US", "500000")]).is_err());
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
