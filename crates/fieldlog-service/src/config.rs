//! Station configuration.
//!
//! Loaded from TOML, then overlaid with environment variables so a station
//! can keep its credentials out of the file:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `INFLUX_URL` | `sink.url` |
//! | `INFLUX_TOKEN` | `sink.token` |
//! | `INFLUX_ORG` | `sink.org` |
//! | `INFLUX_BUCKET` | `sink.bucket` |
//! | `MODBUS_DEVICE` | `device` of every wind sensor that has none |

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fieldlog_types::{SensorKind, validate_name};

/// Minimum scheduler tick in milliseconds.
pub const MIN_TICK_MILLIS: u64 = 100;
/// Minimum sampling interval in seconds.
pub const MIN_SENSOR_INTERVAL: u64 = 1;
/// Largest valid Modbus unit id.
pub const MAX_UNIT_ID: u8 = 247;

/// Station configuration.
///
/// The default describes the single anemometer station: one wind sensor
/// sampled every second, its device taken from `MODBUS_DEVICE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote store settings.
    pub sink: SinkConfig,
    /// Local buffer settings.
    pub buffer: BufferConfig,
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Static tags added to every record.
    pub station: StationConfig,
    /// Sensors to sample, in registration order.
    pub sensors: Vec<SensorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sink: SinkConfig::default(),
            buffer: BufferConfig::default(),
            scheduler: SchedulerConfig::default(),
            station: StationConfig::default(),
            sensors: default_sensors(),
        }
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// A missing file yields the default configuration, which still needs
    /// the sink settings from the environment to validate.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any variable lookup.
    ///
    /// Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("INFLUX_URL") {
            self.sink.url = url;
        }
        if let Some(token) = get("INFLUX_TOKEN") {
            self.sink.token = token;
        }
        if let Some(org) = get("INFLUX_ORG") {
            self.sink.org = org;
        }
        if let Some(bucket) = get("INFLUX_BUCKET") {
            self.sink.bucket = bucket;
        }
        if let Some(device) = get("MODBUS_DEVICE") {
            for sensor in &mut self.sensors {
                if sensor.kind == SensorKind::Wind && sensor.device.is_none() {
                    sensor.device = Some(PathBuf::from(&device));
                }
            }
        }
    }

    /// Validate the configuration and return every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use fieldlog_service::Config;
    ///
    /// let mut config = Config::default();
    /// assert!(config.validate().is_err());
    ///
    /// config.apply_overrides(|key| match key {
    ///     "INFLUX_URL" => Some("http://localhost:8086".into()),
    ///     "INFLUX_TOKEN" => Some("secret".into()),
    ///     "INFLUX_ORG" => Some("ops".into()),
    ///     "INFLUX_BUCKET" => Some("weather".into()),
    ///     "MODBUS_DEVICE" => Some("/dev/ttyUSB0".into()),
    ///     _ => None,
    /// });
    /// config.validate().expect("complete config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.sink.validate());
        errors.extend(self.buffer.validate());
        errors.extend(self.scheduler.validate());
        errors.extend(self.station.validate());

        if self.sensors.is_empty() {
            errors.push(ValidationError::new("sensors", "no sensors configured"));
        }

        let mut seen_ids = HashSet::new();
        for (i, sensor) in self.sensors.iter().enumerate() {
            let prefix = format!("sensors[{}]", i);
            errors.extend(sensor.validate(&prefix));

            if !sensor.id.is_empty() && !seen_ids.insert(sensor.id.as_str()) {
                errors.push(ValidationError::new(
                    format!("{}.id", prefix),
                    format!("duplicate sensor id '{}'", sensor.id),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

/// InfluxDB v2 connection settings. All four strings are required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Base URL, e.g. `http://influx.local:8086`.
    pub url: String,
    /// API token.
    pub token: String,
    /// Organization name.
    pub org: String,
    /// Bucket name.
    pub bucket: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            org: String::new(),
            bucket: String::new(),
            timeout_secs: 10,
        }
    }
}

impl SinkConfig {
    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Validate sink configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (name, value, var) in [
            ("url", &self.url, "INFLUX_URL"),
            ("token", &self.token, "INFLUX_TOKEN"),
            ("org", &self.org, "INFLUX_ORG"),
            ("bucket", &self.bucket, "INFLUX_BUCKET"),
        ] {
            if value.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("sink.{}", name),
                    format!("missing; set it in [sink] or via {}", var),
                ));
            }
        }

        if !self.url.is_empty()
            && !self.url.starts_with("http://")
            && !self.url.starts_with("https://")
        {
            errors.push(ValidationError::new(
                "sink.url",
                format!("'{}' must start with http:// or https://", self.url),
            ));
        }

        if self.timeout_secs == 0 {
            errors.push(ValidationError::new("sink.timeout_secs", "timeout cannot be 0"));
        }

        errors
    }
}

/// Local buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Buffer file path.
    pub path: PathBuf,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            path: fieldlog_store::default_buffer_path(),
        }
    }
}

impl BufferConfig {
    /// Validate buffer configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        if self.path.as_os_str().is_empty() {
            vec![ValidationError::new("buffer.path", "buffer path cannot be empty")]
        } else {
            Vec::new()
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Tick period in milliseconds.
    pub tick_millis: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_millis: 1000 }
    }
}

impl SchedulerConfig {
    /// Tick period.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    /// Validate scheduler configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        if self.tick_millis < MIN_TICK_MILLIS {
            vec![ValidationError::new(
                "scheduler.tick_millis",
                format!(
                    "tick {}ms is too short (minimum {}ms)",
                    self.tick_millis, MIN_TICK_MILLIS
                ),
            )]
        } else {
            Vec::new()
        }
    }
}

/// Static tags written on every record, e.g. `station = "north-ridge"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(flatten)]
    pub tags: BTreeMap<String, String>,
}

impl StationConfig {
    /// Validate station tags.
    ///
    /// Keys and values must be writable as line-protocol names, and `sensor`
    /// is reserved for the sensor id.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (key, value) in &self.tags {
            let field = format!("station.{}", key);
            if key.trim().is_empty() || value.trim().is_empty() {
                errors.push(ValidationError::new(
                    field,
                    "tag keys and values cannot be empty",
                ));
            } else if let Err(e) = validate_name(key).and_then(|()| validate_name(value)) {
                errors.push(ValidationError::new(field, e.to_string()));
            } else if key == fieldlog_core::point::SENSOR_TAG {
                errors.push(ValidationError::new(
                    field,
                    "the sensor tag is set per sensor and cannot be a station tag",
                ));
            }
        }
        errors
    }
}

/// One sensor to sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Identifier, written as the `sensor` tag.
    pub id: String,
    /// Sensor kind.
    pub kind: SensorKind,
    /// Serial device node. Required for wind sensors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<PathBuf>,
    /// Modbus unit id.
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Serial line speed.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-read timeout in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Sampling interval in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Measurement name replacing the kind's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement: Option<String>,
}

fn default_unit_id() -> u8 {
    fieldlog_core::wind::DEFAULT_UNIT_ID
}

fn default_baud_rate() -> u32 {
    fieldlog_core::modbus::DEFAULT_BAUD_RATE
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_interval() -> u64 {
    1
}

/// A single anemometer whose device comes from `MODBUS_DEVICE`.
fn default_sensors() -> Vec<SensorConfig> {
    vec![SensorConfig {
        id: "wind".to_string(),
        kind: SensorKind::Wind,
        device: None,
        unit_id: default_unit_id(),
        baud_rate: default_baud_rate(),
        read_timeout_ms: default_read_timeout_ms(),
        interval: default_interval(),
        measurement: None,
    }]
}

impl SensorConfig {
    /// Sampling interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Per-read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Validate sensor configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("{}.id", prefix),
                "sensor id cannot be empty",
            ));
        } else if let Err(e) = validate_name(&self.id) {
            errors.push(ValidationError::new(format!("{}.id", prefix), e.to_string()));
        }

        if self.interval < MIN_SENSOR_INTERVAL {
            errors.push(ValidationError::new(
                format!("{}.interval", prefix),
                format!(
                    "interval {} is too short (minimum {} second)",
                    self.interval, MIN_SENSOR_INTERVAL
                ),
            ));
        }

        if self.read_timeout_ms == 0 {
            errors.push(ValidationError::new(
                format!("{}.read_timeout_ms", prefix),
                "read timeout cannot be 0",
            ));
        }

        if let Some(measurement) = &self.measurement {
            if measurement.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.measurement", prefix),
                    "measurement cannot be empty string (omit it instead)",
                ));
            } else if let Err(e) = validate_name(measurement) {
                errors.push(ValidationError::new(
                    format!("{}.measurement", prefix),
                    e.to_string(),
                ));
            }
        }

        if self.kind == SensorKind::Wind {
            match &self.device {
                None => errors.push(ValidationError::new(
                    format!("{}.device", prefix),
                    "wind sensors need a serial device; set it here or via MODBUS_DEVICE",
                )),
                Some(device) if device.as_os_str().is_empty() => {
                    errors.push(ValidationError::new(
                        format!("{}.device", prefix),
                        "device path cannot be empty",
                    ));
                }
                Some(_) => {}
            }

            if self.baud_rate == 0 {
                errors.push(ValidationError::new(
                    format!("{}.baud_rate", prefix),
                    "baud rate cannot be 0",
                ));
            }

            if self.unit_id == 0 || self.unit_id > MAX_UNIT_ID {
                errors.push(ValidationError::new(
                    format!("{}.unit_id", prefix),
                    format!("unit id {} outside 1..={}", self.unit_id, MAX_UNIT_ID),
                ));
            }
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `sink.url` or `sensors[0].device`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldlog")
        .join("station.toml")
}
