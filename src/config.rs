//! Configuration loading helpers.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::device::FileNamespace;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files or opening the device.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// Missing required configuration field.
    #[error("missing required field: {0}")]
    MissingField(String),
}

/// What a second write to a log does while one is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyPolicy {
    /// Block until the in-flight write commits or fails.
    #[default]
    Wait,
    /// Return [`Error::Busy`](crate::Error::Busy) immediately.
    FailFast,
}

impl FromStr for BusyPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wait" => Ok(BusyPolicy::Wait),
            "fail_fast" | "fail-fast" => Ok(BusyPolicy::FailFast),
            _ => Err(()),
        }
    }
}

impl fmt::Display for BusyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusyPolicy::Wait => write!(f, "wait"),
            BusyPolicy::FailFast => write!(f, "fail_fast"),
        }
    }
}

/// Runtime configuration of a [`LogEngine`](crate::LogEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of data/log io workers (the metadata worker is extra).
    pub io_threads: usize,
    /// How long an idle worker blocks before re-checking for shutdown.
    pub idle_poll: Duration,
    /// Behaviour of a write that finds another write of the same log in flight.
    pub busy_policy: BusyPolicy,
    /// Cap on a single request, below the controller's transfer limit.
    pub max_io_bytes: Option<usize>,
    /// Outstanding commands allowed per queue pair.
    pub queue_pair_requests: usize,
    /// Attach only the controller with this transport address.
    pub controller_address: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            io_threads: 1,
            idle_poll: Duration::from_millis(5),
            busy_policy: BusyPolicy::Wait,
            max_io_bytes: None,
            queue_pair_requests: 256,
            controller_address: None,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of io workers.
    pub fn with_io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads;
        self
    }

    /// Set the busy policy.
    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    /// Cap the per-request size.
    pub fn with_max_io_bytes(mut self, bytes: usize) -> Self {
        self.max_io_bytes = Some(bytes);
        self
    }

    /// Attach only the controller at `address`.
    pub fn with_controller_address(mut self, address: impl Into<String>) -> Self {
        self.controller_address = Some(address.into());
        self
    }
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NvlogConfig {
    /// Engine configuration.
    pub engine: Option<EngineConfigSpec>,
    /// Device configuration.
    pub device: Option<DeviceConfigSpec>,
}

impl NvlogConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `NVLOG_CONFIG` env var (if set),
    /// then apply `NVLOG__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("NVLOG_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("NVLOG__") {
                continue;
            }
            let path = key["NVLOG__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["engine", "io_threads"] => {
                    self.engine_mut().io_threads = Some(parse_value(&key, &value)?);
                }
                ["engine", "idle_poll_ms"] => {
                    self.engine_mut().idle_poll_ms = Some(parse_value(&key, &value)?);
                }
                ["engine", "busy_policy"] => {
                    self.engine_mut().busy_policy = Some(value);
                }
                ["engine", "max_io_bytes"] => {
                    self.engine_mut().max_io_bytes = Some(parse_value(&key, &value)?);
                }
                ["engine", "queue_pair_requests"] => {
                    self.engine_mut().queue_pair_requests = Some(parse_value(&key, &value)?);
                }
                ["engine", "controller_address"] => {
                    self.engine_mut().controller_address = Some(value);
                }
                ["device", "path"] => {
                    self.device_mut().path = Some(PathBuf::from(value));
                }
                ["device", "capacity"] => {
                    self.device_mut().capacity = Some(parse_value(&key, &value)?);
                }
                ["device", "sector_size"] => {
                    self.device_mut().sector_size = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build an `EngineConfig` using defaults plus overrides.
    pub fn to_engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let mut config = EngineConfig::default();
        if let Some(engine) = &self.engine {
            engine.apply_to(&mut config)?;
        }
        Ok(config)
    }

    /// Open the file-backed namespace from the configuration, if present.
    pub fn open_device(&self) -> Result<Option<FileNamespace>, ConfigError> {
        match self.device.as_ref() {
            Some(spec) => Ok(Some(spec.open()?)),
            None => Ok(None),
        }
    }

    fn engine_mut(&mut self) -> &mut EngineConfigSpec {
        self.engine.get_or_insert_with(EngineConfigSpec::default)
    }

    fn device_mut(&mut self) -> &mut DeviceConfigSpec {
        self.device.get_or_insert_with(DeviceConfigSpec::default)
    }
}

/// Engine configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfigSpec {
    /// Number of io workers.
    pub io_threads: Option<usize>,
    /// Idle poll interval in milliseconds.
    pub idle_poll_ms: Option<u64>,
    /// `wait` or `fail_fast`.
    pub busy_policy: Option<String>,
    /// Per-request size cap in bytes.
    pub max_io_bytes: Option<usize>,
    /// Queue pair depth.
    pub queue_pair_requests: Option<usize>,
    /// Controller transport address filter.
    pub controller_address: Option<String>,
}

impl EngineConfigSpec {
    fn apply_to(&self, config: &mut EngineConfig) -> Result<(), ConfigError> {
        if let Some(value) = self.io_threads {
            config.io_threads = value.max(1);
        }
        if let Some(value) = self.idle_poll_ms {
            config.idle_poll = Duration::from_millis(value.max(1));
        }
        if let Some(value) = &self.busy_policy {
            config.busy_policy = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "engine.busy_policy".into(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = self.max_io_bytes {
            config.max_io_bytes = Some(value);
        }
        if let Some(value) = self.queue_pair_requests {
            config.queue_pair_requests = value.max(1);
        }
        if let Some(value) = &self.controller_address {
            config.controller_address = Some(value.clone());
        }
        Ok(())
    }
}

/// File-backed namespace configuration from TOML/env.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfigSpec {
    /// Path of the namespace image.
    pub path: Option<PathBuf>,
    /// Capacity in bytes used when the image is created.
    pub capacity: Option<u64>,
    /// Sector size in bytes (default 512).
    pub sector_size: Option<usize>,
}

impl DeviceConfigSpec {
    fn open(&self) -> Result<FileNamespace, ConfigError> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| ConfigError::MissingField("device.path".into()))?;
        let capacity = self
            .capacity
            .ok_or_else(|| ConfigError::MissingField("device.capacity".into()))?;
        let sector_size = self.sector_size.unwrap_or(512);
        if !sector_size.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                key: "device.sector_size".into(),
                value: sector_size.to_string(),
            });
        }
        Ok(FileNamespace::open(path, capacity, sector_size)?)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
