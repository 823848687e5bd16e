// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration for a single log path: source, input windows, disk buffer and destination.
//!
//! Configuration is read from an optional JSON file (`LOGQUEUE_CONFIG`) and then
//! overridden from `LOGQUEUE_*` environment variables. Option names accept both
//! the snake case used here and the dashed spelling operators are used to
//! (`capacity-bytes`, `front-cache-size`).

use crate::constants::{
    DEFAULT_CAPACITY_BYTES, DEFAULT_DYNAMIC_WINDOW_REALLOC_TICKS, DEFAULT_FRONT_CACHE_SIZE,
    DEFAULT_LOG_IW_SIZE, DEFAULT_MAX_CONNECTIONS, DEFAULT_SOURCE_HOST, DEFAULT_SOURCE_PORT,
    DEFAULT_TIME_REOPEN, MIN_CAPACITY_BYTES,
};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Log path declared with the flow-control flag.
    #[serde(alias = "flow-control")]
    pub flow_control: bool,
    pub source: SourceConfig,
    pub window: WindowConfig,
    #[serde(alias = "disk-buffer")]
    pub disk_buffer: DiskBufferConfig,
    pub destination: DestinationConfig,
    pub stats: StatsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            flow_control: true,
            source: SourceConfig::default(),
            window: WindowConfig::default(),
            disk_buffer: DiskBufferConfig::default(),
            destination: DestinationConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub host: String,
    /// TCP port of the newline-delimited source. `0` picks a free port.
    pub port: u16,
    /// Port of the webhook HTTP source, disabled when unset.
    #[serde(alias = "webhook-port")]
    pub webhook_port: Option<u16>,
    /// Bearer token required by the webhook source when set.
    #[serde(alias = "auth-token")]
    pub auth_token: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SOURCE_HOST.to_string(),
            port: DEFAULT_SOURCE_PORT,
            webhook_port: None,
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    #[serde(alias = "log-iw-size")]
    pub log_iw_size: usize,
    #[serde(alias = "max-connections")]
    pub max_connections: usize,
    /// Size of the shared dynamic pool. `0` selects static windows.
    #[serde(alias = "dynamic-window-size")]
    pub dynamic_window_size: usize,
    /// Number of statistics ticks between two rebalances.
    #[serde(alias = "dynamic-window-realloc-ticks")]
    pub dynamic_window_realloc_ticks: u32,
    pub rebalance: RebalanceKind,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            log_iw_size: DEFAULT_LOG_IW_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            dynamic_window_size: 0,
            dynamic_window_realloc_ticks: DEFAULT_DYNAMIC_WINDOW_REALLOC_TICKS,
            rebalance: RebalanceKind::default(),
        }
    }
}

impl WindowConfig {
    pub fn is_dynamic(&self) -> bool {
        self.dynamic_window_size > 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebalanceKind {
    #[default]
    DemandWeighted,
    EvenSplit,
}

/// Options that identify a queue file. A change to any of them on reload
/// abandons the current file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskBufferConfig {
    pub reliable: bool,
    pub dir: PathBuf,
    #[serde(alias = "capacity-bytes", with = "size_serde")]
    pub capacity_bytes: u64,
    #[serde(alias = "front-cache-size")]
    pub front_cache_size: usize,
    /// Hard ceiling of the flow-control window. Unbounded when unset, in which
    /// case the input windows of the sources are the only limit.
    #[serde(alias = "flow-control-window-size")]
    pub flow_control_window_size: Option<usize>,
    /// Allocate the whole file when it is created.
    pub prealloc: bool,
}

impl Default for DiskBufferConfig {
    fn default() -> Self {
        Self {
            reliable: false,
            dir: PathBuf::from("."),
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            front_cache_size: DEFAULT_FRONT_CACHE_SIZE,
            flow_control_window_size: None,
            prealloc: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub driver: DestinationDriver,
    #[serde(alias = "time-reopen", with = "seconds_serde")]
    pub time_reopen: Duration,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            driver: DestinationDriver::Tcp {
                address: "127.0.0.1:514".to_string(),
            },
            time_reopen: DEFAULT_TIME_REOPEN,
        }
    }
}

impl DestinationConfig {
    /// Stable identity used to match a queue file to its destination across reloads.
    pub fn identity(&self) -> String {
        self.driver.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DestinationDriver {
    Tcp { address: String },
    File { path: PathBuf },
}

impl fmt::Display for DestinationDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { address } => write!(f, "tcp,{address}"),
            Self::File { path } => write!(f, "file,{}", path.display()),
        }
    }
}

impl DestinationDriver {
    /// Parses `tcp://host:port` or `file:///path`.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        if let Some(address) = value.strip_prefix("tcp://") {
            if address.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "tcp destination requires an address".to_string(),
                ));
            }
            return Ok(Self::Tcp {
                address: address.to_string(),
            });
        }
        if let Some(path) = value.strip_prefix("file://") {
            if path.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "file destination requires a path".to_string(),
                ));
            }
            return Ok(Self::File {
                path: PathBuf::from(path),
            });
        }
        Err(ConfigError::InvalidConfig(format!(
            "Unsupported destination '{value}'. Expected tcp://host:port or file:///path"
        )))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Port of the HTTP endpoint serving `/metrics`, disabled when unset.
    pub port: Option<u16>,
}

impl Config {
    /// Reads the JSON configuration file at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Create configuration from `LOGQUEUE_CONFIG` and `LOGQUEUE_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("LOGQUEUE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        config.normalize();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(level) = env::var("LOGQUEUE_LOG_LEVEL") {
            self.log_level = level.to_lowercase();
        }
        if let Ok(val) = env::var("LOGQUEUE_FLOW_CONTROL") {
            self.flow_control = val.to_lowercase() != "false";
        }

        if let Ok(host) = env::var("LOGQUEUE_SOURCE_HOST") {
            self.source.host = host;
        }
        if let Some(port) = parse_env("LOGQUEUE_SOURCE_PORT") {
            self.source.port = port;
        }
        if let Some(port) = parse_env("LOGQUEUE_WEBHOOK_PORT") {
            self.source.webhook_port = Some(port);
        }
        if let Ok(token) = env::var("LOGQUEUE_WEBHOOK_AUTH_TOKEN") {
            self.source.auth_token = Some(token);
        }

        if let Some(size) = parse_env("LOGQUEUE_LOG_IW_SIZE") {
            self.window.log_iw_size = size;
        }
        if let Some(max) = parse_env("LOGQUEUE_MAX_CONNECTIONS") {
            self.window.max_connections = max;
        }
        if let Some(size) = parse_env("LOGQUEUE_DYNAMIC_WINDOW_SIZE") {
            self.window.dynamic_window_size = size;
        }
        if let Some(ticks) = parse_env("LOGQUEUE_DYNAMIC_WINDOW_REALLOC_TICKS") {
            self.window.dynamic_window_realloc_ticks = ticks;
        }

        if let Ok(dir) = env::var("LOGQUEUE_DISK_BUFFER_DIR") {
            self.disk_buffer.dir = PathBuf::from(dir);
        }
        if let Ok(val) = env::var("LOGQUEUE_DISK_BUFFER_RELIABLE") {
            self.disk_buffer.reliable = val.to_lowercase() == "true";
        }
        if let Ok(size) = env::var("LOGQUEUE_CAPACITY_BYTES") {
            self.disk_buffer.capacity_bytes = parse_size(&size)?;
        }
        if let Some(size) = parse_env("LOGQUEUE_FRONT_CACHE_SIZE") {
            self.disk_buffer.front_cache_size = size;
        }

        if let Ok(destination) = env::var("LOGQUEUE_DESTINATION") {
            self.destination.driver = DestinationDriver::parse(&destination)?;
        }
        if let Some(secs) = parse_env::<u64>("LOGQUEUE_TIME_REOPEN") {
            self.destination.time_reopen = Duration::from_secs(secs);
        }

        if let Some(port) = parse_env("LOGQUEUE_STATS_PORT") {
            self.stats.port = Some(port);
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.log_iw_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "log_iw_size must be greater than 0".to_string(),
            ));
        }

        if self.window.max_connections == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.window.is_dynamic() && self.window.dynamic_window_realloc_ticks == 0 {
            return Err(ConfigError::InvalidConfig(
                "dynamic_window_realloc_ticks must be greater than 0".to_string(),
            ));
        }

        if self.disk_buffer.dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "disk buffer dir cannot be empty".to_string(),
            ));
        }

        if let (true, Some(limit)) = (self.flow_control, self.disk_buffer.flow_control_window_size)
        {
            let admitted = self.window.log_iw_size + self.window.dynamic_window_size;
            if limit < admitted {
                return Err(ConfigError::InvalidConfig(format!(
                    "flow_control_window_size ({limit}) must be at least the total input window ({admitted})"
                )));
            }
        }

        if self.destination.time_reopen.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "time_reopen must be greater than 0".to_string(),
            ));
        }

        match &self.destination.driver {
            DestinationDriver::Tcp { address } if address.trim().is_empty() => {
                return Err(ConfigError::InvalidConfig(
                    "tcp destination requires an address".to_string(),
                ));
            }
            DestinationDriver::File { path } if path.as_os_str().is_empty() => {
                return Err(ConfigError::InvalidConfig(
                    "file destination requires a path".to_string(),
                ));
            }
            _ => {}
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Raises out-of-range values that are accepted with a warning.
    pub fn normalize(&mut self) {
        if self.disk_buffer.capacity_bytes < MIN_CAPACITY_BYTES {
            warn!(
                configured = self.disk_buffer.capacity_bytes,
                minimum = MIN_CAPACITY_BYTES,
                "The value of capacity_bytes is too low, setting to the minimal value"
            );
            self.disk_buffer.capacity_bytes = MIN_CAPACITY_BYTES;
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

/// Parses a size such as `1MiB`, `512KiB`, `10MB` or `4096`.
///
/// Decimal suffixes (`K`, `KB`, `M`, `MB`, `G`, `GB`) are powers of 1000,
/// binary suffixes (`KiB`, `MiB`, `GiB`) powers of 1024.
pub fn parse_size(value: &str) -> Result<u64, ConfigError> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    let number: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidSize(value.to_string()))?;
    let multiplier: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "kib" => 1_024,
        "m" | "mb" => 1_000_000,
        "mib" => 1_024 * 1_024,
        "g" | "gb" => 1_000_000_000,
        "gib" => 1_024 * 1_024 * 1_024,
        _ => return Err(ConfigError::InvalidSize(value.to_string())),
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| ConfigError::InvalidSize(value.to_string()))
}

mod size_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Size::deserialize(deserializer)? {
            Size::Bytes(bytes) => Ok(bytes),
            Size::Text(text) => super::parse_size(&text).map_err(serde::de::Error::custom),
        }
    }
}

mod seconds_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
