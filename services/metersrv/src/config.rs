//! metersrv configuration
//!
//! Layered with figment: built-in defaults, then the YAML file, then
//! `METERSRV_` environment variables (`__` separates nesting levels, e.g.
//! `METERSRV_SCHEDULE__PERIOD=5s`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::LoggingConfig;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::reading::FieldFailurePolicy;
use crate::register_map::RegisterMap;

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/metersrv.yaml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "METERSRV_";

/// Highest valid Modbus slave address
pub const MAX_SLAVE_ID: u8 = 247;

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Bus lock identity; defaults to `<name>:<pid>`
    pub identity: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "metersrv".to_string(),
            identity: None,
        }
    }
}

impl ServiceConfig {
    pub fn identity(&self) -> String {
        self.identity
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.name, std::process::id()))
    }
}

/// Which meter to read
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MeterConfig {
    /// Built-in register map name
    pub model: String,
    /// Custom register map file; takes priority over `model`
    pub register_map: Option<PathBuf>,
    pub slave_id: u8,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            model: "schneider_iem2150".to_string(),
            register_map: None,
            slave_id: 1,
        }
    }
}

impl MeterConfig {
    pub fn load_register_map(&self) -> Result<RegisterMap, ConfigError> {
        match &self.register_map {
            Some(path) => RegisterMap::from_file(path),
            None => RegisterMap::builtin(&self.model),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial line settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial device; first /dev/ttyUSB* or COM* port when unset
    pub port: Option<String>,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockBackendKind {
    Semaphore,
    Marker,
}

impl Default for LockBackendKind {
    fn default() -> Self {
        if cfg!(unix) {
            LockBackendKind::Semaphore
        } else {
            LockBackendKind::Marker
        }
    }
}

/// Bus arbitration settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusLockConfig {
    pub backend: LockBackendKind,
    /// Shared name: semaphore name, or marker prefix without the slash
    pub name: String,
    /// Marker directory; /dev/shm when present
    pub marker_dir: Option<PathBuf>,
    /// Bounded wait; 2s for semaphores, ten polls for markers when unset
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Take over the bus from a holder that outlived `timeout`
    pub reclaim_stale: bool,
}

impl Default for BusLockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackendKind::default(),
            name: "/rs485".to_string(),
            marker_dir: None,
            timeout: None,
            poll_interval: Duration::from_millis(500),
            reclaim_stale: true,
        }
    }
}

impl BusLockConfig {
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(match self.backend {
            LockBackendKind::Semaphore => Duration::from_secs(2),
            LockBackendKind::Marker => self.poll_interval * 10,
        })
    }

    pub fn marker_prefix(&self) -> String {
        self.name.trim_start_matches('/').to_string()
    }

    pub fn marker_dir(&self) -> PathBuf {
        self.marker_dir
            .clone()
            .unwrap_or_else(crate::bus_lock::default_marker_dir)
    }
}

/// Acquisition cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduleConfig {
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    /// Durability barrier every N cycles
    pub flush_every: u32,
    /// Put deadlines on wall-clock multiples of `period`
    pub align_to_wall_clock: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(10),
            flush_every: 10,
            align_to_wall_clock: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Csv,
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }
}

/// Log file output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub format: OutputFormat,
    pub failure_policy: FieldFailurePolicy,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            format: OutputFormat::Csv,
            failure_policy: FieldFailurePolicy::Degrade,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    #[default]
    Log,
    None,
    Command,
}

/// Status indicator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    pub indicator: IndicatorKind,
    /// Helper program called as `<program> <pixel> <colour>`
    pub command: Option<PathBuf>,
    /// 0.0..=1.0
    pub brightness: f32,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            indicator: IndicatorKind::Log,
            command: None,
            brightness: 0.1,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeterSrvConfig {
    pub service: ServiceConfig,
    pub meter: MeterConfig,
    pub serial: SerialConfig,
    pub bus_lock: BusLockConfig,
    pub schedule: ScheduleConfig,
    pub output: OutputConfig,
    pub status: StatusConfig,
    pub logging: LoggingConfig,
}

impl MeterSrvConfig {
    /// Defaults plus the YAML file, without environment overrides
    pub fn figment(path: Option<&Path>) -> Result<Figment, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(MeterSrvConfig::default()));
        match path {
            Some(path) if !path.exists() => {
                return Err(ConfigError::Load(format!(
                    "configuration file {} not found",
                    path.display()
                )))
            },
            Some(path) => figment = figment.merge(Yaml::file(path)),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    figment = figment.merge(Yaml::file(default));
                }
            },
        }
        Ok(figment)
    }

    /// Load configuration: defaults, YAML file, then METERSRV_ env vars
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path)?
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Check ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::invalid("service.name", "cannot be empty"));
        }

        if self.meter.register_map.is_none() && self.meter.model.trim().is_empty() {
            return Err(ConfigError::invalid(
                "meter.model",
                "set a built-in model or a register_map file",
            ));
        }
        if self.meter.slave_id == 0 || self.meter.slave_id > MAX_SLAVE_ID {
            return Err(ConfigError::invalid(
                "meter.slave_id",
                format!("must be between 1 and {}", MAX_SLAVE_ID),
            ));
        }

        if self.serial.baud_rate == 0 {
            return Err(ConfigError::invalid("serial.baud_rate", "must be positive"));
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(ConfigError::invalid("serial.data_bits", "must be 5, 6, 7 or 8"));
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            return Err(ConfigError::invalid("serial.stop_bits", "must be 1 or 2"));
        }
        if self.serial.timeout.is_zero() {
            return Err(ConfigError::invalid("serial.timeout", "must be positive"));
        }

        if self.bus_lock.name.trim_start_matches('/').is_empty() {
            return Err(ConfigError::invalid("bus_lock.name", "cannot be empty"));
        }
        if self.bus_lock.effective_timeout().is_zero() {
            return Err(ConfigError::invalid("bus_lock.timeout", "must be positive"));
        }
        if self.bus_lock.poll_interval.is_zero() {
            return Err(ConfigError::invalid("bus_lock.poll_interval", "must be positive"));
        }
        if !cfg!(unix) && self.bus_lock.backend == LockBackendKind::Semaphore {
            return Err(ConfigError::invalid(
                "bus_lock.backend",
                "semaphore backend needs a unix host",
            ));
        }

        if self.schedule.period.is_zero() {
            return Err(ConfigError::invalid("schedule.period", "must be positive"));
        }
        if self.schedule.flush_every == 0 {
            return Err(ConfigError::invalid("schedule.flush_every", "must be positive"));
        }

        if self.status.indicator == IndicatorKind::Command && self.status.command.is_none() {
            return Err(ConfigError::invalid(
                "status.command",
                "required for the command indicator",
            ));
        }
        if !(0.0..=1.0).contains(&self.status.brightness) {
            return Err(ConfigError::invalid("status.brightness", "must be within 0.0..=1.0"));
        }

        Ok(())
    }
}
