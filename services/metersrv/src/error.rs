//! Error handling for the meter acquisition service
//!
//! Each concern owns a small error enum; [`MeterSrvError`] aggregates them at
//! the service level and classifies them through [`ServiceErrorTrait`].

use std::time::Duration;

use errors::{ErrorCategory, ServiceErrorTrait};
use thiserror::Error;

// ============================================================================
// Decode errors
// ============================================================================

/// Malformed or unsupported register payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{kind} needs {required} words, got {got}")]
    InsufficientWords {
        kind: String,
        required: usize,
        got: usize,
    },

    #[error("unsupported decode kind: {0}")]
    UnsupportedKind(String),
}

// ============================================================================
// Transport errors
// ============================================================================

/// Failure reported by the register transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Modbus exception from slave: {0}")]
    Exception(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("short response: expected {expected} registers, got {got}")]
    ShortResponse { expected: usize, got: usize },
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Why a single field of a reading has no value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

// ============================================================================
// Bus lock errors
// ============================================================================

#[derive(Error, Debug)]
pub enum BusLockError {
    #[error("bus lock '{name}' not acquired within {waited:?}")]
    BusTimeout { name: String, waited: Duration },

    #[error("bus lock I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus lock backend unavailable: {0}")]
    Unsupported(String),
}

// ============================================================================
// Storage errors
// ============================================================================

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("flush failed: {0}")]
    Flush(#[source] std::io::Error),

    #[error("sync failed: {0}")]
    Sync(#[source] std::io::Error),

    #[error("record encoding failed: {0}")]
    Encode(String),

    #[error("sink is closed")]
    Closed,
}

impl From<csv::Error> for StorageError {
    fn from(err: csv::Error) -> Self {
        StorageError::Encode(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Encode(err.to_string())
    }
}

// ============================================================================
// Configuration errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("unknown meter model '{0}'")]
    UnknownModel(String),

    #[error("register map '{source_name}': {reason}")]
    RegisterMap { source_name: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn register_map(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::RegisterMap {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(err.to_string())
    }
}

// ============================================================================
// Service error
// ============================================================================

/// Service-level error taxonomy
#[derive(Error, Debug)]
pub enum MeterSrvError {
    /// No transport endpoint discoverable
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Bus lock not acquired within its bound
    #[error("bus timeout on '{name}' after {waited:?}")]
    BusTimeout { name: String, waited: Duration },

    #[error("bus lock error: {0}")]
    BusLock(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("status indicator error: {0}")]
    Indicator(String),
}

/// Result type alias for the service
pub type Result<T> = std::result::Result<T, MeterSrvError>;

impl MeterSrvError {
    pub fn device_not_found(msg: impl Into<String>) -> Self {
        MeterSrvError::DeviceNotFound(msg.into())
    }

    pub fn indicator(msg: impl Into<String>) -> Self {
        MeterSrvError::Indicator(msg.into())
    }
}

impl From<BusLockError> for MeterSrvError {
    fn from(err: BusLockError) -> Self {
        match err {
            BusLockError::BusTimeout { name, waited } => MeterSrvError::BusTimeout { name, waited },
            other => MeterSrvError::BusLock(other.to_string()),
        }
    }
}

impl From<FieldError> for MeterSrvError {
    fn from(err: FieldError) -> Self {
        match err {
            FieldError::Transport(e) => MeterSrvError::Transport(e),
            FieldError::Decode(e) => MeterSrvError::Decode(e),
        }
    }
}

impl ServiceErrorTrait for MeterSrvError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::DeviceNotFound(_) => "METERSRV_DEVICE_NOT_FOUND",
            Self::BusTimeout { .. } => "METERSRV_BUS_TIMEOUT",
            Self::BusLock(_) => "METERSRV_BUS_LOCK_ERROR",
            Self::Transport(_) => "METERSRV_TRANSPORT_ERROR",
            Self::Decode(_) => "METERSRV_DECODE_ERROR",
            Self::Storage(_) => "METERSRV_STORAGE_ERROR",
            Self::Configuration(_) => "METERSRV_CONFIG_ERROR",
            Self::Indicator(_) => "METERSRV_INDICATOR_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::DeviceNotFound(_) => ErrorCategory::Device,
            Self::BusTimeout { .. } => ErrorCategory::ResourceBusy,
            Self::BusLock(_) => ErrorCategory::Internal,
            Self::Transport(TransportError::Timeout(_)) => ErrorCategory::Timeout,
            Self::Transport(TransportError::Exception(_)) => ErrorCategory::Protocol,
            Self::Transport(_) => ErrorCategory::Transport,
            Self::Decode(_) => ErrorCategory::Decode,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Indicator(_) => ErrorCategory::Unknown,
        }
    }
}
