//! Shared error classification for metersrv services
//!
//! Each service keeps its own domain error enum and gains a common
//! interface (codes, categories, retry and exit policy) by implementing
//! [`ServiceErrorTrait`].

use tracing::Level;

// ============================================================================
// Error categories
// ============================================================================

/// Error category enum - used for classification and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    // Infrastructure layer
    Configuration,
    Storage,
    Timeout,

    // Field bus layer
    Device,
    Protocol,
    Transport,
    ResourceBusy,

    // Data layer
    Decode,

    // System level
    Internal,

    // Others
    Unknown,
}

impl ErrorCategory {
    /// Stable lowercase name for structured log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Storage => "storage",
            Self::Timeout => "timeout",
            Self::Device => "device",
            Self::Protocol => "protocol",
            Self::Transport => "transport",
            Self::ResourceBusy => "resource_busy",
            Self::Decode => "decode",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Service error trait
// ============================================================================

/// Error capability trait shared by service error types
///
/// Defaults are category based so that a service only has to name its
/// codes and categories; services override individual methods when a
/// variant needs special treatment.
pub trait ServiceErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Get error code (for logs and monitoring)
    fn error_code(&self) -> &'static str;

    /// Get error category
    fn category(&self) -> ErrorCategory;

    /// Whether a later attempt can succeed without operator action
    fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Timeout
                | ErrorCategory::ResourceBusy
                | ErrorCategory::Transport
                | ErrorCategory::Protocol
        )
    }

    /// Whether the error must stop the service
    fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Configuration
                | ErrorCategory::Device
                | ErrorCategory::Storage
                | ErrorCategory::Internal
        )
    }

    /// Process exit code used when the error ends the service
    fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Configuration => 2,
            ErrorCategory::Device => 3,
            ErrorCategory::Storage => 4,
            _ => 1,
        }
    }

    /// Get log level
    fn log_level(&self) -> Level {
        if self.is_fatal() {
            Level::ERROR
        } else {
            Level::WARN
        }
    }
}

/// Log `err` at its own [`ServiceErrorTrait::log_level`]
pub fn log_service_error<E: ServiceErrorTrait + ?Sized>(context: &str, err: &E) {
    let code = err.error_code();
    let category = err.category().as_str();
    let retryable = err.is_retryable();
    match err.log_level() {
        Level::ERROR => tracing::error!(code, category, retryable, "{}: {}", context, err),
        Level::WARN => tracing::warn!(code, category, retryable, "{}: {}", context, err),
        Level::INFO => tracing::info!(code, category, retryable, "{}: {}", context, err),
        _ => tracing::debug!(code, category, retryable, "{}: {}", context, err),
    }
}
