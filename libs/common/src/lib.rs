//! Basic library shared by metersrv services
//!
//! - logging bootstrap
//! - startup banner
//! - graceful shutdown signal

pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use logging::LoggingConfig;
pub use service_bootstrap::ServiceInfo;
pub use shutdown::{wait_for_shutdown, ShutdownSignal};

// Re-export common dependencies
pub use anyhow;
pub use tokio;
