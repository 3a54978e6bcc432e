//! Service bootstrap utilities
//!
//! Startup banner and logging initialization shared by metersrv binaries.

use crate::logging::{self, LogConfig, LoggingConfig};
use tracing::{info, Level};

/// Service metadata for startup
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Service name (e.g., "metersrv")
    pub name: String,
    /// Service version, usually the binary's CARGO_PKG_VERSION
    pub version: String,
    /// Service description
    pub description: String,
}

impl ServiceInfo {
    /// Create new service info
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }
}

/// Print the startup banner
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = match service.name.as_str() {
        "metersrv" => {
            r#"
 ███╗   ███╗███████╗████████╗███████╗██████╗ ███████╗██████╗ ██╗   ██╗
 ████╗ ████║██╔════╝╚══██╔══╝██╔════╝██╔══██╗██╔════╝██╔══██╗██║   ██║
 ██╔████╔██║█████╗     ██║   █████╗  ██████╔╝███████╗██████╔╝██║   ██║
 ██║╚██╔╝██║██╔══╝     ██║   ██╔══╝  ██╔══██╗╚════██║██╔══██╗╚██╗ ██╔╝
 ██║ ╚═╝ ██║███████╗   ██║   ███████╗██║  ██║███████║██║  ██║ ╚████╔╝
 ╚═╝     ╚═╝╚══════╝   ╚═╝   ╚══════╝╚═╝  ╚═╝╚══════╝╚═╝  ╚═╝  ╚═══╝
            "#
        },
        _ => "",
    };

    if !banner.is_empty() {
        info!("{}", banner);
    }
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!("");
}

/// Parse a configured level name, falling back to INFO
pub fn parse_level(level: &str) -> Level {
    level.trim().parse::<Level>().unwrap_or(Level::INFO)
}

/// Initialize logging for a service
///
/// Log root directory priority:
/// 1. METERSRV_LOG_DIR environment variable
/// 2. `logging_config.dir`
/// 3. Default "logs"
pub fn init_logging(
    service: &ServiceInfo,
    logging_config: &LoggingConfig,
    ansi: bool,
) -> anyhow::Result<()> {
    logging::init_log_root(logging_config.dir.as_deref());

    let log_config = LogConfig {
        service_name: service.name.clone(),
        log_dir: logging::get_log_root(),
        service_level: parse_level(&logging_config.level),
        enable_json: logging_config.json,
        ansi,
    };

    logging::init_with_config(log_config).map_err(|e| anyhow::anyhow!("{}", e))?;

    Ok(())
}
