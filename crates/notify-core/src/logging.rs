use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{NotifyError, Result};

/// Settings for the global tracing subscriber
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// One JSON object per line instead of human-readable output
    pub json: bool,
    /// Include source file and line in each record
    pub file_info: bool,
    /// Name announced in the startup record
    pub app_name: String,
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            json: false,
            file_info: false,
            app_name: app_name.into(),
        }
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` directives are honoured on top of the configured level. Fails
/// with a config error if a global subscriber is already installed.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| NotifyError::Config(format!("logging already initialised: {}", e)))?;
    tracing::info!("Starting {} v{}", config.app_name, crate::VERSION);
    Ok(())
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| NotifyError::Config(format!("Invalid log level: {}", level)))
}
