//! Agent configuration
//!
//! Loaded from TOML. Every section is optional; missing values fall back to
//! the defaults below.
//!
//! ```toml
//! supported_events = ["dialog", "presence"]
//! domain = "example.com"
//!
//! [default_expires]
//! dialog = 3600
//! presence = 1800
//!
//! [store]
//! url = "redis://127.0.0.1:6379/"
//! purge_interval_secs = 60
//!
//! [dialog]
//! info_ttl_secs = 10800
//! channel = "dialog"
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{NotifyError, Result};
use crate::logging::{parse_log_level, LoggingConfig};

/// Top-level agent configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Event packages the agent accepts subscriptions for
    pub supported_events: Vec<String>,
    /// Default subscription lifetime per event type, in seconds
    pub default_expires: HashMap<String, u32>,
    /// Domain substituted for literal IP hosts when computing AORs
    pub domain: Option<String>,
    pub store: StoreConfig,
    pub dialog: DialogPackageConfig,
    pub logging: LoggingSection,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            supported_events: vec!["dialog".to_string()],
            default_expires: HashMap::new(),
            domain: None,
            store: StoreConfig::default(),
            dialog: DialogPackageConfig::default(),
            logging: LoggingSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    /// Interval of the sorted-index purge sweeper; 0 disables it
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            purge_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DialogPackageConfig {
    /// Hard cap on a dialog-info record's lifetime
    pub info_ttl_secs: u64,
    /// Publish channel carrying dialog state changes
    pub channel: String,
}

impl Default for DialogPackageConfig {
    fn default() -> Self {
        Self {
            info_ttl_secs: 3 * 60 * 60,
            channel: "dialog".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub json: bool,
    pub file_info: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
        }
    }
}

impl AgentConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| NotifyError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.supported_events.is_empty() {
            return Err(NotifyError::Config("supported_events must not be empty".into()));
        }
        if self.dialog.info_ttl_secs == 0 {
            return Err(NotifyError::Config("dialog.info_ttl_secs must be positive".into()));
        }
        if let Some((event, _)) = self.default_expires.iter().find(|(_, v)| **v == 0) {
            return Err(NotifyError::Config(format!(
                "default_expires.{} must be positive",
                event
            )));
        }
        parse_log_level(&self.logging.level)?;
        Ok(())
    }

    pub fn is_supported(&self, event_type: &str) -> bool {
        self.supported_events.iter().any(|e| e.eq_ignore_ascii_case(event_type))
    }

    pub fn default_expires_for(&self, event_type: &str) -> u32 {
        crate::util::default_expires(event_type, self)
    }

    /// Logging configuration derived from the `[logging]` section
    pub fn logging_config(&self) -> Result<LoggingConfig> {
        let mut config = LoggingConfig::new(parse_log_level(&self.logging.level)?, "notify-agent");
        config.json = self.logging.json;
        config.file_info = self.logging.file_info;
        Ok(config)
    }
}
