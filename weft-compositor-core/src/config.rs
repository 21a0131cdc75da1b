//! Engine configuration.
//!
//! Settings are read from a TOML table. Every key is optional; missing keys
//! take the defaults below.
//!
//! ```toml
//! fence_locking = true
//! stall_warning_ms = 1000
//! stall_check_interval_ms = 500
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Hold back buffers until their DMA-BUF implicit fences signal.
    pub fence_locking: bool,
    /// Age after which a pending transaction is reported as stalled.
    /// `None` turns stall reporting off.
    pub stall_warning_ms: Option<u64>,
    /// How often the event-loop watchdog checks for stalls.
    pub stall_check_interval_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            fence_locking: true,
            stall_warning_ms: Some(1000),
            stall_check_interval_ms: 500,
        }
    }
}

impl TransactionConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TransactionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!("Loaded transaction configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stall_check_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "stall_check_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.stall_warning_ms == Some(0) {
            return Err(ConfigError::Validation(
                "stall_warning_ms must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stall_warning(&self) -> Option<Duration> {
        self.stall_warning_ms.map(Duration::from_millis)
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_millis(self.stall_check_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_for_empty_document() {
        let config = TransactionConfig::from_toml_str("").unwrap();
        assert_eq!(config, TransactionConfig::default());
        assert_eq!(config.stall_warning(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_partial_document() {
        let config = TransactionConfig::from_toml_str("fence_locking = false\n").unwrap();
        assert!(!config.fence_locking);
        assert_eq!(config.stall_check_interval_ms, 500);
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let result = TransactionConfig::from_toml_str("stall_check_interval_ms = 0\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
        let result = TransactionConfig::from_toml_str("stall_warning_ms = 0\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_parse_error() {
        let result = TransactionConfig::from_toml_str("fence_locking = \"yes\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "stall_warning_ms = 250").unwrap();
        writeln!(file, "stall_check_interval_ms = 100").unwrap();

        let config = TransactionConfig::load(file.path()).unwrap();
        assert_eq!(config.stall_warning(), Some(Duration::from_millis(250)));
        assert_eq!(config.stall_check_interval(), Duration::from_millis(100));
        assert!(config.fence_locking);

        assert!(matches!(
            TransactionConfig::load(file.path().with_extension("missing")),
            Err(ConfigError::Io(_))
        ));
    }
}
