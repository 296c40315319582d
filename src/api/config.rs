//! Runtime configuration.

use thiserror::Error;

use crate::stack::{StackId, MAX_STACK_DEPTH};
use crate::util::size::{mb, parse_bytes};

/// Environment variable read by [`AsanConfig::from_env`].
pub const OPTIONS_ENV_VAR: &str = "HEAPGUARD_OPTIONS";

/// Errors from parsing an options string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown option `{0}`")]
    UnknownKey(String),

    #[error("option `{key}` has invalid value `{value}`")]
    InvalidValue { key: String, value: String },

    #[error("option `{0}` is missing a value")]
    MissingValue(String),
}

/// Configuration for the detector runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsanConfig {
    /// Bytes of poisoned padding before each block (default: 32)
    pub left_redzone_size: usize,

    /// Bytes of poisoned padding after each block (default: 32)
    pub right_redzone_size: usize,

    /// Cap on bytes held in each heap's quarantine (default: 16 MB)
    pub quarantine_max_size: usize,

    /// Cap on blocks held in each heap's quarantine (default: 65536)
    pub quarantine_max_blocks: usize,

    /// Frames captured per stack
    pub max_stack_depth: usize,

    /// Stack identities suppressed from the start
    pub ignored_stack_ids: Vec<StackId>,

    /// Emit reports through the `log` facade
    pub log_reports: bool,
}

impl Default for AsanConfig {
    fn default() -> Self {
        Self {
            left_redzone_size: 32,
            right_redzone_size: 32,
            quarantine_max_size: mb(16),
            quarantine_max_blocks: 65536,
            max_stack_depth: MAX_STACK_DEPTH,
            ignored_stack_ids: Vec::new(),
            log_reports: true,
        }
    }
}

impl AsanConfig {
    /// Create a minimal config: tight redzones, small quarantine, shallow
    /// stacks.
    pub fn minimal() -> Self {
        Self {
            left_redzone_size: 8,
            right_redzone_size: 8,
            quarantine_max_size: mb(1),
            quarantine_max_blocks: 1024,
            max_stack_depth: 8,
            ..Self::default()
        }
    }

    /// Parse a `key=value` list separated by commas or whitespace, on top of
    /// the defaults.
    pub fn from_options(options: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for item in options
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|item| !item.is_empty())
        {
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| ConfigError::MissingValue(item.to_string()))?;
            config.apply(key.trim(), value.trim())?;
        }
        Ok(config)
    }

    /// Read [`OPTIONS_ENV_VAR`]; defaults when it is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(OPTIONS_ENV_VAR) {
            Ok(options) => Self::from_options(&options),
            Err(_) => Ok(Self::default()),
        }
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let bytes = || parse_bytes(value).ok_or_else(invalid);

        match key {
            "quarantine_size" => self.quarantine_max_size = bytes()?,
            "quarantine_blocks" => self.quarantine_max_blocks = value.parse().map_err(|_| invalid())?,
            "redzone" => {
                let size = bytes()?;
                self.left_redzone_size = size;
                self.right_redzone_size = size;
            }
            "left_redzone" => self.left_redzone_size = bytes()?,
            "right_redzone" => self.right_redzone_size = bytes()?,
            "max_stack_depth" => {
                let depth: usize = value.parse().map_err(|_| invalid())?;
                self.max_stack_depth = depth.min(MAX_STACK_DEPTH);
            }
            "ignored_stack_ids" => {
                for id in value.split(';').filter(|id| !id.trim().is_empty()) {
                    self.ignored_stack_ids
                        .push(StackId::parse(id).ok_or_else(invalid)?);
                }
            }
            "log_reports" => {
                self.log_reports = match value {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" => false,
                    _ => return Err(invalid()),
                }
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Builder pattern: set both redzones.
    pub fn with_redzones(mut self, left: usize, right: usize) -> Self {
        self.left_redzone_size = left;
        self.right_redzone_size = right;
        self
    }

    /// Builder pattern: set the quarantine byte cap.
    pub fn with_quarantine_max_size(mut self, size: usize) -> Self {
        self.quarantine_max_size = size;
        self
    }

    /// Builder pattern: set the quarantine block cap.
    pub fn with_quarantine_max_blocks(mut self, blocks: usize) -> Self {
        self.quarantine_max_blocks = blocks;
        self
    }

    /// Builder pattern: set the stack depth.
    pub fn with_max_stack_depth(mut self, depth: usize) -> Self {
        self.max_stack_depth = depth.min(MAX_STACK_DEPTH);
        self
    }

    /// Builder pattern: pre-load an ignored stack.
    pub fn with_ignored_stack_id(mut self, id: StackId) -> Self {
        self.ignored_stack_ids.push(id);
        self
    }

    /// Builder pattern: enable or disable report logging.
    pub fn with_log_reports(mut self, enable: bool) -> Self {
        self.log_reports = enable;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AsanConfig::default();
        assert_eq!(config.left_redzone_size, 32);
        assert_eq!(config.right_redzone_size, 32);
        assert_eq!(config.quarantine_max_size, 16 * 1024 * 1024);
        assert!(config.log_reports);
    }

    #[test]
    fn test_from_options() {
        let config = AsanConfig::from_options(
            "quarantine_size=1m, quarantine_blocks=10 redzone=64 right_redzone=16,\
             ignored_stack_ids=0x10;20,log_reports=false",
        )
        .unwrap();
        assert_eq!(config.quarantine_max_size, 1024 * 1024);
        assert_eq!(config.quarantine_max_blocks, 10);
        assert_eq!(config.left_redzone_size, 64);
        assert_eq!(config.right_redzone_size, 16);
        assert_eq!(
            config.ignored_stack_ids,
            vec![StackId::new(0x10), StackId::new(0x20)]
        );
        assert!(!config.log_reports);
    }

    #[test]
    fn test_from_options_errors() {
        assert_eq!(
            AsanConfig::from_options("bogus=1"),
            Err(ConfigError::UnknownKey("bogus".into()))
        );
        assert!(matches!(
            AsanConfig::from_options("redzone=lots"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(
            AsanConfig::from_options("redzone"),
            Err(ConfigError::MissingValue("redzone".into()))
        );
        assert_eq!(AsanConfig::from_options(""), Ok(AsanConfig::default()));
    }

    #[test]
    fn test_stack_depth_clamped() {
        let config = AsanConfig::from_options("max_stack_depth=1000").unwrap();
        assert_eq!(config.max_stack_depth, MAX_STACK_DEPTH);
    }
}
