//! Configuration file management.
//!
//! One TOML file holds both the CLI settings (default device, aliases,
//! checkpoint directory) and the pool sections understood by
//! [`PoolConfig`]:
//!
//! ```toml
//! device = "basil"
//!
//! [aliases]
//! basil = "C4:7C:8D:6A:12:34"
//!
//! [connection]
//! max_attempts = 5
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flora_core::PoolConfig;
use serde::{Deserialize, Serialize};

/// Configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default device address or alias
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Directory for history checkpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Device aliases (friendly name -> device address)
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,

    /// Pool sections of the same file
    #[serde(skip)]
    pub pool: PoolConfig,
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("flora")
            .join("config.toml")
    }

    /// Parse the CLI keys and the pool sections of one document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.pool = PoolConfig::from_toml(content).context("Invalid pool configuration")?;
        Ok(config)
    }

    /// Load config from file, or return default if not found
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("In {}", path.display()))
    }

    /// Render the whole file.
    pub fn to_toml(&self) -> Result<String> {
        let mut content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str(&self.pool.to_toml()?);
        Ok(content)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Checkpoint directory: the flag, then the config, then the data directory.
    pub fn checkpoint_dir(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.checkpoint_dir.clone())
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("flora")
                    .join("checkpoints")
            })
    }
}

/// Resolve device from arg, env var, or config.
/// Also resolves aliases: if the device matches an alias name, returns the address.
pub fn resolve_device(device: Option<String>, config: &Config) -> Option<String> {
    device
        .or_else(|| config.device.clone())
        .map(|d| resolve_alias(&d, config))
}

/// Resolve an alias to its device address, or return the original if not an alias.
pub fn resolve_alias(device: &str, config: &Config) -> String {
    config
        .aliases
        .get(device)
        .cloned()
        .unwrap_or_else(|| device.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_alias() -> Config {
        let mut config = Config {
            device: Some("basil".to_string()),
            ..Default::default()
        };
        config
            .aliases
            .insert("basil".to_string(), "C4:7C:8D:6A:12:34".to_string());
        config
    }

    #[test]
    fn test_resolve_device_prefers_arg() {
        let result = resolve_device(Some("C4:7C:8D:6A:00:00".to_string()), &with_alias());
        assert_eq!(result.as_deref(), Some("C4:7C:8D:6A:00:00"));
    }

    #[test]
    fn test_resolve_device_falls_back_to_config_alias() {
        let result = resolve_device(None, &with_alias());
        assert_eq!(result.as_deref(), Some("C4:7C:8D:6A:12:34"));
    }

    #[test]
    fn test_resolve_device_none_when_both_empty() {
        assert_eq!(resolve_device(None, &Config::default()), None);
    }

    #[test]
    fn test_one_file_holds_cli_and_pool_sections() {
        let config = Config::from_toml(
            r#"
            device = "basil"

            [aliases]
            basil = "C4:7C:8D:6A:12:34"

            [connection]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.device.as_deref(), Some("basil"));
        assert_eq!(config.aliases.len(), 1);
        assert_eq!(config.pool.connection.max_attempts, 5);
    }

    #[test]
    fn test_invalid_pool_section_is_reported() {
        let err = Config::from_toml("[auth]\ndeadline_ms = 0\n").unwrap_err();
        assert!(format!("{:#}", err).contains("auth.deadline_ms"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flora").join("config.toml");
        assert!(Config::load(&path).unwrap().device.is_none());

        let mut config = with_alias();
        config.pool = PoolConfig::challenging_environment();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.device, config.device);
        assert_eq!(loaded.aliases, config.aliases);
        assert_eq!(loaded.pool, PoolConfig::challenging_environment());
    }

    #[test]
    fn test_checkpoint_dir_precedence() {
        let config = Config {
            checkpoint_dir: Some(PathBuf::from("/var/lib/flora")),
            ..Default::default()
        };
        assert_eq!(
            config.checkpoint_dir(Some(PathBuf::from("/tmp/ck"))),
            PathBuf::from("/tmp/ck")
        );
        assert_eq!(config.checkpoint_dir(None), PathBuf::from("/var/lib/flora"));
        assert!(
            Config::default()
                .checkpoint_dir(None)
                .ends_with("flora/checkpoints")
        );
    }
}
