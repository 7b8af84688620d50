//! Configuration
//!
//! Loads configuration from TOML file at `~/.config/portico/config.toml`.
//! Auto-generates a default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input: InputConfig,
    pub bridge: BridgeConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        Self::load_from_path(&config_path)
    }

    /// Load configuration from an explicit path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("portico");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let default_config = Self::default();
        let toml_string = toml::to_string_pretty(&default_config)
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string)
            .context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Input configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Maximum delay between presses of a double click (milliseconds)
    pub double_click_time_ms: u32,
    /// Maximum pointer travel between presses of a double click (pixels)
    pub double_click_distance: i32,
    /// Coalesce consecutive motion events for the same window
    pub compress_motion: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            double_click_time_ms: 400,
            double_click_distance: 5,
            compress_motion: true,
        }
    }
}

/// Poll bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Readiness event buffer capacity (descriptors per wait)
    pub fd_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { fd_capacity: 16 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.input.double_click_time_ms, 400);
        assert_eq!(config.input.double_click_distance, 5);
        assert!(config.input.compress_motion);
        assert_eq!(config.bridge.fd_capacity, 16);
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[input]\ndouble_click_time_ms = 250\ncompress_motion = false\n"
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.input.double_click_time_ms, 250);
        assert!(!config.input.compress_motion);
        // Unspecified fields keep their defaults.
        assert_eq!(config.input.double_click_distance, 5);
        assert_eq!(config.bridge.fd_capacity, 16);
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[input\nnot toml").unwrap();
        assert!(Config::load_from_path(file.path()).is_err());
    }
}
