//! # Configuration
//!
//! TOML configuration for the progression core and its developer CLI.
//!
//! ## Configuration Structure
//!
//! - [`StorageConfig`] - where the sled store and the point seed live
//! - [`LoggingConfig`] - log level and optional log file
//! - [`DiscoveryConfig`] - point radius default, fallback position, scan prefix
//! - [`SyncConfig`] - persistence queue depth
//! - [`PlayerConfig`] - starting values for a fresh player
//!
//! ## Usage
//!
//! ```rust,no_run
//! use grenzwanderer::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("grenzwanderer.toml").await?;
//!     let config = Config::load("grenzwanderer.toml").await?;
//!     println!("Data dir: {}", config.storage.data_dir);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [storage]
//! data_dir = "./data"
//!
//! [logging]
//! level = "info"
//!
//! [discovery]
//! default_radius_meters = 50.0
//! fallback_lat = 47.9959
//! fallback_lng = 7.8522
//! scan_prefix = "https://grenzwanderer.app/p/"
//! ```
//!
//! Every section except `[storage]` and `[logging]` may be omitted and falls back to
//! its defaults.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::progression::{Coordinates, EngineSettings};
use crate::validation::validate_coordinates;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub player: PlayerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    pub data_dir: String,
    /// JSON seed of map points for offline play; defaults to `<data_dir>/points.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points_file: Option<String>,
}

impl StorageConfig {
    pub fn db_path(&self) -> String {
        format!("{}/progression", self.data_dir)
    }

    pub fn points_path(&self) -> String {
        self.points_file
            .clone()
            .unwrap_or_else(|| format!("{}/points.json", self.data_dir))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    /// Radius used for points that carry none.
    #[serde(default = "default_radius_meters")]
    pub default_radius_meters: f64,
    /// Position used when the device cannot produce a fix.
    #[serde(default = "default_fallback_lat")]
    pub fallback_lat: f64,
    #[serde(default = "default_fallback_lng")]
    pub fallback_lng: f64,
    /// Deep-link prefix stripped from scanned codes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_prefix: Option<String>,
}

fn default_radius_meters() -> f64 {
    50.0
}

// Freiburg Münsterplatz
fn default_fallback_lat() -> f64 {
    47.9959
}

fn default_fallback_lng() -> f64 {
    7.8522
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            default_radius_meters: default_radius_meters(),
            fallback_lat: default_fallback_lat(),
            fallback_lng: default_fallback_lng(),
            scan_prefix: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn fallback_position(&self) -> Coordinates {
        Coordinates::new(self.fallback_lat, self.fallback_lng)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Writes the background persistence queue holds before callers wait.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_max_pending() -> usize {
    64
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerConfig {
    #[serde(default)]
    pub starting_credits: u64,
    #[serde(default)]
    pub starting_phase: u32,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.data_dir.trim().is_empty() {
            return Err(anyhow!("storage.data_dir must not be empty"));
        }
        let radius = self.discovery.default_radius_meters;
        if !radius.is_finite() || radius <= 0.0 {
            return Err(anyhow!(
                "discovery.default_radius_meters must be positive (got {})",
                radius
            ));
        }
        validate_coordinates(self.discovery.fallback_lat, self.discovery.fallback_lng)
            .map_err(|e| anyhow!("discovery fallback position: {}", e))?;
        if self.sync.max_pending == 0 {
            return Err(anyhow!("sync.max_pending must be at least 1"));
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            default_radius_meters: self.discovery.default_radius_meters,
            fallback_position: Some(self.discovery.fallback_position()),
            scan_prefix: self.discovery.scan_prefix.clone(),
            starting_credits: self.player.starting_credits,
            starting_phase: self.player.starting_phase,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig {
                data_dir: "./data".to_string(),
                points_file: None,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("grenzwanderer.log".to_string()),
            },
            discovery: DiscoveryConfig::default(),
            sync: SyncConfig::default(),
            player: PlayerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.points_path(), "./data/points.json");
    }

    #[test]
    fn test_optional_sections_default() {
        let toml_str = r#"
            [storage]
            data_dir = "/tmp/gw"

            [logging]
            level = "debug"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.discovery, DiscoveryConfig::default());
        assert_eq!(config.sync.max_pending, 64);
        assert_eq!(config.player.starting_credits, 0);
        assert_eq!(config.storage.db_path(), "/tmp/gw/progression");
    }

    #[test]
    fn test_rejects_non_positive_radius() {
        let mut config = Config::default();
        config.discovery.default_radius_meters = 0.0;
        assert!(config.validate().is_err());
        config.discovery.default_radius_meters = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_fallback() {
        let mut config = Config::default();
        config.discovery.fallback_lat = 123.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_engine_settings_follow_config() {
        let mut config = Config::default();
        config.discovery.scan_prefix = Some("gw://".to_string());
        config.player.starting_phase = 2;
        let settings = config.engine_settings();
        assert_eq!(settings.scan_prefix.as_deref(), Some("gw://"));
        assert_eq!(settings.starting_phase, 2);
        assert_eq!(settings.fallback_position, Some(Coordinates::new(47.9959, 7.8522)));
    }

    #[tokio::test]
    async fn test_create_default_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded, Config::default());
    }
}
