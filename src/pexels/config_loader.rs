use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

/// Environment variable that overrides the API key stored in `config.toml`.
pub const API_KEY_ENV: &str = "PEXELS_API_KEY";

const PLACEHOLDER_API_KEY: &str = "your_api_key_here";

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Failed to acquire lock: {0}")]
    LockError(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Config structs for config.toml
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Api {
    pub search_endpoint: String,
    pub api_key: String,
    pub user_agent: String,
    pub api_timeout_secs: u64,
    pub image_timeout_secs: u64,
    pub max_per_page: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Paths {
    pub output_directory: String,
    pub download_log: String,
    pub log_directory: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Limits {
    pub max_categories: usize,
    pub max_images_per_category: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Rate {
    pub rate_limit_backoff_secs: u64,
    pub item_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_to_file: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub api: Api,
    pub paths: Paths,
    pub limits: Limits,
    pub rate: Rate,
    pub logging: Logging,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: Api {
                search_endpoint: "https://api.pexels.com/v1/search".to_string(),
                api_key: PLACEHOLDER_API_KEY.to_string(),
                user_agent: format!("pexels_downloader/{}", env!("CARGO_PKG_VERSION")),
                api_timeout_secs: 10,
                image_timeout_secs: 30,
                max_per_page: 80,
            },
            paths: Paths {
                output_directory: ".".to_string(),
                download_log: "download_log.txt".to_string(),
                log_directory: "./logs".to_string(),
            },
            limits: Limits {
                max_categories: 10,
                max_images_per_category: 1000,
            },
            rate: Rate {
                rate_limit_backoff_secs: 60,
                item_delay_ms: 100,
            },
            logging: Logging {
                log_level: "info".to_string(),
                log_format: "line".to_string(),
                log_to_file: true,
            },
        }
    }
}

impl AppConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api.api_timeout_secs)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.api.image_timeout_secs)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_secs(self.rate.rate_limit_backoff_secs)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.rate.item_delay_ms)
    }

    /// Location of the append-only download log.
    /// Relative paths resolve against the working directory.
    pub fn download_log_path(&self) -> PathBuf {
        PathBuf::from(&self.paths.download_log)
    }

    pub fn output_directory(&self) -> PathBuf {
        PathBuf::from(&self.paths.output_directory)
    }
}

// Config manager to handle the configuration file
pub struct ConfigManager {
    app_config: Arc<RwLock<AppConfig>>,
    config_dir: PathBuf,
}

impl ConfigManager {
    // Create a new ConfigManager instance
    pub fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            info!("Creating config directory: {}", config_dir.display());
            fs::create_dir_all(&config_dir)?;
        }

        let mut app_config = Self::load_app_config(&config_dir)?;
        Self::apply_env_overrides(&mut app_config);

        let manager = Self {
            app_config: Arc::new(RwLock::new(app_config)),
            config_dir,
        };

        manager.create_default_config()?;

        Ok(manager)
    }

    // Load app config from config.toml
    fn load_app_config(config_dir: &Path) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join("config.toml");

        if !config_path.exists() {
            warn!("Config file not found: {}", config_path.display());
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                error!("Failed to parse config.toml: {}", e);
                info!("Backing up old config and creating new one with default values");

                let backup_path = config_path.with_extension("toml.backup");
                if let Err(backup_err) = fs::rename(&config_path, backup_path) {
                    warn!("Failed to backup old config: {}", backup_err);
                }

                let default_config = AppConfig::default();
                if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                    if let Err(write_err) = fs::write(&config_path, toml_string) {
                        error!("Failed to write new config file: {}", write_err);
                    } else {
                        info!("Created new config.toml with default values");
                    }
                }

                Ok(default_config)
            }
        }
    }

    fn apply_env_overrides(config: &mut AppConfig) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                config.api.api_key = key.trim().to_string();
            }
        }
    }

    // Get app config
    pub fn get_app_config(&self) -> ConfigResult<AppConfig> {
        self.app_config
            .read()
            .map_err(|e| ConfigError::LockError(e.to_string()))
            .map(|config| config.clone())
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    // Save app config to file
    pub fn save_app_config(&self, config: &AppConfig) -> ConfigResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(self.config_path(), toml_string)?;

        let mut app_config = self.app_config
            .write()
            .map_err(|e| ConfigError::LockError(e.to_string()))?;
        *app_config = config.clone();

        Ok(())
    }

    // Check if an API key is configured
    pub fn has_valid_api_key(&self) -> bool {
        match self.get_app_config() {
            Ok(config) => {
                let key = config.api.api_key.trim();
                !key.is_empty() && key != PLACEHOLDER_API_KEY
            }
            Err(_) => false,
        }
    }

    // Write config.toml with defaults if it doesn't exist
    pub fn create_default_config(&self) -> ConfigResult<()> {
        let config_path = self.config_path();
        if !config_path.exists() {
            let default_config = AppConfig::default();
            let toml_string = toml::to_string_pretty(&default_config)
                .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
            fs::write(&config_path, toml_string)?;
            info!("Created default config file: {}", config_path.display());
        }

        Ok(())
    }
}

// Helper function to create a ConfigManager instance
pub fn init_config(config_dir: impl AsRef<Path>) -> ConfigResult<ConfigManager> {
    ConfigManager::new(config_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_creates_default_config_file() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(dir.path()).unwrap();

        assert!(dir.path().join("config.toml").exists());
        let config = manager.get_app_config().unwrap();
        assert_eq!(config.api.max_per_page, 80);
        assert_eq!(config.limits.max_categories, 10);
        assert_eq!(config.limits.max_images_per_category, 1000);
        assert_eq!(config.rate_limit_backoff(), Duration::from_secs(60));
        assert_eq!(config.item_delay(), Duration::from_millis(100));
        assert_eq!(config.paths.download_log, "download_log.txt");
    }

    #[test]
    fn test_corrupted_config_is_backed_up() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("config.toml"), "this is = not [valid").unwrap();

        let manager = ConfigManager::new(dir.path()).unwrap();

        assert!(dir.path().join("config.toml.backup").exists());
        let config = manager.get_app_config().unwrap();
        assert_eq!(config.api.api_timeout_secs, 10);
    }

    #[test]
    fn test_save_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(dir.path()).unwrap();

        let mut config = manager.get_app_config().unwrap();
        config.rate.item_delay_ms = 250;
        config.api.api_key = "abc123".to_string();
        manager.save_app_config(&config).unwrap();

        let reloaded = ConfigManager::new(dir.path()).unwrap().get_app_config().unwrap();
        assert_eq!(reloaded.rate.item_delay_ms, 250);
        if std::env::var(API_KEY_ENV).is_err() {
            assert_eq!(reloaded.api.api_key, "abc123");
            assert!(manager.has_valid_api_key());
        }
    }

    #[test]
    fn test_placeholder_key_is_not_valid() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(dir.path()).unwrap();
        if std::env::var(API_KEY_ENV).is_err() {
            assert!(!manager.has_valid_api_key());
        }
    }
}
