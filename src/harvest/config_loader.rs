use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::harvest::download_engine::{ConnectionPoolConfig, DownloadEngineConfig};
use crate::harvest::queue::DEFAULT_QUEUE_CAPACITY;
use crate::harvest::scheduler::SchedulerConfig;

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Something that happened while loading the configuration. Loading runs
/// before the logger exists, so these are held and logged afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigNotice {
    CreatedDirectory(PathBuf),
    MissingFile(PathBuf),
    CreatedFile(PathBuf),
    /// An unparseable config file was replaced with defaults.
    ReplacedBroken {
        path: PathBuf,
        reason: String,
        /// Where the old file went, or why it could not be moved there.
        backup: Result<PathBuf, String>,
    },
}

impl ConfigNotice {
    pub fn log(&self) {
        match self {
            ConfigNotice::CreatedDirectory(dir) => {
                info!("Created config directory: {}", dir.display())
            }
            ConfigNotice::MissingFile(path) => warn!("Config file not found: {}", path.display()),
            ConfigNotice::CreatedFile(path) => info!("Created {}", path.display()),
            ConfigNotice::ReplacedBroken { path, reason, backup } => {
                error!("Failed to parse {}: {}", path.display(), reason);
                match backup {
                    Ok(backup) => info!(
                        "Backed up old config to {} and wrote defaults",
                        backup.display()
                    ),
                    Err(e) => warn!("Failed to backup old config: {}", e),
                }
            }
        }
    }
}

const APP_CONFIG_FILE: &str = "config.toml";
const ACCOUNTS_CONFIG_FILE: &str = "accounts.toml";

// Config structs for config.toml
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Paths {
    pub download_directory: String,
    pub log_directory: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Pools {
    pub download_workers: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Rate {
    pub max_page_jitter_secs: u64,
    pub account_delay_secs: u64,
    pub cycle_delay_secs: u64,
    pub max_download_jitter_secs: u64,
    pub retry_attempts: usize,
    pub retry_backoff_ms: u64,
    pub fetch_timeout_secs: u64,
    pub identity_policy: String, // "random" or "round_robin"
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_to_file: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Status {
    pub enabled: bool,
    pub refresh_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub paths: Paths,
    pub pools: Pools,
    pub rate: Rate,
    pub logging: Logging,
    pub status: Status,
}

// Default implementation for AppConfig
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: Paths {
                download_directory: "./downloads".to_string(),
                log_directory: "./logs".to_string(),
            },
            pools: Pools {
                download_workers: 5,
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
            },
            rate: Rate {
                max_page_jitter_secs: 3,
                account_delay_secs: 1,
                cycle_delay_secs: 300,
                max_download_jitter_secs: 60,
                retry_attempts: 3,
                retry_backoff_ms: 1000,
                fetch_timeout_secs: 60,
                identity_policy: "random".to_string(),
            },
            logging: Logging {
                log_level: "info".to_string(),
                log_format: "text".to_string(),
                log_to_file: true,
            },
            status: Status {
                enabled: true,
                refresh_interval_ms: 50,
            },
        }
    }
}

impl AppConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.pools.download_workers == 0 {
            return Err(ConfigError::Invalid("pools.download_workers must be at least 1".to_string()));
        }
        if self.pools.queue_capacity == 0 {
            return Err(ConfigError::Invalid("pools.queue_capacity must be at least 1".to_string()));
        }
        if self.rate.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid("rate.fetch_timeout_secs must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_page_jitter: Duration::from_secs(self.rate.max_page_jitter_secs),
            account_delay: Duration::from_secs(self.rate.account_delay_secs),
            cycle_delay: Duration::from_secs(self.rate.cycle_delay_secs),
        }
    }

    pub fn download_engine_config(&self, user_agent: &str) -> DownloadEngineConfig {
        let workers = self.pools.download_workers;
        DownloadEngineConfig {
            workers,
            retry_attempts: self.rate.retry_attempts,
            base_retry_delay_ms: self.rate.retry_backoff_ms,
            max_jitter: Duration::from_secs(self.rate.max_download_jitter_secs),
            download_dir: PathBuf::from(&self.paths.download_directory),
            user_agent: user_agent.to_string(),
            timeout_seconds: self.rate.fetch_timeout_secs,
            connection_pool: ConnectionPoolConfig {
                max_idle_per_host: std::cmp::max(workers, 10),
                ..ConnectionPoolConfig::default()
            },
        }
    }
}

// Config structs for accounts.toml
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn is_placeholder(&self) -> bool {
        self.username.is_empty()
            || self.password.is_empty()
            || self.username == "your_username"
            || self.password == "your_password"
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Api {
    pub base_url: String,
    pub user_agent: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AccountsConfig {
    pub api: Api,
    pub primary: Credentials,
    #[serde(default)]
    pub alternates: Vec<Credentials>,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            api: Api {
                base_url: "https://api.example.com/v1".to_string(),
                user_agent: format!("story_harvester/{}", env!("CARGO_PKG_VERSION")),
            },
            primary: Credentials {
                username: "your_username".to_string(),
                password: "your_password".to_string(),
            },
            alternates: vec![Credentials {
                username: "your_username".to_string(),
                password: "your_password".to_string(),
            }],
        }
    }
}

// Config manager to handle all configuration files
#[derive(Debug, Clone)]
pub struct ConfigManager {
    app_config: AppConfig,
    accounts_config: AccountsConfig,
    config_dir: PathBuf,
    notices: Vec<ConfigNotice>,
}

impl ConfigManager {
    // Create a new ConfigManager instance
    pub fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();
        let mut notices = Vec::new();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)?;
            notices.push(ConfigNotice::CreatedDirectory(config_dir.clone()));
        }

        let mut manager = Self {
            app_config: Self::load_app_config(&config_dir, &mut notices)?,
            accounts_config: Self::load_accounts_config(&config_dir, &mut notices)?,
            config_dir,
            notices,
        };

        manager.create_default_configs()?;
        manager.app_config.validate()?;

        Ok(manager)
    }

    // Load app config from config.toml
    fn load_app_config(config_dir: &Path, notices: &mut Vec<ConfigNotice>) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join(APP_CONFIG_FILE);

        if !config_path.exists() {
            notices.push(ConfigNotice::MissingFile(config_path));
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                let backup_path = config_path.with_extension("toml.backup");
                let backup = fs::rename(&config_path, &backup_path)
                    .map(|()| backup_path)
                    .map_err(|backup_err| backup_err.to_string());

                let default_config = AppConfig::default();
                Self::write_toml(&config_path, &default_config)?;
                notices.push(ConfigNotice::ReplacedBroken {
                    path: config_path,
                    reason: e.to_string(),
                    backup,
                });
                Ok(default_config)
            }
        }
    }

    // Load account credentials from accounts.toml
    fn load_accounts_config(
        config_dir: &Path,
        notices: &mut Vec<ConfigNotice>,
    ) -> ConfigResult<AccountsConfig> {
        let config_path = config_dir.join(ACCOUNTS_CONFIG_FILE);

        if !config_path.exists() {
            notices.push(ConfigNotice::MissingFile(config_path));
            return Ok(AccountsConfig::default());
        }

        // Credentials are never replaced silently; a broken file is an error.
        let content = fs::read_to_string(&config_path)?;
        Ok(toml::from_str(&content)?)
    }

    fn write_toml<T: Serialize>(path: &Path, value: &T) -> ConfigResult<()> {
        let toml_string = toml::to_string_pretty(value)
            .map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        fs::write(path, toml_string)?;
        Ok(())
    }

    // Create all default config files if they don't exist
    pub fn create_default_configs(&mut self) -> ConfigResult<()> {
        let config_path = self.config_dir.join(APP_CONFIG_FILE);
        if !config_path.exists() {
            Self::write_toml(&config_path, &self.app_config)?;
            self.notices.push(ConfigNotice::CreatedFile(config_path));
        }

        let accounts_path = self.config_dir.join(ACCOUNTS_CONFIG_FILE);
        if !accounts_path.exists() {
            Self::write_toml(&accounts_path, &self.accounts_config)?;
            self.notices.push(ConfigNotice::CreatedFile(accounts_path));
        }

        Ok(())
    }

    /// Events from loading, in order, for logging once the logger is up
    pub fn notices(&self) -> &[ConfigNotice] {
        &self.notices
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    // Get app config
    pub fn app_config(&self) -> &AppConfig {
        &self.app_config
    }

    // Get account credentials
    pub fn accounts_config(&self) -> &AccountsConfig {
        &self.accounts_config
    }

    // Check if the primary credentials have been filled in
    pub fn has_valid_credentials(&self) -> bool {
        !self.accounts_config.primary.is_placeholder()
    }
}

// Helper function to create a ConfigManager instance
pub fn init_config(config_dir: impl AsRef<Path>) -> ConfigResult<ConfigManager> {
    ConfigManager::new(config_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_default_files() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path()).unwrap();

        assert!(dir.path().join(APP_CONFIG_FILE).exists());
        assert!(dir.path().join(ACCOUNTS_CONFIG_FILE).exists());
        assert_eq!(manager.app_config().pools.queue_capacity, 100_000);
        assert!(!manager.has_valid_credentials());
    }

    #[test]
    fn reads_existing_files() {
        let dir = TempDir::new().unwrap();
        let mut app = AppConfig::default();
        app.pools.download_workers = 9;
        app.rate.cycle_delay_secs = 42;
        ConfigManager::write_toml(&dir.path().join(APP_CONFIG_FILE), &app).unwrap();
        fs::write(
            dir.path().join(ACCOUNTS_CONFIG_FILE),
            r#"
[api]
base_url = "http://localhost:9000"
user_agent = "test"

[primary]
username = "main"
password = "secret"

[[alternates]]
username = "alt"
password = "secret2"
"#,
        )
        .unwrap();

        let manager = ConfigManager::new(dir.path()).unwrap();
        assert_eq!(manager.app_config().pools.download_workers, 9);
        assert_eq!(manager.app_config().scheduler_config().cycle_delay, Duration::from_secs(42));
        assert!(manager.has_valid_credentials());
        assert_eq!(manager.accounts_config().alternates.len(), 1);
        assert_eq!(manager.accounts_config().alternates[0].username, "alt");
    }

    #[test]
    fn broken_app_config_is_backed_up_and_replaced() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(APP_CONFIG_FILE), "this is = = not toml").unwrap();

        let manager = ConfigManager::new(dir.path()).unwrap();
        assert_eq!(manager.app_config().pools.download_workers, 5);
        assert!(dir.path().join("config.toml.backup").exists());
        let rewritten = fs::read_to_string(dir.path().join(APP_CONFIG_FILE)).unwrap();
        assert!(toml::from_str::<AppConfig>(&rewritten).is_ok());

        match &manager.notices()[0] {
            ConfigNotice::ReplacedBroken { path, reason, backup } => {
                assert_eq!(path, &dir.path().join(APP_CONFIG_FILE));
                assert!(!reason.is_empty());
                assert_eq!(backup, &Ok(dir.path().join("config.toml.backup")));
            }
            other => panic!("expected a replaced-config notice, got {:?}", other),
        }
    }

    #[test]
    fn first_run_records_what_was_created() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("fresh");
        let manager = ConfigManager::new(&config_dir).unwrap();

        assert_eq!(manager.notices(), &[
            ConfigNotice::CreatedDirectory(config_dir.clone()),
            ConfigNotice::MissingFile(config_dir.join(APP_CONFIG_FILE)),
            ConfigNotice::MissingFile(config_dir.join(ACCOUNTS_CONFIG_FILE)),
            ConfigNotice::CreatedFile(config_dir.join(APP_CONFIG_FILE)),
            ConfigNotice::CreatedFile(config_dir.join(ACCOUNTS_CONFIG_FILE)),
        ]);
    }

    #[test]
    fn broken_accounts_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(ACCOUNTS_CONFIG_FILE), "[primary\n").unwrap();
        assert!(matches!(ConfigManager::new(dir.path()), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut app = AppConfig::default();
        app.pools.download_workers = 0;
        assert!(matches!(app.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn engine_config_mirrors_app_config() {
        let app = AppConfig::default();
        let engine = app.download_engine_config("ua");
        assert_eq!(engine.workers, 5);
        assert_eq!(engine.max_jitter, Duration::from_secs(60));
        assert_eq!(engine.timeout_seconds, 60);
        assert_eq!(engine.user_agent, "ua");
        assert_eq!(engine.download_dir, PathBuf::from("./downloads"));
    }
}
