use crate::config::{check_bind, Config, ConfigError, ConfigResult};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Loads, validates and persists the gateway configuration file
#[derive(Clone)]
pub struct ConfigManager {
    path: PathBuf,
    config: Arc<RwLock<Config>>,
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("path", &self.path)
            .finish()
    }
}

impl ConfigManager {
    /// Load the file at `path`, writing a default one if it does not exist
    pub async fn load(path: &Path) -> ConfigResult<Self> {
        let config = if path.exists() {
            info!("Loading config from {:?}", path);
            Self::read(path).await?
        } else {
            info!("Config file not found, creating default config at {:?}", path);
            let default_config = Config::default();
            write_json(path, &default_config).await?;
            default_config
        };

        Ok(Self {
            path: path.to_path_buf(),
            config: Arc::new(RwLock::new(config)),
        })
    }

    /// Load from `~/.canopy/config.json`
    pub async fn load_default() -> ConfigResult<Self> {
        let config_path = Self::default_config_path()?;
        Self::load(&config_path).await
    }

    pub fn default_config_path() -> ConfigResult<PathBuf> {
        crate::default_config_path()
            .ok_or_else(|| ConfigError::InvalidPath("Could not find home directory".to_string()))
    }

    /// Wrap an in-memory config without touching disk
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            path,
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Snapshot of the current config
    pub async fn get(&self) -> Config {
        self.config.read().await.clone()
    }

    pub async fn save(&self) -> ConfigResult<()> {
        self.save_to(&self.path).await?;
        info!("Config saved to {:?}", self.path);
        Ok(())
    }

    pub async fn save_to(&self, path: &Path) -> ConfigResult<()> {
        let config = self.config.read().await.clone();
        write_json(path, &config).await
    }

    /// Re-read the file, keeping the current config if the new one is invalid
    pub async fn reload(&self) -> ConfigResult<()> {
        if !self.path.exists() {
            return Err(ConfigError::InvalidPath(format!(
                "Config file not found: {:?}",
                self.path
            )));
        }

        let new_config = Self::read(&self.path).await?;
        *self.config.write().await = new_config;

        info!("Config reloaded from {:?}", self.path);
        Ok(())
    }

    /// Apply `f`, validate the result and persist it
    pub async fn update<F>(&self, f: F) -> ConfigResult<()>
    where
        F: FnOnce(&mut Config),
    {
        let mut updated = self.config.read().await.clone();
        f(&mut updated);
        Self::validate(&updated)?;
        *self.config.write().await = updated;
        self.save().await
    }

    /// Set one dotted key and persist it
    pub async fn set_value(&self, key: &str, value: &str) -> ConfigResult<()> {
        let mut updated = self.config.read().await.clone();
        updated.set_value(key, value)?;
        Self::validate(&updated)?;
        *self.config.write().await = updated;
        self.save().await
    }

    pub async fn get_value(&self, key: &str) -> Option<String> {
        self.config.read().await.get_value(key)
    }

    pub fn validate(config: &Config) -> ConfigResult<()> {
        check_bind("gateway.bind", &config.gateway.bind)?;
        if config.status.enabled {
            check_bind("status.bind", &config.status.bind)?;
        }

        if config.gateway.handshake_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "gateway.handshake_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if config.gateway.max_connections == 0 {
            return Err(ConfigError::Validation(
                "gateway.max_connections must be greater than 0".to_string(),
            ));
        }
        if config.gateway.max_sessions == 0 {
            return Err(ConfigError::Validation(
                "gateway.max_sessions must be greater than 0".to_string(),
            ));
        }
        if config.queue.max_queue_size == 0 {
            return Err(ConfigError::Validation(
                "queue.max_queue_size must be greater than 0".to_string(),
            ));
        }
        if config.session.max_inflight_per_session == 0 {
            return Err(ConfigError::Validation(
                "session.max_inflight_per_session must be greater than 0".to_string(),
            ));
        }
        if config.session.cleanup_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "session.cleanup_interval_secs must be greater than 0".to_string(),
            ));
        }
        if config.processor.pipeline_timeout_secs == 0 || config.processor.max_message_bytes == 0 {
            return Err(ConfigError::Validation(
                "processor limits must be greater than 0".to_string(),
            ));
        }

        let (warning, critical) = (config.queue.warning_ratio, config.queue.critical_ratio);
        for (name, ratio) in [("warning_ratio", warning), ("critical_ratio", critical)] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigError::Validation(format!(
                    "queue.{} must be in (0, 1], got {}",
                    name, ratio
                )));
            }
        }
        if warning >= critical {
            return Err(ConfigError::Validation(format!(
                "queue.warning_ratio ({}) must be below queue.critical_ratio ({})",
                warning, critical
            )));
        }

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(path: &Path) -> ConfigResult<Config> {
        let content = tokio::fs::read_to_string(path).await?;
        let content = Self::expand_env_vars(&content)?;
        let config: Config = serde_json::from_str(&content)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Expand `${VAR}` and `${VAR:-default}` from the environment
    fn expand_env_vars(content: &str) -> ConfigResult<String> {
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| ConfigError::Validation(format!("Bad expansion pattern: {}", e)))?;
        let mut result = content.to_string();

        for cap in re.captures_iter(content) {
            let full_match = &cap[0];
            let var_expr = &cap[1];

            let (var_name, default_value) = match var_expr.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (var_expr, None),
            };

            let replacement = match (std::env::var(var_name), default_value) {
                (Ok(val), _) => val,
                (Err(_), Some(default)) => default.to_string(),
                (Err(_), None) => return Err(ConfigError::EnvVarNotFound(var_name.to_string())),
            };

            result = result.replace(full_match, &replacement);
        }

        Ok(result)
    }
}

async fn write_json(path: &Path, config: &Config) -> ConfigResult<()> {
    let content = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}
