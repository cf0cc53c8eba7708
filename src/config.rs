use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Loaded from `promo-control.toml`, overridable by uppercase-snake-case
/// environment variables, validated at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub active_slots: usize,
    pub rotation_interval_secs: u64,
    pub min_rotation_interval_secs: u64,
    pub max_rotation_interval_secs: u64,
    pub rotation_jitter_percentage: f64,
    pub health_check_interval_secs: u64,
    pub connection_timeout_secs: u64,
    pub disconnect_timeout_secs: u64,
    pub promotion_interval_secs: u64,
    pub message_check_delay_secs: u64,
    pub max_queue_size: usize,
    pub max_results_size: usize,
    pub auto_save_interval_secs: u64,
    pub max_concurrent_connections: usize,
    pub max_rotation_history: usize,
    pub state_dir: PathBuf,
    #[serde(default)]
    pub notifier_webhook_url: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            active_slots: 4,
            rotation_interval_secs: 4 * 3600,
            min_rotation_interval_secs: 3 * 3600,
            max_rotation_interval_secs: 6 * 3600,
            rotation_jitter_percentage: 0.30,
            health_check_interval_secs: 5 * 60,
            connection_timeout_secs: 30,
            disconnect_timeout_secs: 5,
            promotion_interval_secs: 5,
            message_check_delay_secs: 10,
            max_queue_size: 1000,
            max_results_size: 5000,
            auto_save_interval_secs: 5 * 60,
            max_concurrent_connections: 100,
            max_rotation_history: 50,
            state_dir: PathBuf::from("./state"),
            notifier_webhook_url: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file_path();

        let mut config = if config_file.exists() {
            info!("loading configuration from: {}", config_file.display());
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("failed to read config file: {}", config_file.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", config_file.display()))?
        } else {
            warn!("config file not found, writing defaults to {}", config_file.display());
            let default_config = Self::default();
            default_config.save(&config_file)?;
            default_config
        };

        config.load_from_env()?;
        config.validate()?;

        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        }

        let mut content = String::new();
        content.push_str("# promo-control configuration\n");
        content.push_str("# every field below may be overridden by an uppercase-snake-case\n");
        content.push_str("# environment variable, e.g. ACTIVE_SLOTS=6\n\n");
        content.push_str(&toml::to_string_pretty(self).context("failed to serialize configuration")?);

        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        info!("configuration saved to: {}", path.display());
        Ok(())
    }

    fn load_from_env(&mut self) -> Result<()> {
        macro_rules! env_usize {
            ($field:ident, $key:literal) => {
                if let Ok(v) = std::env::var($key) {
                    self.$field = v.parse().with_context(|| format!("invalid {}", $key))?;
                }
            };
        }
        macro_rules! env_u64 {
            ($field:ident, $key:literal) => {
                if let Ok(v) = std::env::var($key) {
                    self.$field = v.parse().with_context(|| format!("invalid {}", $key))?;
                }
            };
        }

        env_usize!(active_slots, "ACTIVE_SLOTS");
        env_u64!(rotation_interval_secs, "ROTATION_INTERVAL_SECS");
        env_u64!(min_rotation_interval_secs, "MIN_ROTATION_INTERVAL_SECS");
        env_u64!(max_rotation_interval_secs, "MAX_ROTATION_INTERVAL_SECS");
        env_u64!(health_check_interval_secs, "HEALTH_CHECK_INTERVAL_SECS");
        env_u64!(connection_timeout_secs, "CONNECTION_TIMEOUT_SECS");
        env_u64!(disconnect_timeout_secs, "DISCONNECT_TIMEOUT_SECS");
        env_u64!(promotion_interval_secs, "PROMOTION_INTERVAL_SECS");
        env_u64!(message_check_delay_secs, "MESSAGE_CHECK_DELAY_SECS");
        env_usize!(max_queue_size, "MAX_QUEUE_SIZE");
        env_usize!(max_results_size, "MAX_RESULTS_SIZE");
        env_u64!(auto_save_interval_secs, "AUTO_SAVE_INTERVAL_SECS");
        env_usize!(max_concurrent_connections, "MAX_CONCURRENT_CONNECTIONS");
        env_usize!(max_rotation_history, "MAX_ROTATION_HISTORY");

        if let Ok(v) = std::env::var("ROTATION_JITTER_PERCENTAGE") {
            self.rotation_jitter_percentage = v.parse().context("invalid ROTATION_JITTER_PERCENTAGE")?;
        }
        if let Ok(v) = std::env::var("STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NOTIFIER_WEBHOOK_URL") {
            if !v.is_empty() {
                self.notifier_webhook_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.log_level = v;
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.active_slots == 0 {
            anyhow::bail!("active_slots must be greater than zero");
        }
        if self.min_rotation_interval_secs > self.max_rotation_interval_secs {
            anyhow::bail!("min_rotation_interval_secs must not exceed max_rotation_interval_secs");
        }
        if !(0.0..=1.0).contains(&self.rotation_jitter_percentage) {
            anyhow::bail!("rotation_jitter_percentage must be within [0.0, 1.0]");
        }
        if self.max_queue_size == 0 {
            anyhow::bail!("max_queue_size must be greater than zero");
        }
        if self.max_concurrent_connections == 0 {
            anyhow::bail!("max_concurrent_connections must be greater than zero");
        }
        std::fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("state_dir is not creatable: {}", self.state_dir.display()))?;
        Ok(())
    }

    fn config_file_path() -> PathBuf {
        std::env::var("PROMO_CONTROL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("promo-control.toml"))
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }
    pub fn min_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.min_rotation_interval_secs)
    }
    pub fn max_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.max_rotation_interval_secs)
    }
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }
    pub fn promotion_interval(&self) -> Duration {
        Duration::from_secs(self.promotion_interval_secs)
    }
    pub fn message_check_delay(&self) -> Duration {
        Duration::from_secs(self.message_check_delay_secs)
    }
    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_secs(self.auto_save_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.active_slots, 4);
        assert_eq!(config.promotion_interval_secs, 5);
        assert_eq!(config.message_check_delay_secs, 10);
    }

    #[test]
    fn rejects_zero_active_slots() {
        let mut config = Config::default();
        config.active_slots = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_rotation_bounds() {
        let mut config = Config::default();
        config.min_rotation_interval_secs = config.max_rotation_interval_secs + 1;
        assert!(config.validate().is_err());
    }
}
