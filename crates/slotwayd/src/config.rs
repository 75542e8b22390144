//! slotway.toml configuration.
//!
//! Every field has a default, so an absent file or section yields a working
//! configuration. Command-line flags override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use slotway_rollout::RolloutSettings;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotwayConfig {
    pub server: ServerConfig,
    pub router: RouterConfig,
    pub metrics: MetricsConfig,
    pub rollout: RolloutConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8470,
            data_dir: PathBuf::from("/var/lib/slotway"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// How long a session stays pinned to its slot.
    pub sticky_ttl_secs: u64,
    /// How long a deployment's slot list is served from memory.
    pub slot_cache_ttl_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            sticky_ttl_secs: 300,
            slot_cache_ttl_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub flush_interval_secs: u64,
    pub retention_days: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 10,
            retention_days: 30,
            cleanup_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub timeout_secs: u64,
    pub backend_url_template: String,
    pub frontend_url_template: String,
    /// How long a finished attempt and its events stay queryable.
    pub attempt_retention_secs: u64,
    /// Upper bound on finished attempts held in memory.
    pub max_finished_attempts: usize,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        let settings = RolloutSettings::default();
        Self {
            timeout_secs: settings.timeout.as_secs(),
            backend_url_template: settings.backend_url_template,
            frontend_url_template: settings.frontend_url_template,
            attempt_retention_secs: 86_400,
            max_finished_attempts: slotway_rollout::DEFAULT_MAX_FINISHED,
        }
    }
}

impl RolloutConfig {
    pub fn settings(&self) -> RolloutSettings {
        RolloutSettings {
            timeout: Duration::from_secs(self.timeout_secs),
            backend_url_template: self.backend_url_template.clone(),
            frontend_url_template: self.frontend_url_template.clone(),
        }
    }
}

impl SlotwayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: SlotwayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path` if given, otherwise use the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path)
                .map_err(|e| anyhow::anyhow!("config {}: {e:#}", path.display())),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.metrics.flush_interval_secs == 0 {
            anyhow::bail!("metrics.flush_interval_secs must be positive");
        }
        if self.metrics.cleanup_interval_secs == 0 {
            anyhow::bail!("metrics.cleanup_interval_secs must be positive");
        }
        if self.rollout.timeout_secs == 0 {
            anyhow::bail!("rollout.timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = SlotwayConfig::from_toml("").unwrap();
        assert_eq!(config, SlotwayConfig::default());
        assert_eq!(config.server.port, 8470);
        assert_eq!(config.router.sticky_ttl_secs, 300);
        assert_eq!(config.metrics.retention_days, 30);
        assert_eq!(config.rollout.timeout_secs, 1800);
        assert_eq!(config.rollout.attempt_retention_secs, 86_400);
        assert_eq!(config.rollout.max_finished_attempts, 256);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = SlotwayConfig::from_toml(
            r#"
            [server]
            port = 9000

            [rollout]
            backend_url_template = "http://{slot}.{deployment}.svc:8080"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.data_dir, PathBuf::from("/var/lib/slotway"));
        assert_eq!(config.rollout.timeout_secs, 1800);

        let settings = config.rollout.settings();
        assert_eq!(
            slotway_rollout::render_url(&settings.backend_url_template, "cart", "blue"),
            "http://blue.cart.svc:8080"
        );
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(SlotwayConfig::from_toml("[metrics]\nflush_interval_secs = 0").is_err());
        assert!(SlotwayConfig::from_toml("[rollout]\ntimeout_secs = 0").is_err());
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = SlotwayConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(SlotwayConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = SlotwayConfig::load(Some(Path::new("/nonexistent/slotway.toml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/slotway.toml"));
    }
}
