//! Engine configuration
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const MAX_REMINDER_DAY: u32 = 365;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base of the public signing portal, signing links are `{base_url}/sign/{token}`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Used when a document has no `expiration_days` setting
    #[serde(default = "default_expiration_days")]
    pub default_expiration_days: u32,

    /// Reminder milestones, in days after sending
    #[serde(default = "default_reminder_days")]
    pub default_reminder_days: Vec<u32>,

    /// Minimum gap between two reminders to the same recipient
    #[serde(default = "default_reminder_cooldown_hours")]
    pub reminder_cooldown_hours: u32,

    /// Upper bound handed to mailers, notifiers and anchoring services
    #[serde(default = "default_external_timeout_secs")]
    pub external_timeout_secs: u64,

    /// Shared secret the scheduler presents when triggering a sweep
    #[serde(default)]
    pub cron_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            default_expiration_days: default_expiration_days(),
            default_reminder_days: default_reminder_days(),
            reminder_cooldown_hours: default_reminder_cooldown_hours(),
            external_timeout_secs: default_external_timeout_secs(),
            cron_secret: None,
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_expiration_days() -> u32 {
    30
}
fn default_reminder_days() -> Vec<u32> {
    vec![1, 3, 7]
}
fn default_reminder_cooldown_hours() -> u32 {
    24
}
fn default_external_timeout_secs() -> u64 {
    10
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(raw).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_url.trim().is_empty() {
            anyhow::bail!("base_url must not be empty");
        }
        if self.default_expiration_days == 0 {
            anyhow::bail!("default_expiration_days must be at least 1");
        }
        if self
            .default_reminder_days
            .iter()
            .any(|d| *d == 0 || *d > MAX_REMINDER_DAY)
        {
            anyhow::bail!("default_reminder_days must each be between 1 and {MAX_REMINDER_DAY}");
        }
        if self.external_timeout_secs == 0 {
            anyhow::bail!("external_timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs)
    }

    pub fn signing_url(&self, token: &str) -> String {
        format!("{}/sign/{}", self.base_url.trim_end_matches('/'), token)
    }
}
