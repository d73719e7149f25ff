//! Configuration loading: manager settings and per-bot config files.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Supervisor-wide configuration, resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory holding the SQLite database.
    pub data_dir: PathBuf,

    /// Directory containing one subdirectory per bot.
    pub bots_dir: PathBuf,

    /// Seconds to wait between stop and start during a restart.
    pub settle_delay_secs: u64,

    /// Monitor sweep periods.
    pub monitor: MonitorConfig,
}

/// Sweep periods for the health and crash monitor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Health sweep period in seconds.
    pub health_secs: u64,

    /// Health sweep period after a gateway error.
    pub health_backoff_secs: u64,

    /// Crash-detection sweep period in seconds.
    pub crash_secs: u64,

    /// Dead-container cleanup period in seconds.
    pub cleanup_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_secs: 30,
            health_backoff_secs: 60,
            crash_secs: 15,
            cleanup_secs: 300,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    pub fn load() -> Result<Self> {
        let data_dir = match std::env::var_os("BOTFLEET_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .map(|d| d.join("botfleet"))
                .unwrap_or_else(|| PathBuf::from("./data")),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        let bots_dir = std::env::var_os("BOTFLEET_BOTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./bots"));

        Ok(Self {
            data_dir,
            bots_dir,
            settle_delay_secs: 2,
            monitor: MonitorConfig::default(),
        })
    }

    /// Path to the SQLite database file.
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("botfleet.db")
    }

    /// Directory for a named bot.
    pub fn bot_dir(&self, bot: &str) -> PathBuf {
        self.bots_dir.join(bot)
    }
}

/// Per-bot configuration, loaded from `config.json` in the bot directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotConfig {
    /// Dockerfile name relative to the bot directory.
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,

    /// Environment file name relative to the bot directory.
    #[serde(default = "default_env_file")]
    pub env_file: String,

    /// Run the container with an unless-stopped restart policy.
    #[serde(default)]
    pub auto_restart: bool,

    /// Recover the bot through the crash-restart procedure on failure.
    #[serde(default = "default_true")]
    pub restart_on_crash: bool,

    /// Maximum restart attempts per crash episode.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between restart attempts, doubled per attempt.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,

    /// Webhook endpoint for state-change notifications.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Restart the bot when its git repository updates.
    #[serde(default)]
    pub git_auto_pull: bool,
}

fn default_dockerfile() -> String {
    "dockerfile".to_string()
}

fn default_env_file() -> String {
    "env".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    60
}

impl Default for BotConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty object deserializes with defaults")
    }
}

impl BotConfig {
    /// Load a bot's config file from its directory.
    ///
    /// `override_name` replaces the default `config.json` file name.
    pub fn load(bot_dir: &Path, override_name: Option<&str>) -> Result<Self> {
        let path = bot_dir.join(override_name.unwrap_or("config.json"));
        if !path.exists() {
            return Err(ConfigError::ConfigFileMissing {
                path: path.display().to_string(),
            }
            .into());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: BotConfig = serde_json::from_str(&raw).map_err(|error| ConfigError::Parse {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
        Ok(config)
    }
}

/// Parse a KEY=VALUE env file, skipping comments and blank lines.
///
/// Values keep their content verbatim apart from surrounding quotes.
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Err(ConfigError::EnvFileMissing {
            path: path.display().to_string(),
        }
        .into());
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut vars = HashMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            vars.insert(
                key.trim().to_string(),
                value.trim().trim_matches(['"', '\'']).to_string(),
            );
        }
    }
    Ok(vars)
}

/// Extract the bot's secret token from parsed env vars, if present.
pub fn extract_token(vars: &HashMap<String, String>) -> Option<&str> {
    vars.get("BOT_TOKEN").map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_config_defaults() {
        let config = BotConfig::default();
        assert_eq!(config.dockerfile, "dockerfile");
        assert_eq!(config.env_file, "env");
        assert!(!config.auto_restart);
        assert!(config.restart_on_crash);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_seconds, 60);
        assert!(config.webhook_url.is_none());
        assert!(!config.git_auto_pull);
    }

    #[test]
    fn bot_config_loads_partial_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"max_retries": 5, "webhook_url": "https://example.test/hook"}"#,
        )
        .expect("write config");

        let config = BotConfig::load(dir.path(), None).expect("config should load");
        assert_eq!(config.max_retries, 5);
        assert_eq!(
            config.webhook_url.as_deref(),
            Some("https://example.test/hook")
        );
        // Unspecified fields keep their defaults.
        assert!(config.restart_on_crash);
    }

    #[test]
    fn missing_config_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = BotConfig::load(dir.path(), None).expect_err("must fail");
        assert!(error.to_string().contains("config file not found"));
    }

    #[test]
    fn env_file_parsing_skips_comments_and_strips_quotes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("env");
        std::fs::write(
            &path,
            "# comment\nBOT_TOKEN=\"abc.def.ghi\"\n\nLOG_LEVEL=debug\nbroken line\n",
        )
        .expect("write env");

        let vars = load_env_file(&path).expect("env should parse");
        assert_eq!(vars.len(), 2);
        assert_eq!(extract_token(&vars), Some("abc.def.ghi"));
        assert_eq!(vars.get("LOG_LEVEL").map(String::as_str), Some("debug"));
    }
}
