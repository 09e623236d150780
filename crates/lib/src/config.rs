//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.gamemaster/config.json`) and environment.
//! Every field has a default, so a missing file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Telegram bot settings.
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Pool size, poll interval and timeouts.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Telegram bot config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// Bot API base URL (default https://api.telegram.org).
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// getUpdates long-poll timeout in seconds.
    #[serde(default = "default_long_poll_timeout")]
    pub long_poll_timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_long_poll_timeout() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_api_base(),
            long_poll_timeout_secs: default_long_poll_timeout(),
        }
    }
}

/// Pool size and timing for the router, manager and sessions. Intervals and stop waits are in
/// milliseconds; the onboarding session timeout is in whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Number of instance slots.
    pub pool_capacity: usize,
    /// Bounded wait on every queue receive before the stop flag is rechecked.
    pub poll_interval_ms: u64,
    /// Bounded join wait after a stop request before a worker is terminated.
    pub stop_timeout_ms: u64,
    /// An item requeued more often than this is dropped.
    pub max_delivery_attempts: u32,
    /// Idle time after which an onboarding session ends.
    pub session_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 10,
            poll_interval_ms: 1000,
            stop_timeout_ms: 2000,
            max_delivery_attempts: 10,
            session_timeout_secs: 60,
        }
    }
}

impl RuntimeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Long enough for the manager to stop the master and every slot, each with a forced fallback.
    pub fn manager_stop_timeout(&self) -> Duration {
        let workers = self.pool_capacity as u32 + 1;
        self.stop_timeout() * workers + self.poll_interval() * 2
    }
}

/// Bot token for the Telegram platform. A non-blank TELEGRAM_BOT_TOKEN wins over `telegram.botToken`.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    fn non_blank(s: &str) -> Option<String> {
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_string())
    }
    let from_env = std::env::var("TELEGRAM_BOT_TOKEN").ok();
    from_env
        .as_deref()
        .and_then(non_blank)
        .or_else(|| config.telegram.bot_token.as_deref().and_then(non_blank))
}

/// `GAMEMASTER_CONFIG_PATH`, else `~/.gamemaster/config.json`, else `config.json` in the working directory.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("GAMEMASTER_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    match dirs::home_dir() {
        Some(home) => home.join(".gamemaster").join("config.json"),
        None => PathBuf::from("config.json"),
    }
}

/// Read the bot config from `path` (or [`default_config_path`]). A file that does not exist
/// means "all defaults"; one that exists but cannot be read or parsed is an error.
/// Returns the config together with the path it was resolved from.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("no gamemaster config at {}, running with defaults", path.display());
            return Ok((Config::default(), path));
        }
        Err(e) => {
            return Err(e).with_context(|| format!("cannot read gamemaster config {}", path.display()))
        }
    };
    let config: Config = serde_json::from_str(&raw)
        .with_context(|| format!("invalid gamemaster config {}", path.display()))?;
    log::debug!(
        "gamemaster config: pool of {} slots, poll every {} ms",
        config.runtime.pool_capacity,
        config.runtime.poll_interval_ms
    );
    Ok((config, path))
}
