use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub rounds: RoundConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_server_version")]
    pub version: String,
    /// Principal used for connections that carry no authenticated identity.
    #[serde(default = "default_principal")]
    pub principal: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenConfig {
    /// Base64 AES-256 key used to mint continuation tokens.
    #[serde(default)]
    pub key: Option<String>,
    /// Retired keys still accepted when validating.
    #[serde(default)]
    pub previous_keys: Vec<String>,
    #[serde(default = "default_token_ttl")]
    pub ttl_seconds: u64,
}

/// Which requests to re-issue when some expected responses are missing.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReissuePolicy {
    /// Only the keys that went unanswered.
    #[default]
    MissingOnly,
    /// Every request of the round, answered or not.
    All,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoundConfig {
    #[serde(default)]
    pub reissue: ReissuePolicy,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// 0 disables the replay cache.
    #[serde(default = "default_replay_cache_ttl")]
    pub replay_cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    #[serde(default = "default_task_ttl")]
    pub default_ttl_ms: u64,
    #[serde(default = "default_max_task_ttl")]
    pub max_ttl_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

// Default value functions
fn default_server_name() -> String {
    "mcp-mrtr".to_string()
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_principal() -> String {
    "anonymous".to_string()
}

fn default_token_ttl() -> u64 {
    600
}

fn default_max_rounds() -> u32 {
    8
}

fn default_replay_cache_ttl() -> u64 {
    300
}

fn default_task_ttl() -> u64 {
    300_000
}

fn default_max_task_ttl() -> u64 {
    3_600_000
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_reaper_interval() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            version: default_server_version(),
            principal: default_principal(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            key: None,
            previous_keys: Vec::new(),
            ttl_seconds: default_token_ttl(),
        }
    }
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            reissue: ReissuePolicy::default(),
            max_rounds: default_max_rounds(),
            replay_cache_ttl_seconds: default_replay_cache_ttl(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_task_ttl(),
            max_ttl_ms: default_max_task_ttl(),
            poll_interval_ms: default_poll_interval(),
            reaper_interval_ms: default_reaper_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token.ttl_seconds)
    }

    pub fn replay_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.rounds.replay_cache_ttl_seconds)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.tasks.reaper_interval_ms)
    }
}

impl TaskConfig {
    /// Requested TTL clamped to the configured maximum, or the default.
    pub fn effective_ttl_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_ttl_ms)
            .min(self.max_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.principal, "anonymous");
        assert_eq!(config.token.ttl_seconds, 600);
        assert_eq!(config.rounds.reissue, ReissuePolicy::MissingOnly);
        assert_eq!(config.rounds.max_rounds, 8);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_effective_ttl_clamps() {
        let tasks = TaskConfig::default();
        assert_eq!(tasks.effective_ttl_ms(None), 300_000);
        assert_eq!(tasks.effective_ttl_ms(Some(50)), 50);
        assert_eq!(tasks.effective_ttl_ms(Some(u64::MAX)), 3_600_000);
    }

    #[test]
    fn test_reissue_policy_names() {
        let policy: ReissuePolicy = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(policy, ReissuePolicy::All);
        let policy: ReissuePolicy = serde_json::from_str("\"missing_only\"").unwrap();
        assert_eq!(policy, ReissuePolicy::MissingOnly);
    }
}
