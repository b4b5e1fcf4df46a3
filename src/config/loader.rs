use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::path::Path;

use super::schema::Config;
use crate::error::{ConfigError, Result};
use crate::mrtr::token::decode_key;

const ENV_PREFIX: &str = "MCP_MRTR_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        // Try to load from various config files
        .merge(Toml::file("mcp-mrtr.toml"))
        .merge(Json::file("mcp-mrtr.json"))
        .merge(Yaml::file("mcp-mrtr.yaml"))
        .merge(Yaml::file("mcp-mrtr.yml"))
        // Override with environment variables (MCP_MRTR_TOKEN__TTL_SECONDS=...)
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let base = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = base
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if let Some(key) = &config.token.key {
        decode_key(key).map_err(|e| ConfigError::Validation(format!("token.key: {e}")))?;
    }
    for (index, key) in config.token.previous_keys.iter().enumerate() {
        decode_key(key)
            .map_err(|e| ConfigError::Validation(format!("token.previous_keys[{index}]: {e}")))?;
    }
    if !config.token.previous_keys.is_empty() && config.token.key.is_none() {
        return Err(ConfigError::Validation(
            "token.previous_keys requires token.key".into(),
        )
        .into());
    }

    if config.token.ttl_seconds == 0 {
        return Err(ConfigError::Validation("token.ttl_seconds must be greater than 0".into()).into());
    }

    if config.rounds.max_rounds == 0 {
        return Err(ConfigError::Validation("rounds.max_rounds must be greater than 0".into()).into());
    }

    if config.tasks.default_ttl_ms == 0 || config.tasks.max_ttl_ms == 0 {
        return Err(ConfigError::Validation("task TTLs must be greater than 0".into()).into());
    }

    if config.tasks.default_ttl_ms > config.tasks.max_ttl_ms {
        return Err(ConfigError::Validation(
            "tasks.default_ttl_ms must not exceed tasks.max_ttl_ms".into(),
        )
        .into());
    }

    if config.tasks.reaper_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "tasks.reaper_interval_ms must be greater than 0".into(),
        )
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    if let Some(key) = &mut config.token.key {
        *key = substitute_env_vars(key)?;
    }

    for key in &mut config.token.previous_keys {
        *key = substitute_env_vars(key)?;
    }

    config.server.principal = substitute_env_vars(&config.server.principal)?;

    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        // ${VAR:-default}
        if let Some((name, default)) = var_name.split_once(":-") {
            match std::env::var(name) {
                Ok(value) => result = result.replace(&cap[0], &value),
                Err(_) => result = result.replace(&cap[0], default),
            }
            continue;
        }
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{}' not found",
                    var_name
                ))
                .into());
            }
        }
    }

    Ok(result)
}
