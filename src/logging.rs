//! Tracing subscriber setup.
//!
//! Logs always go to stderr: in stdio mode stdout carries the JSON-RPC stream.

use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{MrtrError, Result};

/// Crate-level directive; `--debug` overrides the configured level.
fn crate_directive(config: &LoggingConfig, debug: bool) -> String {
    let level = if debug { "debug" } else { config.level.as_str() };
    format!("mcp_mrtr={level}")
}

pub fn init(config: &LoggingConfig, debug: bool) -> Result<()> {
    let directive = crate_directive(config, debug)
        .parse::<Directive>()
        .map_err(|e| MrtrError::Internal(format!("invalid log level '{}': {e}", config.level)))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| MrtrError::Internal(format!("failed to install tracing subscriber: {e}")))
}
