use tracing::{info, warn};

use crate::config::{self, Config};
use crate::error::Result;
use crate::state::AppState;

pub async fn run_config_check(config: Config) -> Result<()> {
    info!("Running configuration check...");

    config::validate(&config)?;
    info!("✓ Configuration is valid");

    info!("\nServer:");
    info!("  Name: {} {}", config.server.name, config.server.version);
    info!("  Default principal: {}", config.server.principal);

    info!("\nContinuation tokens:");
    match &config.token.key {
        Some(_) => info!("  Key: configured"),
        None => warn!("  Key: not configured, a random per-process key will be used"),
    }
    info!("  Previous keys accepted: {}", config.token.previous_keys.len());
    info!("  TTL: {} seconds", config.token.ttl_seconds);

    info!("\nRounds:");
    info!("  Re-issue policy: {:?}", config.rounds.reissue);
    info!("  Max rounds: {}", config.rounds.max_rounds);
    if config.rounds.replay_cache_ttl_seconds == 0 {
        info!("  Replay cache: DISABLED");
    } else {
        info!("  Replay cache TTL: {} seconds", config.rounds.replay_cache_ttl_seconds);
    }

    info!("\nTasks:");
    info!("  Default TTL: {} ms", config.tasks.default_ttl_ms);
    info!("  Max TTL: {} ms", config.tasks.max_ttl_ms);
    info!("  Poll interval: {} ms", config.tasks.poll_interval_ms);
    info!("  Reaper interval: {} ms", config.tasks.reaper_interval_ms);

    // Building the state proves the keys decode into a working codec.
    let (state, _shutdown_rx) = AppState::new(config)?;
    info!("\n✓ {} tool(s) registered", state.tools.len());
    for tool in state.tools.list() {
        info!("  {} (task support: {:?})", tool.name, tool.task_support());
    }

    Ok(())
}
