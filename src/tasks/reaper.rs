use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info};

use super::TaskEngine;
use crate::mrtr::ReplayCache;

/// Background sweeper that fails overdue tasks and evicts expired entries.
/// Read paths apply the same TTL check, so this only bounds memory and makes
/// expiry visible without a poll.
pub struct TaskReaper {
    engine: Arc<TaskEngine>,
    replay: Option<Arc<ReplayCache>>,
    interval: Duration,
}

impl TaskReaper {
    pub fn new(engine: Arc<TaskEngine>, interval: Duration) -> Self {
        Self {
            engine,
            replay: None,
            interval,
        }
    }

    pub fn with_replay_cache(mut self, replay: Arc<ReplayCache>) -> Self {
        self.replay = Some(replay);
        self
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "Starting task reaper (every {}ms)",
            self.interval.as_millis()
        );

        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = shutdown.recv() => {
                    info!("Task reaper stopping");
                    break;
                }
            }
        }
    }

    async fn sweep(&self) {
        let expired = self.engine.expire_overdue(Utc::now()).await;
        if expired > 0 {
            debug!("Task reaper expired {} task(s)", expired);
        }
        if let Some(replay) = &self.replay {
            let purged = replay.purge_expired();
            if purged > 0 {
                debug!("Purged {} replay cache entries", purged);
            }
        }
    }
}
