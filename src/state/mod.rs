use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::Result;
use crate::mrtr::{EphemeralEngine, ReplayCache, TokenCodec};
use crate::tasks::{TaskEngine, TaskReaper};
use crate::tools::ToolRegistry;

pub mod metrics;

pub use metrics::{Metrics, RequestTimer};

/// Everything a request handler needs, shared across connections.
pub struct AppState {
    pub config: Config,
    pub tools: Arc<ToolRegistry>,
    pub metrics: Arc<Metrics>,
    pub tasks: Arc<TaskEngine>,
    pub replay: Arc<ReplayCache>,
    pub engine: EphemeralEngine,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(config: Config) -> Result<(Arc<Self>, broadcast::Receiver<()>)> {
        Self::with_tools(config, ToolRegistry::with_builtin_tools())
    }

    pub fn with_tools(
        config: Config,
        tools: ToolRegistry,
    ) -> Result<(Arc<Self>, broadcast::Receiver<()>)> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);

        let codec = TokenCodec::from_config(&config.token)?;
        let metrics = Arc::new(Metrics::new());
        let tools = Arc::new(tools);
        let tasks = Arc::new(TaskEngine::new(
            config.tasks.clone(),
            config.rounds.reissue,
            config.rounds.max_rounds,
            metrics.clone(),
        ));
        let replay = Arc::new(ReplayCache::new(config.replay_cache_ttl()));
        let engine = EphemeralEngine::new(
            tools.clone(),
            codec,
            tasks.clone(),
            replay.clone(),
            config.rounds.reissue,
            config.rounds.max_rounds,
            metrics.clone(),
        );

        let state = Arc::new(Self {
            config,
            tools,
            metrics,
            tasks,
            replay,
            engine,
            shutdown_tx,
        });

        Ok((state, shutdown_rx))
    }

    /// Start the background task reaper; it stops on [`AppState::shutdown`].
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let reaper = TaskReaper::new(self.tasks.clone(), self.config.reaper_interval())
            .with_replay_cache(self.replay.clone());
        tokio::spawn(reaper.run(self.shutdown_tx.subscribe()))
    }

    pub async fn shutdown(&self) {
        tracing::info!("Initiating application shutdown");

        // Send shutdown signal to all components
        let _ = self.shutdown_tx.send(());
    }
}
