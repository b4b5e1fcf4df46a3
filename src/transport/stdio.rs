use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::mrtr::Principal;
use crate::protocol::{JsonRpcError, JsonRpcResponse};
use crate::server::RequestHandler;

/// How long requests still running at end of input may take to finish.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Newline-delimited JSON-RPC server.
///
/// Each request runs on its own task so a slow `tasks/result` never blocks
/// the stream; responses funnel through one writer task and may therefore
/// arrive out of request order.
pub struct StdioServer {
    handler: Arc<RequestHandler>,
    principal: Principal,
    drain_timeout: Duration,
}

impl StdioServer {
    pub fn new(handler: Arc<RequestHandler>, principal: Principal) -> Self {
        Self {
            handler,
            principal,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Bound on the wait for in-flight requests once input ends. A
    /// `tasks/result` on a working task could otherwise hold shutdown for
    /// the task's whole time-to-live.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Serve the process's stdin/stdout until stdin closes.
    pub async fn run(&self) -> Result<()> {
        info!("Stdio mode ready - reading from stdin, writing to stdout");
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<String>(64);
        let writer_task = tokio::spawn(write_responses(writer, rx));

        let mut lines = BufReader::new(reader).lines();
        let mut in_flight = JoinSet::new();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("Stdin closed, shutting down");
                    break;
                }
                Err(e) => {
                    error!("Error reading from stdin: {}", e);
                    break;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let value = match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(value) => value,
                Err(e) => {
                    error!("Invalid JSON: {}", e);
                    let response = JsonRpcResponse::failure(None, JsonRpcError::parse_error(e));
                    if !send_response(&tx, &response).await {
                        break;
                    }
                    continue;
                }
            };

            let handler = self.handler.clone();
            let principal = self.principal.clone();
            let tx = tx.clone();
            in_flight.spawn(async move {
                if let Some(response) = handler.handle_value(&principal, value).await {
                    send_response(&tx, &response).await;
                }
            });

            // Reap finished handlers so the set does not grow unbounded.
            while in_flight.try_join_next().is_some() {}
        }

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    error!("Request task failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                abandoned = in_flight.len(),
                "Requests still running at shutdown; aborting them"
            );
            in_flight.shutdown().await;
        }
        drop(tx);

        match writer_task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Writer task failed: {}", e);
                Ok(())
            }
        }
    }
}

async fn send_response(tx: &mpsc::Sender<String>, response: &JsonRpcResponse) -> bool {
    match serde_json::to_string(response) {
        Ok(line) => tx.send(line).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            true
        }
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::Receiver<String>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    debug!("Response writer finished");
    Ok(())
}
