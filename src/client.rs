//! Client half of the round-trip loop.
//!
//! [`RoundTripClient`] answers `inputRequests` through an [`InputProvider`],
//! echoes `requestState` untouched and retries until the server returns a
//! terminal result. Task-backed calls are followed through `tasks/get`,
//! `tasks/result` and `tasks/input`.

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{MrtrError, Result};
use crate::mrtr::Principal;
use crate::protocol::{methods, JsonRpcId, JsonRpcRequest};
use crate::server::RequestHandler;
use crate::types::mcp::{
    CallToolParams, CallToolResult, CreateTaskResult, IncompleteResult, InputRequests,
    InputResponses, SubRequest, SubResponse, SubmitInputParams, Task, TaskMetadata, TaskStatus,
};

const DEFAULT_MAX_ROUNDS: u32 = 16;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sends one JSON-RPC request and returns its `result`, or the error
/// envelope as [`MrtrError::Remote`].
#[async_trait]
pub trait RequestSender: Send + Sync {
    async fn send(&self, method: &str, params: Value) -> Result<Value>;
}

/// Answers a single server-issued request on behalf of the user.
#[async_trait]
pub trait InputProvider: Send + Sync {
    async fn fulfill(&self, key: &str, request: &SubRequest) -> Result<SubResponse>;
}

#[async_trait]
impl<F> InputProvider for F
where
    F: Fn(&str, &SubRequest) -> Result<SubResponse> + Send + Sync,
{
    async fn fulfill(&self, key: &str, request: &SubRequest) -> Result<SubResponse> {
        self(key, request)
    }
}

/// In-process sender bound to one principal.
pub struct LocalSender {
    handler: Arc<RequestHandler>,
    principal: Principal,
    next_id: AtomicI64,
}

impl LocalSender {
    pub fn new(handler: Arc<RequestHandler>, principal: Principal) -> Self {
        Self {
            handler,
            principal,
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl RequestSender for LocalSender {
    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        let id = JsonRpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = JsonRpcRequest::new(id, method, Some(params));
        let response = self
            .handler
            .handle(&self.principal, request)
            .await
            .ok_or_else(|| MrtrError::Internal(format!("no response to {method}")))?;

        if let Some(error) = response.error {
            return Err(MrtrError::Remote {
                code: error.code,
                message: error.message,
            });
        }
        response
            .result
            .ok_or_else(|| MrtrError::Internal(format!("empty response to {method}")))
    }
}

pub struct RoundTripClient<S> {
    sender: S,
    max_rounds: u32,
    poll_interval: Duration,
}

impl<S: RequestSender> RoundTripClient<S> {
    pub fn new(sender: S) -> Self {
        Self {
            sender,
            max_rounds: DEFAULT_MAX_ROUNDS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Longest wait between task polls.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    /// Call a tool, answering every round of input until it finishes.
    ///
    /// If the server promotes the call to a task, the task is followed to
    /// its end and its terminal result returned.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        provider: &dyn InputProvider,
    ) -> Result<CallToolResult> {
        let mut params = CallToolParams::new(name, arguments);

        for round in 1..=self.max_rounds {
            let value = self
                .sender
                .send(methods::TOOLS_CALL, serde_json::to_value(&params)?)
                .await?;

            if value.get("task").is_some() {
                let created: CreateTaskResult = serde_json::from_value(value)?;
                debug!(tool = name, task_id = %created.task.task_id, "Call continued as a task");
                return self.follow_task(&created.task.task_id, provider).await;
            }
            if !IncompleteResult::is_incomplete_payload(&value) {
                return Ok(serde_json::from_value(value)?);
            }

            let incomplete: IncompleteResult = serde_json::from_value(value)?;
            debug!(
                tool = name,
                round,
                requests = incomplete.input_requests.as_ref().map_or(0, InputRequests::len),
                "Server needs more input"
            );
            let responses = fulfill_all(incomplete.input_requests.as_ref(), provider).await?;
            params = params.retry(responses, incomplete.request_state);
        }

        Err(MrtrError::RoundLimitExceeded(self.max_rounds))
    }

    /// Ask for task-backed execution from the start.
    pub async fn start_task(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        ttl: Option<u64>,
    ) -> Result<Task> {
        let mut params = CallToolParams::new(name, arguments);
        params.task = Some(TaskMetadata { ttl });

        let value = self
            .sender
            .send(methods::TOOLS_CALL, serde_json::to_value(&params)?)
            .await?;
        if value.get("task").is_none() {
            return Err(MrtrError::Internal(format!(
                "server did not create a task for {name}"
            )));
        }
        let created: CreateTaskResult = serde_json::from_value(value)?;
        Ok(created.task)
    }

    /// Poll a task, supplying input whenever it asks, until it is terminal.
    pub async fn follow_task(
        &self,
        task_id: &str,
        provider: &dyn InputProvider,
    ) -> Result<CallToolResult> {
        let id_params = json!({ "taskId": task_id });
        let mut submissions = 0;

        loop {
            let task: Task =
                serde_json::from_value(self.sender.send(methods::TASKS_GET, id_params.clone()).await?)?;

            match task.status {
                TaskStatus::Working => {
                    let wait = task
                        .poll_interval
                        .map(Duration::from_millis)
                        .map_or(self.poll_interval, |d| d.min(self.poll_interval));
                    tokio::time::sleep(wait).await;
                }
                TaskStatus::InputRequired => {
                    if submissions >= self.max_rounds {
                        return Err(MrtrError::RoundLimitExceeded(self.max_rounds));
                    }
                    let value = self
                        .sender
                        .send(methods::TASKS_RESULT, id_params.clone())
                        .await?;
                    if !IncompleteResult::is_incomplete_payload(&value) {
                        return Ok(serde_json::from_value(value)?);
                    }

                    let incomplete: IncompleteResult = serde_json::from_value(value)?;
                    let input_responses =
                        fulfill_all(incomplete.input_requests.as_ref(), provider).await?;
                    let submit = SubmitInputParams {
                        task_id: task_id.to_string(),
                        input_responses,
                        request_state: None,
                    };
                    self.sender
                        .send(methods::TASKS_INPUT, serde_json::to_value(&submit)?)
                        .await?;
                    submissions += 1;
                    debug!(task_id, submissions, "Submitted task input");
                }
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                    let value = self.sender.send(methods::TASKS_RESULT, id_params).await?;
                    return Ok(serde_json::from_value(value)?);
                }
            }
        }
    }
}

/// Requests in one round are independent, so they are answered concurrently.
async fn fulfill_all(
    requests: Option<&InputRequests>,
    provider: &dyn InputProvider,
) -> Result<InputResponses> {
    let Some(requests) = requests else {
        return Ok(InputResponses::new());
    };
    let answers = try_join_all(requests.iter().map(|(key, request)| async move {
        provider.fulfill(key, request).await.map(|response| (key, response))
    }))
    .await?;

    let mut responses = InputResponses::new();
    for (key, response) in answers {
        responses.insert(key, response);
    }
    Ok(responses)
}
