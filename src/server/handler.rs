use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{MrtrError, Result};
use crate::mrtr::{validate_call_shape, validate_input_shape, Principal};
use crate::protocol::{methods, JsonRpcId, JsonRpcRequest, JsonRpcResponse, ProtocolVersion};
use crate::state::{AppState, RequestTimer};
use crate::types::mcp::{
    CallToolParams, Implementation, InitializeResult, ListTasksResult, ServerCapabilities,
    SubmitInputParams, TaskIdParams, TasksCapability, ToolsCapability,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    #[serde(default)]
    protocol_version: Option<String>,
}

pub struct RequestHandler {
    state: Arc<AppState>,
}

impl RequestHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Handle one decoded message. Notifications produce no response.
    pub async fn handle(&self, principal: &Principal, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            self.handle_notification(&request);
            return None;
        }

        let timer = RequestTimer::new(self.state.metrics.clone());
        let id = request.id.clone();
        match self.dispatch(principal, &request).await {
            Ok(result) => {
                timer.finish();
                Some(JsonRpcResponse::success(id, result))
            }
            Err(e) => {
                timer.fail();
                debug!(method = %request.method, code = e.code(), "Request failed: {}", e);
                Some(JsonRpcResponse::failure(id, (&e).into()))
            }
        }
    }

    /// Handle a raw JSON value, answering structurally invalid requests with
    /// an error envelope instead of dropping them.
    pub async fn handle_value(&self, principal: &Principal, value: Value) -> Option<JsonRpcResponse> {
        let id = value
            .get("id")
            .and_then(|id| serde_json::from_value::<JsonRpcId>(id.clone()).ok());
        match JsonRpcRequest::from_value(value) {
            Ok(request) => self.handle(principal, request).await,
            Err(e) => {
                warn!("Rejecting invalid request: {}", e);
                self.state.metrics.record_failed_request();
                Some(JsonRpcResponse::failure(id, (&e).into()))
            }
        }
    }

    fn handle_notification(&self, request: &JsonRpcRequest) {
        match request.method.as_str() {
            methods::INITIALIZED => info!("Client initialized"),
            other => debug!(method = other, "Ignoring notification"),
        }
    }

    async fn dispatch(&self, principal: &Principal, request: &JsonRpcRequest) -> Result<Value> {
        debug!(method = %request.method, principal = %principal, "Handling request");

        match request.method.as_str() {
            methods::INITIALIZE => self.initialize(request.parse_params()?),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => Ok(json!({ "tools": self.state.tools.list() })),
            methods::TOOLS_CALL => {
                validate_call_shape(request.params.as_ref())?;
                let params: CallToolParams = request.parse_params()?;
                self.state
                    .engine
                    .call_tool(principal, params)
                    .await?
                    .to_value()
            }
            methods::TASKS_GET => {
                let params: TaskIdParams = request.parse_params()?;
                let task = self.state.tasks.get(principal, &params.task_id).await?;
                Ok(serde_json::to_value(task)?)
            }
            methods::TASKS_RESULT => {
                let params: TaskIdParams = request.parse_params()?;
                self.state
                    .tasks
                    .result(principal, &params.task_id)
                    .await?
                    .to_value()
            }
            methods::TASKS_LIST => {
                let tasks = self.state.tasks.list(principal).await;
                Ok(serde_json::to_value(ListTasksResult { tasks })?)
            }
            methods::TASKS_CANCEL => {
                let params: TaskIdParams = request.parse_params()?;
                let task = self.state.tasks.cancel(principal, &params.task_id).await?;
                Ok(serde_json::to_value(task)?)
            }
            methods::TASKS_INPUT => {
                validate_input_shape(request.params.as_ref())?;
                let params: SubmitInputParams = request.parse_params()?;
                self.state.tasks.submit_input(principal, params).await?;
                Ok(json!({}))
            }
            other => Err(MrtrError::MethodNotFound(other.to_string())),
        }
    }

    fn initialize(&self, params: InitializeParams) -> Result<Value> {
        let version = match params.protocol_version.as_deref() {
            Some(requested) => ProtocolVersion::from_string(requested).0,
            None => ProtocolVersion::LATEST,
        };
        info!(protocol_version = version.as_str(), "Negotiated protocol version");

        let tasks = version.supports_tasks().then(|| TasksCapability {
            list: Some(json!({})),
            cancel: Some(json!({})),
            requests: Some(json!({ "tools": { "call": {} } })),
        });
        let result = InitializeResult {
            protocol_version: version.as_str().to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability::default()),
                tasks,
                experimental: Some(json!({
                    "mrtr": { "reissue": self.state.config.rounds.reissue }
                })),
            },
            server_info: Implementation {
                name: self.state.config.server.name.clone(),
                version: self.state.config.server.version.clone(),
            },
        };
        Ok(serde_json::to_value(result)?)
    }
}
