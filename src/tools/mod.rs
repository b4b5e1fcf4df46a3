//! Tools that may need more than one round trip to finish.
//!
//! A tool is a pure step function: given the arguments and every answer
//! gathered so far it either asks for more input, finishes, or asks to be
//! continued as a task. The engines own all correlation state.

mod calc;
mod echo;
mod provision;
#[cfg(test)]
pub(crate) mod testing;
mod whoami;
mod work_items;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{MrtrError, Result};
use crate::mrtr::WorkflowKind;
use crate::protocol::error_codes;
use crate::types::mcp::{
    CallToolResult, CreateMessageResult, ElicitAction, ElicitResult, InputRequests, SubResponse,
    TaskSupport, Tool, ToolExecution,
};

pub use calc::{AmbiguousAddTool, EvalWithSamplingTool};
pub use echo::EchoTool;
pub use provision::ProvisionWorkspaceTool;
pub use whoami::WhoamiTool;
pub use work_items::ResolveWorkItemTool;

/// Everything a tool sees for one step.
#[derive(Debug, Clone, Default)]
pub struct RoundInput {
    pub arguments: Map<String, Value>,
    pub answers: BTreeMap<String, SubResponse>,
    /// Rounds so far that asked something new; 0 on the first call.
    pub round: u32,
    pub execution: WorkflowKind,
}

impl RoundInput {
    pub fn new(arguments: Map<String, Value>) -> Self {
        Self {
            arguments,
            ..Default::default()
        }
    }

    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    pub fn require_str(&self, name: &str) -> Result<&str> {
        self.argument(name)
            .and_then(Value::as_str)
            .ok_or_else(|| MrtrError::InvalidParams(format!("'{name}' must be a string")))
    }

    pub fn require_i64(&self, name: &str) -> Result<i64> {
        self.argument(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| MrtrError::InvalidParams(format!("'{name}' must be an integer")))
    }

    pub fn elicited(&self, key: &str) -> Option<&ElicitResult> {
        self.answers.get(key).and_then(SubResponse::as_elicit)
    }

    pub fn sampled(&self, key: &str) -> Option<&CreateMessageResult> {
        self.answers.get(key).and_then(SubResponse::as_sampling)
    }

    pub fn is_task_backed(&self) -> bool {
        self.execution == WorkflowKind::TaskBacked
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    NeedInput(InputRequests),
    Complete(CallToolResult),
    /// Continue as a task-backed interaction.
    Promote { ttl: Option<u64> },
}

#[async_trait]
pub trait RoundTripTool: Send + Sync + 'static {
    fn descriptor(&self) -> Tool;

    async fn step(&self, input: &RoundInput) -> Result<Step>;

    /// Whether finishing twice would repeat an externally visible effect.
    fn side_effecting(&self) -> bool {
        false
    }
}

/// Error for a declined or cancelled elicitation; `None` when accepted.
pub fn refusal(result: &ElicitResult, what: &str) -> Option<MrtrError> {
    match result.action {
        ElicitAction::Accept => None,
        ElicitAction::Decline => Some(MrtrError::ToolFailed {
            code: error_codes::USER_DECLINED,
            message: format!("User declined to provide {what}"),
        }),
        ElicitAction::Cancel => Some(MrtrError::ToolFailed {
            code: error_codes::USER_CANCELLED,
            message: "User cancelled the elicitation request".to_string(),
        }),
    }
}

/// Single-field object schema for an elicitation form.
pub(crate) fn form_schema(field: &str, kind: &str, description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            field: {"type": kind, "description": description}
        },
        "required": [field]
    })
}

pub(crate) fn create_tool(
    name: &str,
    description: &str,
    input_schema: Value,
    task_support: TaskSupport,
) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema,
        execution: (task_support != TaskSupport::Forbidden)
            .then_some(ToolExecution { task_support }),
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn RoundTripTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(WhoamiTool));
        registry.register(Arc::new(ResolveWorkItemTool));
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(AmbiguousAddTool));
        registry.register(Arc::new(EvalWithSamplingTool));
        registry.register(Arc::new(ProvisionWorkspaceTool::default()));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn RoundTripTool>) {
        let name = tool.descriptor().name;
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Replaced previously registered tool");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RoundTripTool>> {
        self.tools.get(name).cloned()
    }

    /// Descriptors sorted by name.
    pub fn list(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self.tools.values().map(|t| t.descriptor()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
