//! Rules shared by both engines: what a retry may carry, and which way an
//! interaction may move between the ephemeral and task-backed workflows.

use serde_json::Value;

use crate::error::{MrtrError, Result, TaskError};
use crate::types::mcp::{CallToolParams, InputResponses, SubmitInputParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowKind {
    #[default]
    Ephemeral,
    TaskBacked,
}

impl WorkflowKind {
    /// Promotion is one way and happens once: an ephemeral interaction may
    /// continue ephemerally or become task-backed; a task-backed one stays
    /// correlated by its task id for good.
    pub fn can_transition(self, to: WorkflowKind) -> bool {
        match (self, to) {
            (WorkflowKind::Ephemeral, _) => true,
            (WorkflowKind::TaskBacked, _) => false,
        }
    }
}

/// Structural check of the retry augmentation on a `tools/call`.
///
/// Each response value must be a JSON object (or null, meaning "no answer").
/// Anything else is malformed. Whether the objects answer the right questions
/// is decided later by reconciliation and is never a hard error.
pub fn validate_retry(params: &CallToolParams) -> Result<()> {
    match &params.input_responses {
        Some(responses) => validate_responses(responses),
        None => Ok(()),
    }
}

pub fn validate_responses(responses: &InputResponses) -> Result<()> {
    for key in responses.keys() {
        match responses.get_raw(key) {
            Some(Value::Object(_)) | Some(Value::Null) | None => {}
            Some(other) => {
                return Err(MrtrError::InvalidRequest(format!(
                    "inputResponses.{key} must be an object, got {}",
                    json_type(other)
                )))
            }
        }
    }
    Ok(())
}

/// Type check of the raw `tools/call` params before they are decoded, so a
/// badly typed retry field is an invalid request at any depth rather than
/// a decoding failure.
pub fn validate_call_shape(params: Option<&Value>) -> Result<()> {
    expect_field(params, "inputResponses", |v| v.is_object() || v.is_null(), "an object")?;
    expect_field(params, "requestState", |v| v.is_string() || v.is_null(), "a string")
}

/// Raw-params counterpart of [`validate_call_shape`] for `tasks/input`.
pub fn validate_input_shape(params: Option<&Value>) -> Result<()> {
    expect_field(params, "inputResponses", Value::is_object, "an object")
}

fn expect_field(
    params: Option<&Value>,
    name: &str,
    accepts: impl Fn(&Value) -> bool,
    expected: &str,
) -> Result<()> {
    match params.and_then(|p| p.get(name)) {
        Some(value) if !accepts(value) => Err(MrtrError::InvalidRequest(format!(
            "{name} must be {expected}, got {}",
            json_type(value)
        ))),
        _ => Ok(()),
    }
}

/// Task-backed input is correlated by task id alone.
pub fn ensure_task_correlation(params: &SubmitInputParams) -> Result<()> {
    match &params.request_state {
        None | Some(Value::Null) => validate_responses(&params.input_responses),
        Some(_) => Err(TaskError::EphemeralStateOnTask.into()),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
