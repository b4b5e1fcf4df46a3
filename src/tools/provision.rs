use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::{create_tool, form_schema, refusal, RoundInput, RoundTripTool, Step};
use crate::error::Result;
use crate::mrtr::InputRequestsBuilder;
use crate::types::mcp::{CallToolResult, ElicitAction, TaskSupport, Tool};

const NAME_KEY: &str = "workspace_name";
const CONFIRM_KEY: &str = "confirm";

/// Gathers a workspace name ephemerally, then continues as a task for the
/// confirmation and the slow provisioning work.
pub struct ProvisionWorkspaceTool {
    work: Duration,
}

impl Default for ProvisionWorkspaceTool {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl ProvisionWorkspaceTool {
    pub fn new(work: Duration) -> Self {
        Self { work }
    }
}

#[async_trait]
impl RoundTripTool for ProvisionWorkspaceTool {
    fn descriptor(&self) -> Tool {
        create_tool(
            "provision_workspace",
            "Provision a workspace; continues as a task once the name is known",
            json!({
                "type": "object",
                "properties": {
                    "region": {"type": "string", "description": "Deployment region"}
                }
            }),
            TaskSupport::Optional,
        )
    }

    async fn step(&self, input: &RoundInput) -> Result<Step> {
        let name = match input.elicited(NAME_KEY) {
            Some(answer) => {
                if let Some(err) = refusal(answer, "a workspace name") {
                    return Err(err);
                }
                answer.field("name").and_then(Value::as_str)
            }
            None => None,
        };
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return Ok(Step::NeedInput(
                InputRequestsBuilder::new()
                    .elicit(
                        NAME_KEY,
                        "Name the workspace to provision",
                        form_schema("name", "string", "Workspace name"),
                    )
                    .build()?,
            ));
        };

        if !input.is_task_backed() {
            return Ok(Step::Promote { ttl: None });
        }

        let Some(confirmation) = input.elicited(CONFIRM_KEY) else {
            return Ok(Step::NeedInput(
                InputRequestsBuilder::new()
                    .elicit(
                        CONFIRM_KEY,
                        format!("Provision workspace '{name}'? This may take a while."),
                        form_schema("confirm", "boolean", "Proceed with provisioning"),
                    )
                    .build()?,
            ));
        };
        let confirmed = confirmation.action == ElicitAction::Accept
            && confirmation.field("confirm").and_then(Value::as_bool) == Some(true);
        if !confirmed {
            return Ok(Step::Complete(CallToolResult::error(format!(
                "Provisioning of '{name}' was not confirmed"
            ))));
        }

        let region = input
            .argument("region")
            .and_then(Value::as_str)
            .unwrap_or("default");
        tracing::debug!(workspace = name, region, "Provisioning workspace");
        tokio::time::sleep(self.work).await;

        Ok(Step::Complete(
            CallToolResult::text(format!("Workspace '{name}' provisioned in {region}"))
                .with_structured(json!({ "workspace": name, "region": region })),
        ))
    }

    fn side_effecting(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mrtr::WorkflowKind;
    use crate::types::mcp::ElicitResult;
    use serde_json::Map;

    fn accepted(field: &str, value: Value) -> ElicitResult {
        let mut content = Map::new();
        content.insert(field.into(), value);
        ElicitResult::accept(content)
    }

    #[tokio::test]
    async fn test_promotes_once_named() {
        let tool = ProvisionWorkspaceTool::new(Duration::ZERO);
        let mut input = RoundInput::default();
        input
            .answers
            .insert(NAME_KEY.into(), accepted("name", json!("alpha")).into());
        assert_eq!(tool.step(&input).await.unwrap(), Step::Promote { ttl: None });
    }

    #[tokio::test]
    async fn test_task_backed_asks_for_confirmation_then_completes() {
        let tool = ProvisionWorkspaceTool::new(Duration::ZERO);
        let mut input = RoundInput {
            execution: WorkflowKind::TaskBacked,
            ..Default::default()
        };
        input
            .answers
            .insert(NAME_KEY.into(), accepted("name", json!("alpha")).into());

        let Step::NeedInput(requests) = tool.step(&input).await.unwrap() else {
            panic!("expected confirmation request");
        };
        assert!(requests.contains_key(CONFIRM_KEY));

        input
            .answers
            .insert(CONFIRM_KEY.into(), accepted("confirm", json!(true)).into());
        let Step::Complete(result) = tool.step(&input).await.unwrap() else {
            panic!("expected completion");
        };
        assert!(!result.is_error);
        assert_eq!(
            result.first_text(),
            Some("Workspace 'alpha' provisioned in default")
        );
    }

    #[tokio::test]
    async fn test_unconfirmed_is_tool_error() {
        let tool = ProvisionWorkspaceTool::new(Duration::ZERO);
        let mut input = RoundInput {
            execution: WorkflowKind::TaskBacked,
            ..Default::default()
        };
        input
            .answers
            .insert(NAME_KEY.into(), accepted("name", json!("alpha")).into());
        input
            .answers
            .insert(CONFIRM_KEY.into(), ElicitResult::decline().into());
        let Step::Complete(result) = tool.step(&input).await.unwrap() else {
            panic!("expected completion");
        };
        assert!(result.is_error);
    }
}
