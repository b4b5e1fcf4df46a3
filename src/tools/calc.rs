use async_trait::async_trait;
use serde_json::{json, Value};

use super::{create_tool, form_schema, refusal, RoundInput, RoundTripTool, Step};
use crate::error::{MrtrError, Result};
use crate::mrtr::InputRequestsBuilder;
use crate::protocol::error_codes;
use crate::types::mcp::{
    CallToolResult, Content, CreateMessageRequestParams, ModelPreferences, Role,
    SamplingMessage, TaskSupport, Tool,
};

const B_KEY: &str = "b";
const EVALUATION_KEY: &str = "evaluation";

/// Adds `a` to a second number elicited from the user.
pub struct AmbiguousAddTool;

#[async_trait]
impl RoundTripTool for AmbiguousAddTool {
    fn descriptor(&self) -> Tool {
        create_tool(
            "ambiguous_add",
            "Adds two numbers but only accepts 'a' and asks the user for 'b'",
            json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}},
                "required": ["a"]
            }),
            TaskSupport::Forbidden,
        )
    }

    async fn step(&self, input: &RoundInput) -> Result<Step> {
        let a = input.require_i64("a")?;

        let b = match input.elicited(B_KEY) {
            Some(answer) => {
                if let Some(err) = refusal(answer, "input for parameter b") {
                    return Err(err);
                }
                answer.field("b").and_then(Value::as_i64)
            }
            None => None,
        };

        match b {
            Some(b) => {
                let sum = a.checked_add(b).ok_or_else(|| MrtrError::ToolFailed {
                    code: error_codes::INTERNAL_ERROR,
                    message: format!("{a} + {b} overflows"),
                })?;
                Ok(Step::Complete(
                    CallToolResult::text(sum.to_string()).with_structured(json!({ "result": sum })),
                ))
            }
            None => Ok(Step::NeedInput(
                InputRequestsBuilder::new()
                    .elicit(
                        B_KEY,
                        format!("Please provide the second number (b) to add to {a}:"),
                        form_schema("b", "integer", "Second addend"),
                    )
                    .build()?,
            )),
        }
    }
}

/// Evaluates an arithmetic expression by asking the client's model.
pub struct EvalWithSamplingTool;

impl EvalWithSamplingTool {
    fn sampling_request(expression: &str) -> CreateMessageRequestParams {
        CreateMessageRequestParams {
            messages: vec![SamplingMessage {
                role: Role::User,
                content: Content::text(format!("Evaluate: {expression}")),
            }],
            model_preferences: Some(ModelPreferences {
                intelligence_priority: Some(0.2),
                speed_priority: Some(0.8),
                ..Default::default()
            }),
            system_prompt: Some(
                "You evaluate arithmetic expressions. Reply with the numeric result only.".into(),
            ),
            max_tokens: Some(32),
        }
    }
}

#[async_trait]
impl RoundTripTool for EvalWithSamplingTool {
    fn descriptor(&self) -> Tool {
        create_tool(
            "eval_with_sampling",
            "Evaluates an arithmetic expression using LLM sampling to compute the result",
            json!({
                "type": "object",
                "properties": {"expression": {"type": "string"}},
                "required": ["expression"]
            }),
            TaskSupport::Forbidden,
        )
    }

    async fn step(&self, input: &RoundInput) -> Result<Step> {
        let expression = input.require_str("expression")?;

        let Some(sampled) = input.sampled(EVALUATION_KEY) else {
            return Ok(Step::NeedInput(
                InputRequestsBuilder::new()
                    .sample(EVALUATION_KEY, Self::sampling_request(expression))
                    .build()?,
            ));
        };

        let value = sampled
            .content
            .as_text()
            .and_then(|text| text.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .ok_or_else(|| MrtrError::ToolFailed {
                code: error_codes::INTERNAL_ERROR,
                message: format!("Cannot evaluate expression: {expression}"),
            })?;

        Ok(Step::Complete(
            CallToolResult::text(value.to_string())
                .with_structured(json!({ "result": value, "model": sampled.model })),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::mcp::{CreateMessageResult, ElicitResult};
    use serde_json::Map;

    fn add_input(b: Option<ElicitResult>) -> RoundInput {
        let mut arguments = Map::new();
        arguments.insert("a".into(), json!(5));
        let mut input = RoundInput::new(arguments);
        if let Some(b) = b {
            input.answers.insert(B_KEY.into(), b.into());
        }
        input
    }

    #[tokio::test]
    async fn test_ambiguous_add_accept() {
        let mut content = Map::new();
        content.insert("b".into(), json!(7));
        let step = AmbiguousAddTool
            .step(&add_input(Some(ElicitResult::accept(content))))
            .await
            .unwrap();
        let Step::Complete(result) = step else {
            panic!("expected completion");
        };
        assert_eq!(result.first_text(), Some("12"));
    }

    #[tokio::test]
    async fn test_ambiguous_add_decline_and_cancel() {
        let declined = AmbiguousAddTool
            .step(&add_input(Some(ElicitResult::decline())))
            .await
            .unwrap_err();
        assert_eq!(declined.code(), -32000);

        let cancelled = AmbiguousAddTool
            .step(&add_input(Some(ElicitResult::cancel())))
            .await
            .unwrap_err();
        assert_eq!(cancelled.code(), -32001);
    }

    #[tokio::test]
    async fn test_eval_with_sampling_round_trip() {
        let mut arguments = Map::new();
        arguments.insert("expression".into(), json!("2 + 2 * 3"));
        let mut input = RoundInput::new(arguments);

        let Step::NeedInput(requests) = EvalWithSamplingTool.step(&input).await.unwrap() else {
            panic!("expected sampling request");
        };
        assert_eq!(
            requests.get(EVALUATION_KEY).map(|r| r.method()),
            Some("sampling/createMessage")
        );

        input.answers.insert(
            EVALUATION_KEY.into(),
            CreateMessageResult {
                role: Role::Assistant,
                content: Content::text(" 8 "),
                model: "test-model".into(),
                stop_reason: Some("endTurn".into()),
            }
            .into(),
        );
        let Step::Complete(result) = EvalWithSamplingTool.step(&input).await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(result.first_text(), Some("8"));
    }

    #[tokio::test]
    async fn test_eval_with_unparseable_sample_fails() {
        let mut arguments = Map::new();
        arguments.insert("expression".into(), json!("2 +"));
        let mut input = RoundInput::new(arguments);
        input.answers.insert(
            EVALUATION_KEY.into(),
            CreateMessageResult {
                role: Role::Assistant,
                content: Content::text("no idea"),
                model: "m".into(),
                stop_reason: None,
            }
            .into(),
        );
        let err = EvalWithSamplingTool.step(&input).await.unwrap_err();
        assert_eq!(err.code(), error_codes::INTERNAL_ERROR);
    }
}
