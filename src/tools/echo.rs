use async_trait::async_trait;
use serde_json::{json, Value};

use super::{create_tool, form_schema, refusal, RoundInput, RoundTripTool, Step};
use crate::error::Result;
use crate::mrtr::InputRequestsBuilder;
use crate::types::mcp::{CallToolResult, TaskSupport, Tool};

const INPUT_KEY: &str = "echo_input";

/// Echoes back whatever the user types. Runs ephemeral or as a task.
pub struct EchoTool;

#[async_trait]
impl RoundTripTool for EchoTool {
    fn descriptor(&self) -> Tool {
        create_tool(
            "echo",
            "Ask the user for text and echo it back",
            json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string", "description": "Question shown to the user"}
                }
            }),
            TaskSupport::Optional,
        )
    }

    async fn step(&self, input: &RoundInput) -> Result<Step> {
        let text = match input.elicited(INPUT_KEY) {
            Some(answer) => {
                if let Some(err) = refusal(answer, "text to echo") {
                    return Err(err);
                }
                answer.field("input").and_then(Value::as_str)
            }
            None => None,
        };

        match text {
            Some(text) => Ok(Step::Complete(CallToolResult::text(text))),
            None => {
                let prompt = input
                    .argument("prompt")
                    .and_then(Value::as_str)
                    .unwrap_or("What should I echo?");
                Ok(Step::NeedInput(
                    InputRequestsBuilder::new()
                        .elicit(INPUT_KEY, prompt, form_schema("input", "string", "Text to echo"))
                        .build()?,
                ))
            }
        }
    }
}
