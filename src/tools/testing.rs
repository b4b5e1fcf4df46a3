//! Tools used only by unit tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::{create_tool, form_schema, RoundInput, RoundTripTool, Step};
use crate::error::Result;
use crate::mrtr::InputRequestsBuilder;
use crate::types::mcp::{CallToolResult, TaskSupport, Tool};

/// Asks for `first` and `second` in the same round and joins the answers.
pub struct PairTool;

impl PairTool {
    fn answer<'a>(input: &'a RoundInput, key: &str) -> Option<&'a str> {
        input
            .elicited(key)
            .and_then(|answer| answer.field("value"))
            .and_then(Value::as_str)
    }
}

#[async_trait]
impl RoundTripTool for PairTool {
    fn descriptor(&self) -> Tool {
        create_tool(
            "pair",
            "Ask for two values at once",
            json!({"type": "object"}),
            TaskSupport::Optional,
        )
    }

    async fn step(&self, input: &RoundInput) -> Result<Step> {
        if let (Some(first), Some(second)) =
            (Self::answer(input, "first"), Self::answer(input, "second"))
        {
            return Ok(Step::Complete(CallToolResult::text(format!("{first} {second}"))));
        }
        Ok(Step::NeedInput(
            InputRequestsBuilder::new()
                .elicit("first", "First value?", form_schema("value", "string", "First"))
                .elicit("second", "Second value?", form_schema("value", "string", "Second"))
                .build()?,
        ))
    }
}

/// Works for an hour before finishing. Task-only.
pub struct SlowTool;

#[async_trait]
impl RoundTripTool for SlowTool {
    fn descriptor(&self) -> Tool {
        create_tool(
            "slow",
            "Take a very long time",
            json!({"type": "object"}),
            TaskSupport::Required,
        )
    }

    async fn step(&self, _input: &RoundInput) -> Result<Step> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Step::Complete(CallToolResult::text("done")))
    }
}
