use async_trait::async_trait;
use serde_json::{json, Value};

use super::{create_tool, form_schema, refusal, RoundInput, RoundTripTool, Step};
use crate::error::Result;
use crate::mrtr::InputRequestsBuilder;
use crate::types::mcp::{CallToolResult, TaskSupport, Tool};

const RESOLUTION_KEY: &str = "resolution";
const DUPLICATE_KEY: &str = "duplicate_of";
const RESOLUTIONS: [&str; 4] = ["Fixed", "Duplicate", "Won't Fix", "By Design"];

/// Resolves a work item, asking how and, for duplicates, of what.
pub struct ResolveWorkItemTool;

impl ResolveWorkItemTool {
    fn ask_resolution(work_item: i64) -> Result<Step> {
        Ok(Step::NeedInput(
            InputRequestsBuilder::new()
                .elicit(
                    RESOLUTION_KEY,
                    format!("How should work item #{work_item} be resolved?"),
                    json!({
                        "type": "object",
                        "properties": {
                            "resolution": {"type": "string", "enum": RESOLUTIONS}
                        },
                        "required": ["resolution"]
                    }),
                )
                .build()?,
        ))
    }

    fn ask_duplicate(work_item: i64) -> Result<Step> {
        Ok(Step::NeedInput(
            InputRequestsBuilder::new()
                .elicit(
                    DUPLICATE_KEY,
                    format!("Work item #{work_item} duplicates which work item?"),
                    form_schema("duplicate_of", "integer", "Id of the original work item"),
                )
                .build()?,
        ))
    }
}

#[async_trait]
impl RoundTripTool for ResolveWorkItemTool {
    fn descriptor(&self) -> Tool {
        create_tool(
            "resolve_work_item",
            "Resolve a work item, asking for the resolution and any duplicate reference",
            json!({
                "type": "object",
                "properties": {
                    "work_item_id": {"type": "integer", "description": "Work item to resolve"}
                },
                "required": ["work_item_id"]
            }),
            TaskSupport::Forbidden,
        )
    }

    async fn step(&self, input: &RoundInput) -> Result<Step> {
        let work_item = input.require_i64("work_item_id")?;

        let Some(answer) = input.elicited(RESOLUTION_KEY) else {
            return Self::ask_resolution(work_item);
        };
        if let Some(err) = refusal(answer, "a resolution") {
            return Err(err);
        }
        let Some(resolution) = answer
            .field("resolution")
            .and_then(Value::as_str)
            .filter(|r| RESOLUTIONS.contains(r))
        else {
            return Self::ask_resolution(work_item);
        };

        if resolution != "Duplicate" {
            return Ok(Step::Complete(
                CallToolResult::text(format!("Work item #{work_item} resolved as {resolution}"))
                    .with_structured(json!({
                        "workItemId": work_item,
                        "resolution": resolution
                    })),
            ));
        }

        let Some(answer) = input.elicited(DUPLICATE_KEY) else {
            return Self::ask_duplicate(work_item);
        };
        if let Some(err) = refusal(answer, "the duplicate work item") {
            return Err(err);
        }
        match answer.field("duplicate_of").and_then(Value::as_i64) {
            Some(original) if original != work_item => Ok(Step::Complete(
                CallToolResult::text(format!(
                    "Work item #{work_item} resolved as Duplicate of #{original}"
                ))
                .with_structured(json!({
                    "workItemId": work_item,
                    "resolution": resolution,
                    "duplicateOf": original
                })),
            )),
            _ => Self::ask_duplicate(work_item),
        }
    }

    fn side_effecting(&self) -> bool {
        true
    }
}
