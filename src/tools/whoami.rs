use async_trait::async_trait;
use serde_json::{json, Value};

use super::{create_tool, form_schema, refusal, RoundInput, RoundTripTool, Step};
use crate::error::Result;
use crate::mrtr::InputRequestsBuilder;
use crate::types::mcp::{CallToolResult, TaskSupport, Tool};

const LOGIN_KEY: &str = "github_login";

/// Greets the caller by the GitHub login they supply.
pub struct WhoamiTool;

#[async_trait]
impl RoundTripTool for WhoamiTool {
    fn descriptor(&self) -> Tool {
        create_tool(
            "whoami",
            "Greet the user by their GitHub login, asking for it if needed",
            json!({"type": "object", "properties": {}}),
            TaskSupport::Forbidden,
        )
    }

    async fn step(&self, input: &RoundInput) -> Result<Step> {
        let login = match input.elicited(LOGIN_KEY) {
            Some(answer) => {
                if let Some(err) = refusal(answer, "a GitHub login") {
                    return Err(err);
                }
                answer.field("name").and_then(Value::as_str)
            }
            None => None,
        };

        match login.map(str::trim).filter(|l| !l.is_empty()) {
            Some(login) => Ok(Step::Complete(
                CallToolResult::text(format!("Hello, {login}!"))
                    .with_structured(json!({ "login": login })),
            )),
            None => Ok(Step::NeedInput(
                InputRequestsBuilder::new()
                    .elicit(
                        LOGIN_KEY,
                        "What is your GitHub login?",
                        form_schema("name", "string", "GitHub login"),
                    )
                    .build()?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::mcp::ElicitResult;
    use serde_json::Map;

    #[tokio::test]
    async fn test_asks_then_greets() {
        let tool = WhoamiTool;
        let mut input = RoundInput::default();

        let Step::NeedInput(requests) = tool.step(&input).await.unwrap() else {
            panic!("expected input request");
        };
        assert!(requests.contains_key(LOGIN_KEY));

        let mut content = Map::new();
        content.insert("name".into(), json!("octocat"));
        input
            .answers
            .insert(LOGIN_KEY.into(), ElicitResult::accept(content).into());

        let Step::Complete(result) = tool.step(&input).await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(result.first_text(), Some("Hello, octocat!"));
    }

    #[tokio::test]
    async fn test_blank_login_asks_again() {
        let mut content = Map::new();
        content.insert("name".into(), json!("  "));
        let mut input = RoundInput::default();
        input
            .answers
            .insert(LOGIN_KEY.into(), ElicitResult::accept(content).into());
        assert!(matches!(
            WhoamiTool.step(&input).await.unwrap(),
            Step::NeedInput(_)
        ));
    }
}
