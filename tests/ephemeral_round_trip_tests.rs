use serde_json::{json, Map, Value};
use std::sync::Arc;

use mcp_mrtr::client::{LocalSender, RoundTripClient};
use mcp_mrtr::config::Config;
use mcp_mrtr::error::{MrtrError, Result};
use mcp_mrtr::mrtr::Principal;
use mcp_mrtr::protocol::{JsonRpcId, JsonRpcRequest};
use mcp_mrtr::server::RequestHandler;
use mcp_mrtr::state::AppState;
use mcp_mrtr::types::mcp::{
    Content, CreateMessageResult, ElicitResult, Role, SubRequest, SubResponse,
};

fn handler_with(config: Config) -> RequestHandler {
    let (state, _rx) = AppState::new(config).unwrap();
    RequestHandler::new(state)
}

fn handler() -> RequestHandler {
    handler_with(Config::default())
}

async fn call(handler: &RequestHandler, principal: &str, params: Value) -> Value {
    let request = JsonRpcRequest::new(JsonRpcId::Number(1), "tools/call", Some(params));
    let response = handler
        .handle(&Principal::new(principal), request)
        .await
        .expect("requests always get a response");
    match response.error {
        Some(error) => json!({ "error": { "code": error.code, "message": error.message } }),
        None => response.result.unwrap(),
    }
}

fn accept(field: &str, value: Value) -> Value {
    json!({ "action": "accept", "content": { field: value } })
}

fn flip_middle_char(token: &str) -> String {
    let mut chars: Vec<char> = token.chars().collect();
    let i = chars.len() / 2;
    chars[i] = if chars[i] == 'A' { 'B' } else { 'A' };
    chars.into_iter().collect()
}

#[tokio::test]
async fn test_whoami_two_rounds() {
    let handler = handler();

    let first = call(&handler, "alice", json!({ "name": "whoami" })).await;
    let requests = first["inputRequests"].as_object().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(first["inputRequests"]["github_login"]["method"], "elicitation/create");
    let token = first["requestState"].as_str().unwrap().to_string();

    let second = call(
        &handler,
        "alice",
        json!({
            "name": "whoami",
            "inputResponses": { "github_login": accept("name", json!("octocat")) },
            "requestState": token
        }),
    )
    .await;
    assert!(second.get("inputRequests").is_none());
    assert_eq!(second["content"][0]["text"], "Hello, octocat!");
}

#[tokio::test]
async fn test_tampered_token_restarts_instead_of_failing() {
    let handler = handler();

    let first = call(&handler, "alice", json!({ "name": "whoami" })).await;
    let token = first["requestState"].as_str().unwrap();

    let second = call(
        &handler,
        "alice",
        json!({
            "name": "whoami",
            "inputResponses": { "github_login": accept("name", json!("octocat")) },
            "requestState": flip_middle_char(token)
        }),
    )
    .await;
    assert!(second.get("error").is_none());
    assert!(second["inputRequests"]["github_login"].is_object());
    assert!(second["requestState"].is_string());
}

#[tokio::test]
async fn test_multi_round_work_item_resolution() {
    let handler = handler();
    let args = json!({ "work_item_id": 1234 });

    let first = call(&handler, "alice", json!({ "name": "resolve_work_item", "arguments": args })).await;
    assert!(first["inputRequests"]["resolution"].is_object());

    let second = call(
        &handler,
        "alice",
        json!({
            "name": "resolve_work_item",
            "arguments": args,
            "inputResponses": { "resolution": accept("resolution", json!("Duplicate")) },
            "requestState": first["requestState"]
        }),
    )
    .await;
    let requests = second["inputRequests"].as_object().unwrap();
    assert_eq!(requests.keys().collect::<Vec<_>>(), vec!["duplicate_of"]);

    // Only the new answer travels with the last round; the resolution lives in the token.
    let third = call(
        &handler,
        "alice",
        json!({
            "name": "resolve_work_item",
            "arguments": args,
            "inputResponses": { "duplicate_of": accept("duplicate_of", json!(4301)) },
            "requestState": second["requestState"]
        }),
    )
    .await;
    assert_eq!(
        third["content"][0]["text"],
        "Work item #1234 resolved as Duplicate of #4301"
    );
    assert_eq!(third["structuredContent"]["duplicateOf"], 4301);
}

#[tokio::test]
async fn test_unexpected_keys_are_ignored() {
    let handler = handler();
    let first = call(&handler, "alice", json!({ "name": "whoami" })).await;

    let second = call(
        &handler,
        "alice",
        json!({
            "name": "whoami",
            "inputResponses": {
                "github_login": accept("name", json!("octocat")),
                "favourite_colour": accept("colour", json!("teal"))
            },
            "requestState": first["requestState"]
        }),
    )
    .await;
    assert_eq!(second["content"][0]["text"], "Hello, octocat!");
}

#[tokio::test]
async fn test_missing_answer_is_reasked() {
    let handler = handler();
    let first = call(&handler, "alice", json!({ "name": "whoami" })).await;

    let second = call(
        &handler,
        "alice",
        json!({
            "name": "whoami",
            "inputResponses": {},
            "requestState": first["requestState"]
        }),
    )
    .await;
    assert!(second["inputRequests"]["github_login"].is_object());
}

#[tokio::test]
async fn test_token_is_bound_to_principal() {
    let handler = handler();
    let first = call(&handler, "alice", json!({ "name": "whoami" })).await;

    let replayed = call(
        &handler,
        "mallory",
        json!({
            "name": "whoami",
            "inputResponses": { "github_login": accept("name", json!("mallory")) },
            "requestState": first["requestState"]
        }),
    )
    .await;
    assert!(replayed["inputRequests"]["github_login"].is_object());
}

#[tokio::test]
async fn test_token_is_bound_to_arguments() {
    let handler = handler();
    let first = call(
        &handler,
        "alice",
        json!({ "name": "ambiguous_add", "arguments": { "a": 1 } }),
    )
    .await;

    let changed = call(
        &handler,
        "alice",
        json!({
            "name": "ambiguous_add",
            "arguments": { "a": 100 },
            "inputResponses": { "b": accept("b", json!(2)) },
            "requestState": first["requestState"]
        }),
    )
    .await;
    assert!(changed["inputRequests"]["b"].is_object());
}

#[tokio::test]
async fn test_stateless_across_engine_instances() {
    let key = mcp_mrtr::mrtr::generate_key();
    let mut config = Config::default();
    config.token.key = Some(key);
    let a = handler_with(config.clone());
    let b = handler_with(config);

    let first = call(&a, "alice", json!({ "name": "whoami" })).await;
    let second = call(
        &b,
        "alice",
        json!({
            "name": "whoami",
            "inputResponses": { "github_login": accept("name", json!("octocat")) },
            "requestState": first["requestState"]
        }),
    )
    .await;
    assert_eq!(second["content"][0]["text"], "Hello, octocat!");
}

#[tokio::test]
async fn test_malformed_response_value_is_invalid_request() {
    let handler = handler();
    let result = call(
        &handler,
        "alice",
        json!({ "name": "whoami", "inputResponses": { "github_login": "octocat" } }),
    )
    .await;
    assert_eq!(result["error"]["code"], -32600);
}

#[tokio::test]
async fn test_decline_and_cancel_surface_as_errors() {
    let handler = handler();
    for (action, code) in [("decline", -32000), ("cancel", -32001)] {
        let first = call(
            &handler,
            "alice",
            json!({ "name": "ambiguous_add", "arguments": { "a": 5 } }),
        )
        .await;
        let result = call(
            &handler,
            "alice",
            json!({
                "name": "ambiguous_add",
                "arguments": { "a": 5 },
                "inputResponses": { "b": { "action": action } },
                "requestState": first["requestState"]
            }),
        )
        .await;
        assert_eq!(result["error"]["code"], code, "action {action}");
    }
}

#[tokio::test]
async fn test_client_drives_sampling_round_trip() {
    let handler = Arc::new(handler());
    let client = RoundTripClient::new(LocalSender::new(handler, Principal::new("alice")));

    let provider = |key: &str, request: &SubRequest| -> Result<SubResponse> {
        assert_eq!(key, "evaluation");
        assert_eq!(request.method(), "sampling/createMessage");
        Ok(CreateMessageResult {
            role: Role::Assistant,
            content: Content::text("14"),
            model: "test-model".into(),
            stop_reason: Some("endTurn".into()),
        }
        .into())
    };

    let mut args = Map::new();
    args.insert("expression".into(), json!("2 + 3 * 4"));
    let result = client
        .call_tool("eval_with_sampling", args, &provider)
        .await
        .unwrap();
    assert_eq!(result.first_text(), Some("14"));
}

#[tokio::test]
async fn test_client_reports_unknown_tool() {
    let handler = Arc::new(handler());
    let client = RoundTripClient::new(LocalSender::new(handler, Principal::new("alice")));
    let provider = |_: &str, _: &SubRequest| -> Result<SubResponse> {
        Ok(ElicitResult::cancel().into())
    };

    let err = client
        .call_tool("does_not_exist", Map::new(), &provider)
        .await
        .unwrap_err();
    assert!(matches!(err, MrtrError::Remote { code: -32602, .. }));
}

#[tokio::test]
async fn test_concurrent_retries_with_same_token_both_succeed() {
    let handler = handler();
    let args = json!({ "work_item_id": 77 });
    let first = call(&handler, "alice", json!({ "name": "resolve_work_item", "arguments": args })).await;

    let retry = json!({
        "name": "resolve_work_item",
        "arguments": args,
        "inputResponses": { "resolution": accept("resolution", json!("Fixed")) },
        "requestState": first["requestState"]
    });
    let results = futures::future::join_all(vec![
        call(&handler, "alice", retry.clone()),
        call(&handler, "alice", retry),
    ])
    .await;

    for result in &results {
        assert_eq!(result["content"][0]["text"], "Work item #77 resolved as Fixed");
    }
    assert_eq!(results[0], results[1]);
}
