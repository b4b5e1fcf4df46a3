//! Wire types for multi round-trip requests.
//!
//! A request that cannot finish without more input answers with an
//! [`IncompleteResult`] carrying named [`SubRequest`]s and/or an opaque
//! `requestState`. The client answers each key with a [`SubResponse`] and
//! retries with [`InputResponses`] attached.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::common::{Content, Role};
use super::tasks::TaskMetadata;
use crate::error::{MrtrError, Result};

/// Server-initiated operation the client must perform on the server's behalf.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", content = "params")]
pub enum SubRequest {
    #[serde(rename = "elicitation/create")]
    Elicitation(ElicitRequestParams),

    #[serde(rename = "sampling/createMessage")]
    Sampling(CreateMessageRequestParams),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubRequestKind {
    Elicitation,
    Sampling,
}

impl SubRequest {
    /// Elicit a form from the user.
    pub fn elicit(message: impl Into<String>, requested_schema: Value) -> Self {
        SubRequest::Elicitation(ElicitRequestParams {
            message: message.into(),
            requested_schema,
        })
    }

    pub fn kind(&self) -> SubRequestKind {
        match self {
            SubRequest::Elicitation(_) => SubRequestKind::Elicitation,
            SubRequest::Sampling(_) => SubRequestKind::Sampling,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            SubRequest::Elicitation(_) => "elicitation/create",
            SubRequest::Sampling(_) => "sampling/createMessage",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElicitRequestParams {
    pub message: String,
    pub requested_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequestParams {
    pub messages: Vec<SamplingMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_preferences: Option<ModelPreferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingMessage {
    pub role: Role,
    pub content: Content,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints: Option<Vec<ModelHint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_priority: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_priority: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intelligence_priority: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ElicitAction {
    Accept,
    Decline,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElicitResult {
    pub action: ElicitAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Map<String, Value>>,
}

impl ElicitResult {
    pub fn accept(content: Map<String, Value>) -> Self {
        Self {
            action: ElicitAction::Accept,
            content: Some(content),
        }
    }

    pub fn decline() -> Self {
        Self {
            action: ElicitAction::Decline,
            content: None,
        }
    }

    pub fn cancel() -> Self {
        Self {
            action: ElicitAction::Cancel,
            content: None,
        }
    }

    /// Field of an accepted form, `None` when declined/cancelled or absent.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self.action {
            ElicitAction::Accept => self.content.as_ref().and_then(|c| c.get(name)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageResult {
    pub role: Role,
    pub content: Content,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// The client's answer to one [`SubRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SubResponse {
    Elicit(ElicitResult),
    Sampling(CreateMessageResult),
}

impl SubResponse {
    /// Whether this response is the right shape to answer `request`.
    pub fn answers(&self, request: &SubRequest) -> bool {
        matches!(
            (self, request.kind()),
            (SubResponse::Elicit(_), SubRequestKind::Elicitation)
                | (SubResponse::Sampling(_), SubRequestKind::Sampling)
        )
    }

    pub fn as_elicit(&self) -> Option<&ElicitResult> {
        match self {
            SubResponse::Elicit(result) => Some(result),
            _ => None,
        }
    }

    pub fn as_sampling(&self) -> Option<&CreateMessageResult> {
        match self {
            SubResponse::Sampling(result) => Some(result),
            _ => None,
        }
    }
}

impl From<ElicitResult> for SubResponse {
    fn from(result: ElicitResult) -> Self {
        SubResponse::Elicit(result)
    }
}

impl From<CreateMessageResult> for SubResponse {
    fn from(result: CreateMessageResult) -> Self {
        SubResponse::Sampling(result)
    }
}

/// Named sub-requests issued in one round. Keys are unique by construction;
/// see [`crate::mrtr::bundle::build_request_map`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct InputRequests(BTreeMap<String, SubRequest>);

impl InputRequests {
    pub(crate) fn from_map(map: BTreeMap<String, SubRequest>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&SubRequest> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SubRequest)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Requests restricted to `keys`, in key order.
    pub fn subset<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Self {
        let mut map = BTreeMap::new();
        for key in keys {
            if let Some(request) = self.0.get(key) {
                map.insert(key.to_string(), request.clone());
            }
        }
        Self(map)
    }
}

/// Responses attached to a retried request, keyed like [`InputRequests`].
///
/// Values are held as raw JSON: a key the server no longer expects is dropped
/// without ever being decoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct InputResponses(BTreeMap<String, Value>);

impl InputResponses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, response: impl Into<SubResponse>) -> Self {
        self.insert(key, response);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, response: impl Into<SubResponse>) {
        let value = serde_json::to_value(response.into()).unwrap_or(Value::Null);
        self.0.insert(key.into(), value);
    }

    pub fn insert_raw(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Non-terminal answer to a request that needs more input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncompleteResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_requests: Option<InputRequests>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_state: Option<String>,
}

impl IncompleteResult {
    /// At least one of the two fields must carry something.
    pub fn new(input_requests: Option<InputRequests>, request_state: Option<String>) -> Result<Self> {
        let input_requests = input_requests.filter(|r| !r.is_empty());
        let request_state = request_state.filter(|s| !s.is_empty());
        if input_requests.is_none() && request_state.is_none() {
            return Err(MrtrError::Internal(
                "incomplete result needs input requests or request state".into(),
            ));
        }
        Ok(Self {
            input_requests,
            request_state,
        })
    }

    /// Whether a result payload is an incomplete result rather than a terminal one.
    pub fn is_incomplete_payload(value: &Value) -> bool {
        value.get("inputRequests").is_some() || value.get("requestState").is_some()
    }
}

/// `tools/call` params, including the retry augmentation of a round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Present when the caller asks for task-backed execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_responses: Option<InputResponses>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_state: Option<String>,
}

impl CallToolParams {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
            ..Default::default()
        }
    }

    /// Same call retried with answers and the echoed state.
    pub fn retry(&self, input_responses: InputResponses, request_state: Option<String>) -> Self {
        Self {
            name: self.name.clone(),
            arguments: self.arguments.clone(),
            task: self.task.clone(),
            input_responses: Some(input_responses),
            request_state,
        }
    }
}
