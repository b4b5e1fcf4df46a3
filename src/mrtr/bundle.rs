//! Construction of input-request maps and reconciliation of the responses
//! a client sends back. Shared by the ephemeral and task-backed engines.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::ReissuePolicy;
use crate::error::{MrtrError, Result};
use crate::types::mcp::{
    CreateMessageRequestParams, InputRequests, InputResponses, SubRequest, SubResponse,
};

/// Build a request map, rejecting duplicate keys.
pub fn build_request_map<K: Into<String>>(
    pending: impl IntoIterator<Item = (K, SubRequest)>,
) -> Result<InputRequests> {
    let mut map = BTreeMap::new();
    for (key, request) in pending {
        let key = key.into();
        if map.contains_key(&key) {
            return Err(MrtrError::DuplicateInputKey(key));
        }
        map.insert(key, request);
    }
    Ok(InputRequests::from_map(map))
}

/// Fluent form of [`build_request_map`] for tool handlers.
#[derive(Debug, Default)]
pub struct InputRequestsBuilder {
    pending: Vec<(String, SubRequest)>,
}

impl InputRequestsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn elicit(
        mut self,
        key: impl Into<String>,
        message: impl Into<String>,
        requested_schema: Value,
    ) -> Self {
        self.pending
            .push((key.into(), SubRequest::elicit(message, requested_schema)));
        self
    }

    pub fn sample(mut self, key: impl Into<String>, params: CreateMessageRequestParams) -> Self {
        self.pending.push((key.into(), SubRequest::Sampling(params)));
        self
    }

    pub fn build(self) -> Result<InputRequests> {
        build_request_map(self.pending)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyOutcome {
    Fulfilled(SubResponse),
    Missing,
}

/// Per-key result of matching responses against expected requests.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    outcomes: BTreeMap<String, KeyOutcome>,
    unexpected: Vec<String>,
}

impl Reconciliation {
    /// Every expected key was answered.
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| matches!(o, KeyOutcome::Fulfilled(_)))
    }

    pub fn outcome(&self, key: &str) -> Option<&KeyOutcome> {
        self.outcomes.get(key)
    }

    pub fn missing_keys(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, KeyOutcome::Missing))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Response keys nobody asked for. Dropped, never an error.
    pub fn unexpected(&self) -> &[String] {
        &self.unexpected
    }

    /// Requests to send again under `policy`; empty when complete.
    pub fn reissue(&self, requests: &InputRequests, policy: ReissuePolicy) -> InputRequests {
        if self.is_complete() {
            return InputRequests::default();
        }
        match policy {
            ReissuePolicy::MissingOnly => requests.subset(self.missing_keys()),
            ReissuePolicy::All => requests.clone(),
        }
    }

    /// Treat keys answered in an earlier round as answered now unless this
    /// round carried a usable response of its own.
    pub fn carry_over(&mut self, earlier: &BTreeMap<String, SubResponse>) {
        for (key, outcome) in self.outcomes.iter_mut() {
            if *outcome == KeyOutcome::Missing {
                if let Some(previous) = earlier.get(key) {
                    *outcome = KeyOutcome::Fulfilled(previous.clone());
                }
            }
        }
    }

    pub fn into_fulfilled(self) -> BTreeMap<String, SubResponse> {
        self.outcomes
            .into_iter()
            .filter_map(|(k, o)| match o {
                KeyOutcome::Fulfilled(response) => Some((k, response)),
                KeyOutcome::Missing => None,
            })
            .collect()
    }
}

/// Record the keys of `requests` as issued. True when at least one of them
/// was never asked before; only such rounds count against the round cap.
pub fn note_issued(issued: &mut BTreeSet<String>, requests: &InputRequests) -> bool {
    let mut fresh = false;
    for key in requests.keys() {
        fresh |= issued.insert(key.to_string());
    }
    fresh
}

/// Match `responses` against `requests`.
///
/// A response of the wrong kind for its key counts as missing. A response that
/// does not parse as any `SubResponse` is a hard error for expected keys only;
/// unexpected keys are never decoded.
pub fn reconcile(requests: &InputRequests, responses: &InputResponses) -> Result<Reconciliation> {
    let mut reconciliation = Reconciliation::default();

    for (key, request) in requests.iter() {
        let outcome = match responses.get_raw(key) {
            None | Some(Value::Null) => KeyOutcome::Missing,
            Some(raw) => {
                let response: SubResponse = serde_json::from_value(raw.clone()).map_err(|e| {
                    MrtrError::InvalidRequest(format!("inputResponses.{key} is malformed: {e}"))
                })?;
                if response.answers(request) {
                    KeyOutcome::Fulfilled(response)
                } else {
                    tracing::debug!(
                        key,
                        expected = request.method(),
                        "Response kind does not match request; asking again"
                    );
                    KeyOutcome::Missing
                }
            }
        };
        reconciliation.outcomes.insert(key.to_string(), outcome);
    }

    reconciliation.unexpected = responses
        .keys()
        .filter(|k| !requests.contains_key(k))
        .map(str::to_string)
        .collect();
    if !reconciliation.unexpected.is_empty() {
        tracing::debug!(
            keys = ?reconciliation.unexpected,
            "Dropping unexpected input responses"
        );
    }

    Ok(reconciliation)
}
