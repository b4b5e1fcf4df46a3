//! Stateless multi round-trip driver for `tools/call`.
//!
//! Nothing is stored between rounds. Progress travels in the `requestState`
//! token the client echoes back; any instance holding the key can continue
//! an interaction another instance started.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::bundle::{note_issued, reconcile};
use super::replay::{replay_key, ReplayCache};
use super::token::TokenCodec;
use super::transition::validate_retry;
use super::Principal;
use crate::config::ReissuePolicy;
use crate::error::{MrtrError, Result};
use crate::state::Metrics;
use crate::tasks::TaskEngine;
use crate::tools::{RoundInput, RoundTripTool, Step, ToolRegistry};
use crate::types::mcp::{
    CallToolParams, CallToolResult, CreateTaskResult, IncompleteResult, InputRequests,
    SubResponse, TaskSupport,
};

/// Server context sealed inside `requestState`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestState {
    ToolCall(ToolCallState),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ToolCallState {
    pub tool: String,
    pub arguments_digest: String,
    /// Rounds that asked at least one new question.
    pub round: u32,
    /// Requests issued with this token.
    pub pending: InputRequests,
    /// Every key asked so far, including ones already answered.
    #[serde(default)]
    pub issued: BTreeSet<String>,
    /// Answers gathered in earlier rounds.
    pub answers: BTreeMap<String, SubResponse>,
}

impl ToolCallState {
    fn fresh(tool: &str, arguments_digest: &str) -> Self {
        Self {
            tool: tool.to_string(),
            arguments_digest: arguments_digest.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallOutcome {
    Complete(CallToolResult),
    Incomplete(IncompleteResult),
    TaskCreated(CreateTaskResult),
}

impl ToolCallOutcome {
    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            ToolCallOutcome::Complete(result) => serde_json::to_value(result)?,
            ToolCallOutcome::Incomplete(incomplete) => serde_json::to_value(incomplete)?,
            ToolCallOutcome::TaskCreated(created) => serde_json::to_value(created)?,
        })
    }
}

pub fn arguments_digest(tool: &str, arguments: &Map<String, Value>) -> String {
    let material = serde_json::to_vec(&(tool, arguments)).unwrap_or_default();
    format!("{:x}", Sha256::digest(&material))
}

pub struct EphemeralEngine {
    tools: Arc<ToolRegistry>,
    codec: TokenCodec,
    tasks: Arc<TaskEngine>,
    replay: Arc<ReplayCache>,
    policy: ReissuePolicy,
    max_rounds: u32,
    metrics: Arc<Metrics>,
}

impl EphemeralEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tools: Arc<ToolRegistry>,
        codec: TokenCodec,
        tasks: Arc<TaskEngine>,
        replay: Arc<ReplayCache>,
        policy: ReissuePolicy,
        max_rounds: u32,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            tools,
            codec,
            tasks,
            replay,
            policy,
            max_rounds,
            metrics,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run one round of `tools/call`.
    pub async fn call_tool(&self, principal: &Principal, params: CallToolParams) -> Result<ToolCallOutcome> {
        let tool = self
            .tools
            .get(&params.name)
            .ok_or_else(|| MrtrError::UnknownTool(params.name.clone()))?;
        validate_retry(&params)?;
        self.metrics.record_round();

        let digest = arguments_digest(&params.name, &params.arguments);
        let mut state = self.restore_state(principal, &params, &digest);

        // Answers only count against what the restored state says was asked.
        if let Some(responses) = &params.input_responses {
            let mut reconciliation = reconcile(&state.pending, responses)?;
            if self.policy == ReissuePolicy::All {
                reconciliation.carry_over(&state.answers);
            }
            if !reconciliation.unexpected().is_empty() {
                self.metrics
                    .record_unexpected_responses(reconciliation.unexpected().len());
            }
            let reissue = reconciliation.reissue(&state.pending, self.policy);
            state.answers.extend(reconciliation.into_fulfilled());

            if !reissue.is_empty() {
                debug!(
                    tool = %params.name,
                    round = state.round,
                    missing = ?reissue.keys().collect::<Vec<_>>(),
                    "Reconciliation incomplete; asking again"
                );
                state.pending = reissue.clone();
                return self.incomplete(principal, reissue, &state);
            }
        } else if !state.pending.is_empty() {
            // Echoed state with no answers at all: ask the same questions.
            let pending = state.pending.clone();
            return self.incomplete(principal, pending, &state);
        }
        state.pending = InputRequests::default();

        let descriptor = tool.descriptor();
        if let Some(task) = &params.task {
            if descriptor.task_support() == TaskSupport::Forbidden {
                return Err(MrtrError::InvalidParams(format!(
                    "tool '{}' does not support task-backed execution",
                    params.name
                )));
            }
            return self.promote(principal, tool, &params, state, task.ttl);
        }
        if descriptor.task_support() == TaskSupport::Required {
            return Err(MrtrError::InvalidParams(format!(
                "tool '{}' must be called as a task",
                params.name
            )));
        }

        let cache_key = tool
            .side_effecting()
            .then(|| replay_key(principal, &params.name, &digest, &state.answers));
        if let Some(key) = &cache_key {
            if let Some(result) = self.replay.get(key) {
                debug!(tool = %params.name, "Returning replayed result");
                self.metrics.record_replay();
                self.metrics.record_terminal();
                return Ok(ToolCallOutcome::Complete(result));
            }
        }

        let input = RoundInput {
            arguments: params.arguments.clone(),
            answers: state.answers.clone(),
            round: state.round,
            ..Default::default()
        };

        match tool.step(&input).await? {
            Step::NeedInput(requests) if requests.is_empty() => Err(MrtrError::Internal(format!(
                "tool '{}' asked for no input",
                params.name
            ))),
            Step::NeedInput(requests) => {
                // Asking again for something already asked never hits the cap.
                if note_issued(&mut state.issued, &requests) {
                    state.round += 1;
                    if state.round > self.max_rounds {
                        warn!(tool = %params.name, rounds = state.round, "Round limit exceeded");
                        return Err(MrtrError::RoundLimitExceeded(self.max_rounds));
                    }
                }
                state.pending = requests.clone();
                self.incomplete(principal, requests, &state)
            }
            Step::Complete(result) => {
                if let Some(key) = cache_key {
                    self.replay.insert(key, result.clone());
                }
                info!(tool = %params.name, rounds = state.round, "Tool call completed");
                self.metrics.record_terminal();
                Ok(ToolCallOutcome::Complete(result))
            }
            Step::Promote { ttl } => self.promote(principal, tool, &params, state, ttl),
        }
    }

    /// Validated context from the echoed token, or a fresh start.
    fn restore_state(&self, principal: &Principal, params: &CallToolParams, digest: &str) -> ToolCallState {
        let Some(token) = params.request_state.as_deref().filter(|t| !t.is_empty()) else {
            return ToolCallState::fresh(&params.name, digest);
        };

        match self.codec.validate::<RequestState>(token, principal) {
            Ok(RequestState::ToolCall(state))
                if state.tool == params.name && state.arguments_digest == digest =>
            {
                state
            }
            Ok(RequestState::ToolCall(_)) => {
                warn!(
                    tool = %params.name,
                    reason = "context_mismatch",
                    "Request state belongs to a different call; starting over"
                );
                self.metrics.record_rejected_token("context_mismatch");
                ToolCallState::fresh(&params.name, digest)
            }
            Err(e) => {
                warn!(
                    tool = %params.name,
                    reason = e.reason(),
                    "Rejected request state; starting over: {}",
                    e
                );
                self.metrics.record_rejected_token(e.reason());
                ToolCallState::fresh(&params.name, digest)
            }
        }
    }

    fn incomplete(
        &self,
        principal: &Principal,
        requests: InputRequests,
        state: &ToolCallState,
    ) -> Result<ToolCallOutcome> {
        let token = self
            .codec
            .mint(&RequestState::ToolCall(state.clone()), principal)?;
        self.metrics.record_incomplete();
        Ok(ToolCallOutcome::Incomplete(IncompleteResult::new(
            Some(requests),
            Some(token),
        )?))
    }

    fn promote(
        &self,
        principal: &Principal,
        tool: Arc<dyn RoundTripTool>,
        params: &CallToolParams,
        state: ToolCallState,
        ttl: Option<u64>,
    ) -> Result<ToolCallOutcome> {
        let ttl = params.task.as_ref().and_then(|t| t.ttl).or(ttl);
        let input = RoundInput {
            arguments: params.arguments.clone(),
            answers: state.answers,
            round: state.round,
            ..Default::default()
        };
        let task = self.tasks.create(principal, tool, input, ttl)?;
        info!(tool = %params.name, task_id = %task.task_id, "Interaction continues as a task");
        self.metrics.record_terminal();
        Ok(ToolCallOutcome::TaskCreated(CreateTaskResult { task }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use crate::tools::testing::PairTool;
    use crate::types::mcp::{ElicitResult, InputResponses};
    use serde_json::json;
    use std::time::Duration;

    fn engine_with(policy: ReissuePolicy, max_rounds: u32) -> EphemeralEngine {
        let metrics = Arc::new(Metrics::new());
        let mut tools = ToolRegistry::with_builtin_tools();
        tools.register(Arc::new(PairTool));
        EphemeralEngine::new(
            Arc::new(tools),
            TokenCodec::new(&[7u8; 32], Duration::from_secs(60)),
            Arc::new(TaskEngine::new(
                TaskConfig::default(),
                policy,
                max_rounds,
                metrics.clone(),
            )),
            Arc::new(ReplayCache::new(Duration::from_secs(60))),
            policy,
            max_rounds,
            metrics,
        )
    }

    fn engine() -> EphemeralEngine {
        engine_with(ReissuePolicy::MissingOnly, 8)
    }

    fn value(key: &str, text: &str) -> InputResponses {
        let mut content = Map::new();
        content.insert("value".into(), json!(text));
        InputResponses::new().with(key, ElicitResult::accept(content))
    }

    fn incomplete(outcome: ToolCallOutcome) -> IncompleteResult {
        match outcome {
            ToolCallOutcome::Incomplete(incomplete) => incomplete,
            other => panic!("expected incomplete result, got {other:?}"),
        }
    }

    fn asked(incomplete: &IncompleteResult) -> Vec<&str> {
        incomplete
            .input_requests
            .as_ref()
            .map(|r| r.keys().collect())
            .unwrap_or_default()
    }

    fn login(name: &str) -> InputResponses {
        let mut content = Map::new();
        content.insert("name".into(), json!(name));
        InputResponses::new().with("github_login", ElicitResult::accept(content))
    }

    #[tokio::test]
    async fn test_whoami_two_rounds() {
        let engine = engine();
        let alice = Principal::new("alice");
        let params = CallToolParams::new("whoami", Map::new());

        let ToolCallOutcome::Incomplete(first) =
            engine.call_tool(&alice, params.clone()).await.unwrap()
        else {
            panic!("expected incomplete result");
        };
        let token = first.request_state.clone().unwrap();
        assert!(token.starts_with("mrtr1."));

        let ToolCallOutcome::Complete(result) = engine
            .call_tool(&alice, params.retry(login("octocat"), Some(token)))
            .await
            .unwrap()
        else {
            panic!("expected terminal result");
        };
        assert_eq!(result.first_text(), Some("Hello, octocat!"));
    }

    #[tokio::test]
    async fn test_token_from_other_principal_restarts() {
        let engine = engine();
        let params = CallToolParams::new("resolve_work_item", {
            let mut m = Map::new();
            m.insert("work_item_id".into(), json!(1));
            m
        });
        let ToolCallOutcome::Incomplete(first) = engine
            .call_tool(&Principal::new("alice"), params.clone())
            .await
            .unwrap()
        else {
            panic!("expected incomplete result");
        };

        let mut content = Map::new();
        content.insert("resolution".into(), json!("Fixed"));
        let responses = InputResponses::new().with("resolution", ElicitResult::accept(content));

        // Bob's answers are dropped because his fresh state expects nothing yet.
        let outcome = engine
            .call_tool(
                &Principal::new("bob"),
                params.retry(responses, first.request_state),
            )
            .await
            .unwrap();
        let ToolCallOutcome::Incomplete(again) = outcome else {
            panic!("expected restart");
        };
        assert!(again.input_requests.unwrap().contains_key("resolution"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let err = engine()
            .call_tool(&Principal::new("a"), CallToolParams::new("nope", Map::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, MrtrError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_task_request_on_forbidden_tool() {
        let mut params = CallToolParams::new("whoami", Map::new());
        params.task = Some(Default::default());
        let err = engine()
            .call_tool(&Principal::new("a"), params)
            .await
            .unwrap_err();
        assert!(matches!(err, MrtrError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn test_repeated_invalid_answer_is_asked_again_past_round_cap() {
        let engine = engine_with(ReissuePolicy::MissingOnly, 2);
        let alice = Principal::new("alice");
        let mut arguments = Map::new();
        arguments.insert("work_item_id".into(), json!(4));
        let params = CallToolParams::new("resolve_work_item", arguments);

        let mut current = incomplete(engine.call_tool(&alice, params.clone()).await.unwrap());
        let mut content = Map::new();
        content.insert("resolution".into(), json!("Shrug"));
        let shrug = InputResponses::new().with("resolution", ElicitResult::accept(content));

        for _ in 0..6 {
            let retry = params.retry(shrug.clone(), current.request_state.clone());
            current = incomplete(engine.call_tool(&alice, retry).await.unwrap());
            assert_eq!(asked(&current), vec!["resolution"]);
        }
    }

    #[tokio::test]
    async fn test_new_questions_past_round_cap_fail_visibly() {
        let engine = engine_with(ReissuePolicy::MissingOnly, 0);
        let err = engine
            .call_tool(&Principal::new("alice"), CallToolParams::new("pair", Map::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, MrtrError::RoundLimitExceeded(0)));
        assert_eq!(err.code(), crate::protocol::error_codes::ROUND_LIMIT_EXCEEDED);
    }

    #[tokio::test]
    async fn test_partial_answers_reissue_missing_only() {
        let engine = engine();
        let alice = Principal::new("alice");
        let params = CallToolParams::new("pair", Map::new());

        let first = incomplete(engine.call_tool(&alice, params.clone()).await.unwrap());
        assert_eq!(asked(&first), vec!["first", "second"]);

        let partial = incomplete(
            engine
                .call_tool(&alice, params.retry(value("first", "one"), first.request_state))
                .await
                .unwrap(),
        );
        assert_eq!(asked(&partial), vec!["second"]);

        let ToolCallOutcome::Complete(result) = engine
            .call_tool(&alice, params.retry(value("second", "two"), partial.request_state))
            .await
            .unwrap()
        else {
            panic!("expected terminal result");
        };
        assert_eq!(result.first_text(), Some("one two"));
    }

    #[tokio::test]
    async fn test_partial_answers_reissue_all_and_keep_earlier_answers() {
        let engine = engine_with(ReissuePolicy::All, 8);
        let alice = Principal::new("alice");
        let params = CallToolParams::new("pair", Map::new());

        let first = incomplete(engine.call_tool(&alice, params.clone()).await.unwrap());
        let partial = incomplete(
            engine
                .call_tool(&alice, params.retry(value("first", "one"), first.request_state))
                .await
                .unwrap(),
        );
        assert_eq!(asked(&partial), vec!["first", "second"]);

        let ToolCallOutcome::Complete(result) = engine
            .call_tool(&alice, params.retry(value("second", "two"), partial.request_state))
            .await
            .unwrap()
        else {
            panic!("expected terminal result");
        };
        assert_eq!(result.first_text(), Some("one two"));
    }

    #[test]
    fn test_arguments_digest_is_stable() {
        let mut a = Map::new();
        a.insert("x".into(), json!(1));
        a.insert("y".into(), json!(2));
        let mut b = Map::new();
        b.insert("y".into(), json!(2));
        b.insert("x".into(), json!(1));
        assert_eq!(arguments_digest("t", &a), arguments_digest("t", &b));
        assert_ne!(arguments_digest("t", &a), arguments_digest("u", &a));
    }
}
