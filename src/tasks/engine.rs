use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::{TaskEntry, TaskRecord, TaskStore};
use crate::config::{ReissuePolicy, TaskConfig};
use crate::error::{MrtrError, Result, TaskError};
use crate::mrtr::{ensure_task_correlation, note_issued, reconcile, Principal, WorkflowKind};
use crate::protocol::error_codes;
use crate::state::Metrics;
use crate::tools::{RoundInput, RoundTripTool, Step};
use crate::types::mcp::{
    CallToolResult, IncompleteResult, InputRequests, InputResponses, SubResponse,
    SubmitInputParams, Task, TaskStatus,
};

const TIMEOUT_AWAITING_INPUT: &str = "Task timed out waiting for input";
const TIMEOUT_WORKING: &str = "Task exceeded its time-to-live";

/// What `tasks/result` hands back: the terminal payload, or the input the
/// task is still waiting for.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPayload {
    Complete(CallToolResult),
    Incomplete(IncompleteResult),
}

impl TaskPayload {
    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            TaskPayload::Complete(result) => serde_json::to_value(result)?,
            TaskPayload::Incomplete(incomplete) => serde_json::to_value(incomplete)?,
        })
    }
}

/// Drives task-backed interactions. Correlation is by task id; the record
/// holds the gathered answers and the requests still outstanding.
pub struct TaskEngine {
    store: TaskStore,
    config: TaskConfig,
    policy: ReissuePolicy,
    max_rounds: u32,
    metrics: Arc<Metrics>,
}

impl TaskEngine {
    pub fn new(
        config: TaskConfig,
        policy: ReissuePolicy,
        max_rounds: u32,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store: TaskStore::new(),
            config,
            policy,
            max_rounds,
            metrics,
        }
    }

    /// Start `tool` as a task owned by `owner` and begin working on it.
    pub fn create(
        self: &Arc<Self>,
        owner: &Principal,
        tool: Arc<dyn RoundTripTool>,
        mut input: RoundInput,
        ttl: Option<u64>,
    ) -> Result<Task> {
        if !input.execution.can_transition(WorkflowKind::TaskBacked) {
            return Err(MrtrError::InvalidRequest(
                "interaction is already task-backed".into(),
            ));
        }
        input.execution = WorkflowKind::TaskBacked;
        let issued: BTreeSet<String> = input.answers.keys().cloned().collect();
        let now = Utc::now();
        let record = TaskRecord {
            task_id: Uuid::new_v4().to_string(),
            tool: tool.descriptor().name,
            status: TaskStatus::Working,
            status_message: None,
            created_at: now,
            last_updated_at: now,
            ttl_ms: self.config.effective_ttl_ms(ttl),
            poll_interval_ms: self.config.poll_interval_ms,
            input,
            pending: InputRequests::default(),
            issued,
            result: None,
            error: None,
            generation: 0,
        };
        let task = record.to_task();
        info!(
            task_id = %task.task_id,
            tool = %record.tool,
            ttl_ms = record.ttl_ms,
            "Task created"
        );

        let entry = Arc::new(TaskEntry::new(owner.clone(), tool, record));
        self.store.insert(entry.clone());
        self.metrics.record_task_created();
        self.spawn_step(entry, 0);

        Ok(task)
    }

    pub async fn get(&self, owner: &Principal, task_id: &str) -> Result<Task> {
        let entry = self.lookup(owner, task_id)?;
        let mut record = entry.record.lock().await;
        self.expire_if_overdue(&entry, &mut record, Utc::now());
        Ok(record.to_task())
    }

    /// The caller's tasks, oldest first.
    pub async fn list(&self, owner: &Principal) -> Vec<Task> {
        let now = Utc::now();
        let mut tasks = Vec::new();
        for entry in self.store.entries() {
            if &entry.owner != owner {
                continue;
            }
            let mut record = entry.record.lock().await;
            self.expire_if_overdue(&entry, &mut record, now);
            tasks.push(record.to_task());
        }
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Terminal payload, or an incomplete result while input is required.
    /// Waits while the task is working.
    pub async fn result(&self, owner: &Principal, task_id: &str) -> Result<TaskPayload> {
        let entry = self.lookup(owner, task_id)?;
        let mut status_rx = entry.subscribe();
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            {
                let mut record = entry.record.lock().await;
                self.expire_if_overdue(&entry, &mut record, Utc::now());
                match record.status {
                    TaskStatus::Working => {}
                    TaskStatus::InputRequired => {
                        let incomplete = IncompleteResult::new(Some(record.pending.clone()), None)?;
                        return Ok(TaskPayload::Incomplete(incomplete));
                    }
                    TaskStatus::Completed => {
                        return record.result.clone().map(TaskPayload::Complete).ok_or_else(|| {
                            MrtrError::Internal(format!("task {task_id} completed without a result"))
                        });
                    }
                    TaskStatus::Failed | TaskStatus::Cancelled => {
                        let (code, message) = record.error.clone().unwrap_or_else(|| {
                            (error_codes::INTERNAL_ERROR, format!("Task {task_id} {}", record.status))
                        });
                        return Err(MrtrError::ToolFailed { code, message });
                    }
                }
            }
            // Woken by a status change, or re-checks TTL every poll interval.
            let _ = tokio::time::timeout(poll, status_rx.changed()).await;
        }
    }

    /// Answer some or all of the task's outstanding requests.
    ///
    /// A complete answer moves the task back to `working` and resumes it; a
    /// partial one leaves it in `input_required` with the remainder pending.
    /// Repeating an already-applied submission is accepted and does nothing.
    pub async fn submit_input(self: &Arc<Self>, owner: &Principal, params: SubmitInputParams) -> Result<()> {
        ensure_task_correlation(&params)?;
        let entry = self.lookup(owner, &params.task_id)?;
        let mut record = entry.record.lock().await;
        self.expire_if_overdue(&entry, &mut record, Utc::now());

        match record.status {
            TaskStatus::InputRequired => {}
            TaskStatus::Failed | TaskStatus::Cancelled => {
                return Err(TaskError::AlreadyTerminal {
                    task_id: record.task_id.clone(),
                    status: record.status.to_string(),
                }
                .into());
            }
            TaskStatus::Working | TaskStatus::Completed => {
                if is_duplicate(&record.input.answers, &params.input_responses) {
                    debug!(task_id = %record.task_id, "Ignoring repeated input submission");
                    return Ok(());
                }
                return Err(TaskError::NotAwaitingInput {
                    task_id: record.task_id.clone(),
                    status: record.status.to_string(),
                }
                .into());
            }
        }

        let mut reconciliation = reconcile(&record.pending, &params.input_responses)?;
        if self.policy == ReissuePolicy::All {
            reconciliation.carry_over(&record.input.answers);
        }
        if !reconciliation.unexpected().is_empty() {
            self.metrics
                .record_unexpected_responses(reconciliation.unexpected().len());
        }
        let complete = reconciliation.is_complete();
        let reissue = reconciliation.reissue(&record.pending, self.policy);
        record.input.answers.extend(reconciliation.into_fulfilled());

        if !complete {
            debug!(
                task_id = %record.task_id,
                outstanding = reissue.len(),
                "Partial input; task still awaiting input"
            );
            record.pending = reissue;
            record.touch();
            return Ok(());
        }

        record.pending = InputRequests::default();
        record.set_status(TaskStatus::Working, None);
        self.metrics.task_input_resolved();
        let generation = record.generation;
        info!(task_id = %record.task_id, "Input received; task resumed");
        drop(record);

        entry.notify(TaskStatus::Working);
        self.spawn_step(entry, generation);
        Ok(())
    }

    pub async fn cancel(&self, owner: &Principal, task_id: &str) -> Result<Task> {
        let entry = self.lookup(owner, task_id)?;
        let mut record = entry.record.lock().await;
        self.expire_if_overdue(&entry, &mut record, Utc::now());

        if record.status.is_terminal() {
            return Err(TaskError::AlreadyTerminal {
                task_id: record.task_id.clone(),
                status: record.status.to_string(),
            }
            .into());
        }
        if record.status == TaskStatus::InputRequired {
            self.metrics.task_input_resolved();
        }
        let message = "Task was cancelled".to_string();
        record.error = Some((error_codes::INTERNAL_ERROR, message.clone()));
        record.set_status(TaskStatus::Cancelled, Some(message));
        record.pending = InputRequests::default();
        info!(task_id = %record.task_id, "Task cancelled");

        entry.notify(TaskStatus::Cancelled);
        Ok(record.to_task())
    }

    /// Fail overdue tasks and drop finished ones past retention.
    /// Returns how many tasks were expired.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for entry in self.store.entries() {
            let mut record = entry.record.lock().await;
            if self.expire_if_overdue(&entry, &mut record, now) {
                expired += 1;
            } else if record.is_stale(now) {
                debug!(task_id = %record.task_id, "Removing finished task past retention");
                drop(record);
                self.store.remove(&entry.task_id);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn lookup(&self, owner: &Principal, task_id: &str) -> Result<Arc<TaskEntry>> {
        self.store
            .get(task_id)
            .filter(|entry| &entry.owner == owner)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()).into())
    }

    fn expire_if_overdue(&self, entry: &TaskEntry, record: &mut TaskRecord, now: DateTime<Utc>) -> bool {
        if !record.is_overdue(now) {
            return false;
        }
        let message = if record.status == TaskStatus::InputRequired {
            self.metrics.task_input_resolved();
            TIMEOUT_AWAITING_INPUT
        } else {
            TIMEOUT_WORKING
        };
        warn!(task_id = %record.task_id, status = %record.status, "{}", message);
        record.pending = InputRequests::default();
        record.fail(error_codes::INTERNAL_ERROR, message);
        self.metrics.record_task_expired();
        self.metrics.record_task_failed();
        entry.notify(TaskStatus::Failed);
        true
    }

    fn spawn_step(self: &Arc<Self>, entry: Arc<TaskEntry>, generation: u64) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_step(entry, generation).await;
        });
    }

    async fn run_step(&self, entry: Arc<TaskEntry>, generation: u64) {
        let input = {
            let record = entry.record.lock().await;
            if record.status != TaskStatus::Working || record.generation != generation {
                return;
            }
            record.input.clone()
        };

        let outcome = entry.tool.step(&input).await;

        let mut record = entry.record.lock().await;
        if record.status != TaskStatus::Working || record.generation != generation {
            debug!(task_id = %record.task_id, "Discarding step outcome; task moved on");
            return;
        }

        match outcome {
            Ok(Step::NeedInput(requests)) if requests.is_empty() => {
                self.fail(&mut record, &MrtrError::Internal("tool asked for no input".into()));
            }
            Ok(Step::NeedInput(requests)) => {
                let fresh = note_issued(&mut record.issued, &requests);
                if fresh {
                    record.input.round += 1;
                }
                if fresh && record.input.round > self.max_rounds {
                    self.fail(&mut record, &MrtrError::RoundLimitExceeded(self.max_rounds));
                } else {
                    debug!(
                        task_id = %record.task_id,
                        round = record.input.round,
                        keys = ?requests.keys().collect::<Vec<_>>(),
                        "Task needs input"
                    );
                    record.pending = requests;
                    record.set_status(
                        TaskStatus::InputRequired,
                        Some("Waiting for input".to_string()),
                    );
                    self.metrics.task_awaiting_input();
                }
            }
            Ok(Step::Complete(result)) => {
                info!(task_id = %record.task_id, is_error = result.is_error, "Task completed");
                record.result = Some(result);
                record.set_status(TaskStatus::Completed, None);
            }
            Ok(Step::Promote { .. }) => {
                let err: MrtrError = TaskError::AlreadyPromoted(record.task_id.clone()).into();
                self.fail(&mut record, &err);
            }
            Err(e) => self.fail(&mut record, &e),
        }

        entry.notify(record.status);
    }

    fn fail(&self, record: &mut TaskRecord, error: &MrtrError) {
        warn!(task_id = %record.task_id, error = %error, "Task failed");
        record.fail(error.code(), error.to_string());
        self.metrics.record_task_failed();
    }
}

/// Every submitted key was already answered with exactly this response.
fn is_duplicate(answers: &BTreeMap<String, SubResponse>, submitted: &InputResponses) -> bool {
    !submitted.is_empty()
        && submitted.keys().all(|key| {
            let previous = answers.get(key);
            let current = submitted
                .get_raw(key)
                .and_then(|raw| serde_json::from_value::<SubResponse>(raw.clone()).ok());
            matches!((previous, current), (Some(p), Some(c)) if *p == c)
        })
}
