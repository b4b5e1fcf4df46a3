use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::mrtr::Principal;
use crate::tools::{RoundInput, RoundTripTool};
use crate::types::mcp::{CallToolResult, InputRequests, Task, TaskStatus};

/// Durable state of one task-backed interaction.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub tool: String,
    pub status: TaskStatus,
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub poll_interval_ms: u64,
    /// Arguments plus every answer gathered so far.
    pub input: RoundInput,
    /// Requests the task is waiting on while `input_required`.
    pub pending: InputRequests,
    /// Every key the task has asked for.
    pub issued: BTreeSet<String>,
    pub result: Option<CallToolResult>,
    pub error: Option<(i64, String)>,
    /// Bumped whenever the task leaves `working`, so a step started earlier
    /// cannot write its outcome over a newer state.
    pub generation: u64,
}

impl TaskRecord {
    pub fn to_task(&self) -> Task {
        Task {
            task_id: self.task_id.clone(),
            status: self.status,
            status_message: self.status_message.clone(),
            created_at: self.created_at,
            last_updated_at: self.last_updated_at,
            ttl: Some(self.ttl_ms),
            poll_interval: Some(self.poll_interval_ms),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + ttl_duration(self.ttl_ms)
    }

    /// Unfinished past its TTL.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now >= self.expires_at()
    }

    /// Finished and past its retention window.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status.is_terminal() && now >= self.last_updated_at + ttl_duration(self.ttl_ms)
    }

    pub fn set_status(&mut self, status: TaskStatus, message: Option<String>) {
        if self.status == TaskStatus::Working && status != TaskStatus::Working {
            self.generation += 1;
        }
        self.status = status;
        self.status_message = message;
        self.touch();
    }

    pub fn fail(&mut self, code: i64, message: impl Into<String>) {
        let message = message.into();
        self.error = Some((code, message.clone()));
        self.set_status(TaskStatus::Failed, Some(message));
    }

    pub fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }
}

// Keeps `created_at + ttl` far inside the representable range.
const TTL_CEILING_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

fn ttl_duration(ttl_ms: u64) -> ChronoDuration {
    ChronoDuration::milliseconds(ttl_ms.min(TTL_CEILING_MS) as i64)
}

pub struct TaskEntry {
    pub task_id: String,
    pub owner: Principal,
    pub tool: Arc<dyn RoundTripTool>,
    pub record: Mutex<TaskRecord>,
    status_tx: watch::Sender<TaskStatus>,
}

impl TaskEntry {
    pub fn new(owner: Principal, tool: Arc<dyn RoundTripTool>, record: TaskRecord) -> Self {
        let (status_tx, _) = watch::channel(record.status);
        Self {
            task_id: record.task_id.clone(),
            owner,
            tool,
            record: Mutex::new(record),
            status_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    pub fn notify(&self, status: TaskStatus) {
        self.status_tx.send_replace(status);
    }
}

#[derive(Default)]
pub struct TaskStore {
    tasks: DashMap<String, Arc<TaskEntry>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: Arc<TaskEntry>) {
        self.tasks.insert(entry.task_id.clone(), entry);
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskEntry>> {
        self.tasks.get(task_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, task_id: &str) -> Option<Arc<TaskEntry>> {
        self.tasks.remove(task_id).map(|(_, entry)| entry)
    }

    /// Snapshot of all entries; no map shard stays locked afterwards.
    pub fn entries(&self) -> Vec<Arc<TaskEntry>> {
        self.tasks.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: TaskStatus) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            task_id: "t1".into(),
            tool: "echo".into(),
            status,
            status_message: None,
            created_at: now,
            last_updated_at: now,
            ttl_ms: 1_000,
            poll_interval_ms: 100,
            input: RoundInput::default(),
            pending: InputRequests::default(),
            issued: BTreeSet::new(),
            result: None,
            error: None,
            generation: 0,
        }
    }

    #[test]
    fn test_overdue_only_when_unfinished() {
        let working = record(TaskStatus::InputRequired);
        let later = working.created_at + ChronoDuration::milliseconds(1_500);
        assert!(!working.is_overdue(working.created_at));
        assert!(working.is_overdue(later));

        let done = record(TaskStatus::Completed);
        assert!(!done.is_overdue(later));
        assert!(done.is_stale(later));
    }

    #[test]
    fn test_leaving_working_bumps_generation() {
        let mut record = record(TaskStatus::Working);
        record.set_status(TaskStatus::InputRequired, None);
        assert_eq!(record.generation, 1);
        record.set_status(TaskStatus::Working, None);
        assert_eq!(record.generation, 1);
        record.fail(-32603, "boom");
        assert_eq!(record.generation, 2);
        assert_eq!(record.error, Some((-32603, "boom".to_string())));
        assert_eq!(record.to_task().status_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let mut record = record(TaskStatus::Working);
        record.ttl_ms = u64::MAX;
        assert!(!record.is_overdue(Utc::now()));
    }
}
