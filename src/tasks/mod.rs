//! Task-backed round trips: durable records, explicit input submission and
//! TTL expiry.

mod engine;
mod reaper;
mod store;

pub use engine::{TaskEngine, TaskPayload};
pub use reaper::TaskReaper;
pub use store::{TaskEntry, TaskRecord, TaskStore};
