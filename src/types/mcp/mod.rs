/// MCP wire types used by the round-trip engines
///
/// `common` holds the general protocol types, `mrtr` the multi round-trip
/// payloads and `tasks` the task-backed workflow types.
pub mod common;
pub mod mrtr;
pub mod tasks;

// Re-export common types
pub use common::*;
pub use mrtr::*;
pub use tasks::*;
