//! Multi round-trip request machinery: request bundles, continuation tokens,
//! the stateless ephemeral engine and the replay cache.

pub mod bundle;
pub mod ephemeral;
pub mod replay;
pub mod token;
pub mod transition;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use bundle::{
    build_request_map, note_issued, reconcile, InputRequestsBuilder, KeyOutcome, Reconciliation,
};
pub use ephemeral::{EphemeralEngine, RequestState, ToolCallOutcome, ToolCallState};
pub use replay::{replay_key, ReplayCache};
pub use token::{decode_key, generate_key, TokenCodec};
pub use transition::{
    ensure_task_correlation, validate_call_shape, validate_input_shape, validate_responses,
    validate_retry, WorkflowKind,
};

/// Authenticated identity a request is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
