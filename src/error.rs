use std::io;
use thiserror::Error;

use crate::protocol::error_codes;

#[derive(Error, Debug)]
pub enum MrtrError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Continuation token error: {0}")]
    Token(#[from] TokenError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Duplicate input request key: {0}")]
    DuplicateInputKey(String),

    #[error("Round limit of {0} exceeded")]
    RoundLimitExceeded(u32),

    #[error("{message}")]
    ToolFailed { code: i64, message: String },

    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Reasons a presented `requestState` is not trusted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("request state failed authentication")]
    InvalidState,

    #[error("request state expired")]
    ExpiredState,

    #[error("request state is bound to a different principal")]
    IdentityMismatch,

    #[error("request state is malformed: {0}")]
    Malformed(String),

    #[error("token key error: {0}")]
    Key(String),
}

impl TokenError {
    /// Label used for logging and the rejected-token metric.
    pub fn reason(&self) -> &'static str {
        match self {
            TokenError::InvalidState => "invalid",
            TokenError::ExpiredState => "expired",
            TokenError::IdentityMismatch => "identity_mismatch",
            TokenError::Malformed(_) => "malformed",
            TokenError::Key(_) => "key",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task {task_id} is {status} and does not accept input")]
    NotAwaitingInput { task_id: String, status: String },

    #[error("Task {task_id} is already {status}")]
    AlreadyTerminal { task_id: String, status: String },

    #[error("Task-backed interactions are correlated by task id; requestState is not accepted")]
    EphemeralStateOnTask,

    #[error("Task {0} is already task-backed and cannot be promoted again")]
    AlreadyPromoted(String),
}

impl MrtrError {
    /// JSON-RPC error code for this error.
    pub fn code(&self) -> i64 {
        match self {
            MrtrError::InvalidRequest(_) | MrtrError::Token(_) => error_codes::INVALID_REQUEST,
            MrtrError::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            MrtrError::InvalidParams(_) | MrtrError::UnknownTool(_) => error_codes::INVALID_PARAMS,
            MrtrError::Task(TaskError::NotFound(_)) => error_codes::INVALID_PARAMS,
            MrtrError::Task(_) => error_codes::INVALID_REQUEST,
            MrtrError::ToolFailed { code, .. } | MrtrError::Remote { code, .. } => *code,
            MrtrError::RoundLimitExceeded(_) => error_codes::ROUND_LIMIT_EXCEEDED,
            MrtrError::Config(_)
            | MrtrError::Io(_)
            | MrtrError::Serialization(_)
            | MrtrError::DuplicateInputKey(_)
            | MrtrError::Internal(_) => error_codes::INTERNAL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, MrtrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            MrtrError::InvalidRequest("bad".into()).code(),
            error_codes::INVALID_REQUEST
        );
        assert_eq!(
            MrtrError::UnknownTool("nope".into()).code(),
            error_codes::INVALID_PARAMS
        );
        assert_eq!(
            MrtrError::Task(TaskError::NotFound("t".into())).code(),
            error_codes::INVALID_PARAMS
        );
        assert_eq!(
            MrtrError::ToolFailed {
                code: -32000,
                message: "declined".into()
            }
            .code(),
            -32000
        );
        assert_eq!(
            MrtrError::RoundLimitExceeded(8).code(),
            error_codes::ROUND_LIMIT_EXCEEDED
        );
    }

    #[test]
    fn test_token_error_reasons() {
        assert_eq!(TokenError::InvalidState.reason(), "invalid");
        assert_eq!(TokenError::ExpiredState.reason(), "expired");
        assert_eq!(TokenError::IdentityMismatch.reason(), "identity_mismatch");
    }
}
