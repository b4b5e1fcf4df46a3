use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// MCP Protocol version 2025-06-18 (adds elicitation)
    V20250618,
    /// MCP Protocol version 2025-11-25 (adds tasks)
    V20251125,
}

impl ProtocolVersion {
    pub const LATEST: ProtocolVersion = ProtocolVersion::V20251125;

    /// Parse the version a client requested during `initialize`.
    ///
    /// Unsupported versions fall back to the latest version we speak.
    /// Returns (version, is_supported) tuple.
    pub fn from_string(s: &str) -> (Self, bool) {
        match s {
            "2025-06-18" => (Self::V20250618, true),
            "2025-11-25" => (Self::V20251125, true),
            unsupported => {
                tracing::warn!(
                    requested_version = unsupported,
                    supported_versions = ?["2025-06-18", "2025-11-25"],
                    "Client requested unsupported protocol version, offering latest"
                );
                (Self::LATEST, false)
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V20250618 => "2025-06-18",
            Self::V20251125 => "2025-11-25",
        }
    }

    /// Whether the task-backed workflow (`tasks/*`) is available.
    pub fn supports_tasks(&self) -> bool {
        matches!(self, Self::V20251125)
    }
}
