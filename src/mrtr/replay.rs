use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::Principal;
use crate::types::mcp::{CallToolResult, SubResponse};

/// Content hash of a fully reconciled round.
pub fn replay_key(
    principal: &Principal,
    tool: &str,
    arguments_digest: &str,
    answers: &BTreeMap<String, SubResponse>,
) -> String {
    #[derive(Serialize)]
    struct Material<'a> {
        principal: &'a str,
        tool: &'a str,
        arguments: &'a str,
        answers: &'a BTreeMap<String, SubResponse>,
    }

    let material = Material {
        principal: principal.as_str(),
        tool,
        arguments: arguments_digest,
        answers,
    };
    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

/// Terminal results of side-effecting tools, so a duplicate final round
/// returns the first result instead of executing twice.
#[derive(Debug)]
pub struct ReplayCache {
    entries: DashMap<String, (Instant, CallToolResult)>,
    ttl: Duration,
}

impl ReplayCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub fn get(&self, key: &str) -> Option<CallToolResult> {
        if !self.enabled() {
            return None;
        }
        let hit = self.entries.get(key).and_then(|entry| {
            let (stored_at, result) = entry.value();
            (stored_at.elapsed() < self.ttl).then(|| result.clone())
        });
        if hit.is_none() {
            self.entries.remove(key);
        }
        hit
    }

    pub fn insert(&self, key: String, result: CallToolResult) {
        if self.enabled() {
            self.entries.insert(key, (Instant::now(), result));
        }
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, (stored_at, _)| stored_at.elapsed() < self.ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
