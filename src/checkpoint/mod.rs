pub mod policy;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{CheckpointId, SessionId};

pub use policy::{SmartPolicyConfig, ToolClass, ToolClassifier, should_auto_checkpoint};
pub use store::CheckpointStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStrategy {
    Manual,
    PerPrompt,
    PerToolUse,
    #[default]
    Smart,
}

impl CheckpointStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStrategy::Manual => "manual",
            CheckpointStrategy::PerPrompt => "per_prompt",
            CheckpointStrategy::PerToolUse => "per_tool_use",
            CheckpointStrategy::Smart => "smart",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSettings {
    pub auto_checkpoint_enabled: bool,
    pub strategy: CheckpointStrategy,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self { auto_checkpoint_enabled: true, strategy: CheckpointStrategy::Smart }
    }
}

/// What caused a checkpoint to be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointTrigger {
    Manual,
    Auto { strategy: CheckpointStrategy },
    Fork,
}

impl CheckpointTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointTrigger::Manual => "manual",
            CheckpointTrigger::Auto { .. } => "auto",
            CheckpointTrigger::Fork => "fork",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Cumulative tokens of the log prefix covered by the checkpoint.
    pub total_tokens: u64,
    /// Most recent authored user text in that prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_prompt: Option<String>,
    pub trigger: CheckpointTrigger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub session_id: SessionId,
    pub project_id: String,
    pub message_index: usize,
    pub created_at: DateTime<Utc>,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CheckpointId>,
    pub metadata: CheckpointMetadata,
}

/// Parameters for a new checkpoint beyond its scope and index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCheckpoint {
    pub message_index: usize,
    pub label: String,
    pub parent_id: Option<CheckpointId>,
    pub trigger: CheckpointTrigger,
}

/// Orders checkpoints by log position, then creation time.
pub fn sort_checkpoints(checkpoints: &mut [Checkpoint]) {
    checkpoints.sort_by(|a, b| a.message_index.cmp(&b.message_index).then(a.created_at.cmp(&b.created_at)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_wire_names() {
        for s in [
            CheckpointStrategy::Manual,
            CheckpointStrategy::PerPrompt,
            CheckpointStrategy::PerToolUse,
            CheckpointStrategy::Smart,
        ] {
            assert_eq!(serde_json::to_string(&s).unwrap(), format!("\"{}\"", s.as_str()));
        }
    }

    #[test]
    fn settings_default_to_smart_auto() {
        let s = CheckpointSettings::default();
        assert!(s.auto_checkpoint_enabled);
        assert_eq!(s.strategy, CheckpointStrategy::Smart);
    }

    #[test]
    fn trigger_serializes_with_kind_tag() {
        let t = CheckpointTrigger::Auto { strategy: CheckpointStrategy::PerToolUse };
        let v = serde_json::to_value(t).unwrap();
        assert_eq!(v["kind"], "auto");
        assert_eq!(v["strategy"], "per_tool_use");
    }
}
