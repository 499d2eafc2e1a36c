use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::{CheckpointSettings, CheckpointStrategy};
use crate::model::{ControlEvent, MessageKind, StreamEvent, extract_tool_calls};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    Mutating,
    ReadOnly,
}

/// Tool-name mapping used by the smart strategy. Names compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartPolicyConfig {
    pub mutating_tools: Vec<String>,
    pub shell_tools: Vec<String>,
    /// Regexes for shell commands that leave the workspace untouched.
    pub read_only_commands: Vec<String>,
}

impl Default for SmartPolicyConfig {
    fn default() -> Self {
        Self {
            mutating_tools: ["write", "edit", "multiedit", "notebookedit"].map(String::from).to_vec(),
            shell_tools: vec!["bash".into()],
            read_only_commands: vec![
                r"^(ls|cat|head|tail|wc|pwd|echo|grep|rg|find|which|tree|stat|file|du|df)(\s|$)".into(),
                r"^git\s+(status|log|diff|show|branch|blame)(\s|$)".into(),
                r"^cargo\s+(check|clippy|tree|metadata)(\s|$)".into(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolClassifier {
    mutating: HashSet<String>,
    shell: HashSet<String>,
    read_only_commands: Vec<Regex>,
}

impl Default for ToolClassifier {
    fn default() -> Self {
        Self::from_config(&SmartPolicyConfig::default())
    }
}

impl ToolClassifier {
    /// Invalid command patterns are skipped with a warning.
    pub fn from_config(config: &SmartPolicyConfig) -> Self {
        let lower = |names: &[String]| names.iter().map(|n| n.to_lowercase()).collect::<HashSet<_>>();
        let read_only_commands = config
            .read_only_commands
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "ignoring invalid read-only command pattern");
                    None
                }
            })
            .collect();
        Self { mutating: lower(&config.mutating_tools), shell: lower(&config.shell_tools), read_only_commands }
    }

    pub fn classify(&self, tool_name: &str, input: &Value) -> ToolClass {
        let name = tool_name.to_lowercase();
        if self.mutating.contains(&name) {
            return ToolClass::Mutating;
        }
        if self.shell.contains(&name) {
            return match input.get("command").and_then(Value::as_str) {
                Some(cmd) if self.is_read_only_command(cmd) => ToolClass::ReadOnly,
                _ => ToolClass::Mutating,
            };
        }
        ToolClass::ReadOnly
    }

    /// Every segment of a command chain must be a known read-only command, and
    /// nothing may be redirected into a file.
    fn is_read_only_command(&self, command: &str) -> bool {
        if command.contains('>') {
            return false;
        }
        command
            .split(['|', ';', '&'])
            .map(str::trim)
            .filter(|seg| !seg.is_empty())
            .all(|seg| self.read_only_commands.iter().any(|re| re.is_match(seg)))
    }
}

fn completes_turn(entry: &StreamEvent) -> bool {
    match entry {
        StreamEvent::Control(ControlEvent::Response { .. }) => true,
        StreamEvent::Message(m) => m.kind == MessageKind::Result,
        _ => false,
    }
}

/// Whether `last` should trigger an automatic checkpoint under `settings`.
pub fn should_auto_checkpoint(settings: &CheckpointSettings, classifier: &ToolClassifier, last: &StreamEvent) -> bool {
    if !settings.auto_checkpoint_enabled {
        return false;
    }
    match settings.strategy {
        CheckpointStrategy::Manual => false,
        CheckpointStrategy::PerPrompt => completes_turn(last),
        CheckpointStrategy::PerToolUse => last.message().is_some_and(|m| !extract_tool_calls(m).is_empty()),
        CheckpointStrategy::Smart => last.message().is_some_and(|m| {
            extract_tool_calls(m)
                .iter()
                .any(|call| classifier.classify(&call.name, &call.input) == ToolClass::Mutating)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentBlock, Message, Usage};
    use serde_json::json;

    fn tool_use(name: &str, input: Value) -> StreamEvent {
        StreamEvent::Message(Message::new(
            MessageKind::Assistant,
            vec![ContentBlock::ToolUse { id: "t".into(), name: name.into(), input }],
        ))
    }

    fn settings(strategy: CheckpointStrategy) -> CheckpointSettings {
        CheckpointSettings { auto_checkpoint_enabled: true, strategy }
    }

    fn response() -> StreamEvent {
        StreamEvent::Control(ControlEvent::Response { usage: Some(Usage { input_tokens: 1, output_tokens: 1 }) })
    }

    #[test]
    fn smart_triggers_on_write_not_read() {
        let c = ToolClassifier::default();
        let s = settings(CheckpointStrategy::Smart);
        assert!(should_auto_checkpoint(&s, &c, &tool_use("Write", json!({"file_path": "a"}))));
        assert!(!should_auto_checkpoint(&s, &c, &tool_use("Read", json!({"file_path": "a"}))));
        assert!(!should_auto_checkpoint(&s, &c, &tool_use("Grep", json!({"pattern": "x"}))));
        assert!(should_auto_checkpoint(&s, &c, &tool_use("MultiEdit", json!({}))));
    }

    #[test]
    fn manual_never_triggers() {
        let c = ToolClassifier::default();
        let s = settings(CheckpointStrategy::Manual);
        for entry in [tool_use("Write", json!({})), response(), tool_use("Bash", json!({"command": "rm -rf x"}))] {
            assert!(!should_auto_checkpoint(&s, &c, &entry));
        }
    }

    #[test]
    fn disabled_never_triggers() {
        let c = ToolClassifier::default();
        let s = CheckpointSettings { auto_checkpoint_enabled: false, strategy: CheckpointStrategy::PerToolUse };
        assert!(!should_auto_checkpoint(&s, &c, &tool_use("Read", json!({}))));
    }

    #[test]
    fn per_tool_use_triggers_on_any_tool() {
        let c = ToolClassifier::default();
        let s = settings(CheckpointStrategy::PerToolUse);
        assert!(should_auto_checkpoint(&s, &c, &tool_use("Read", json!({}))));
        let text = StreamEvent::Message(Message::text(MessageKind::Assistant, "no tools"));
        assert!(!should_auto_checkpoint(&s, &c, &text));
    }

    #[test]
    fn per_prompt_triggers_on_turn_completion() {
        let c = ToolClassifier::default();
        let s = settings(CheckpointStrategy::PerPrompt);
        assert!(should_auto_checkpoint(&s, &c, &response()));
        let result = StreamEvent::Message(Message::new(MessageKind::Result, vec![]));
        assert!(should_auto_checkpoint(&s, &c, &result));
        assert!(!should_auto_checkpoint(&s, &c, &tool_use("Write", json!({}))));
        assert!(!should_auto_checkpoint(&s, &c, &StreamEvent::Control(ControlEvent::Start)));
    }

    #[test]
    fn shell_commands_are_judged_by_content() {
        let c = ToolClassifier::default();
        let bash = |cmd: &str| json!({ "command": cmd });
        assert_eq!(c.classify("Bash", &bash("ls -la src")), ToolClass::ReadOnly);
        assert_eq!(c.classify("bash", &bash("git status && git diff HEAD")), ToolClass::ReadOnly);
        assert_eq!(c.classify("Bash", &bash("cat a | grep foo")), ToolClass::ReadOnly);
        assert_eq!(c.classify("Bash", &bash("cat a > b")), ToolClass::Mutating);
        assert_eq!(c.classify("Bash", &bash("ls; rm -rf target")), ToolClass::Mutating);
        assert_eq!(c.classify("Bash", &bash("npm install")), ToolClass::Mutating);
        assert_eq!(c.classify("Bash", &json!({})), ToolClass::Mutating);
    }

    #[test]
    fn mapping_is_configurable() {
        let config = SmartPolicyConfig {
            mutating_tools: vec!["Deploy".into()],
            shell_tools: vec![],
            read_only_commands: vec!["(".into()],
        };
        let c = ToolClassifier::from_config(&config);
        assert_eq!(c.classify("deploy", &Value::Null), ToolClass::Mutating);
        assert_eq!(c.classify("Write", &Value::Null), ToolClass::ReadOnly);
        assert_eq!(c.classify("Bash", &json!({"command": "rm x"})), ToolClass::ReadOnly);
    }
}
