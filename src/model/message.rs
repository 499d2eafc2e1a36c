use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    System,
    User,
    Assistant,
    Result,
    Thinking,
}

impl MessageKind {
    pub const ALL: [&'static str; 5] = ["system", "user", "assistant", "result", "thinking"];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        thinking: String,
    },
    /// Block kinds this crate does not interpret (images, documents, ...).
    #[serde(other)]
    Unsupported,
}

/// One conversational message, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentBlock>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(kind: MessageKind, content: Vec<ContentBlock>) -> Self {
        Self { kind, content: Some(content), usage: None, session_id: None, timestamp: None }
    }

    pub fn text(kind: MessageKind, text: impl Into<String>) -> Self {
        Self::new(kind, vec![ContentBlock::Text { text: text.into() }])
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        self.content.as_deref().unwrap_or(&[])
    }

    /// Concatenated text blocks, if any.
    pub fn text_content(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() { None } else { Some(parts.join("\n")) }
    }

    /// Untimestamped messages sort first and extract the same way every time.
    fn stamp(&self) -> DateTime<Utc> {
        self.timestamp.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: Value,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

pub fn extract_tool_calls(message: &Message) -> Vec<ToolCall> {
    if message.kind != MessageKind::Assistant {
        return Vec::new();
    }
    message
        .blocks()
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
                timestamp: message.stamp(),
            }),
            _ => None,
        })
        .collect()
}

pub fn extract_tool_results(message: &Message) -> Vec<ToolResult> {
    if message.kind != MessageKind::User {
        return Vec::new();
    }
    message
        .blocks()
        .iter()
        .filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, content, is_error } => Some(ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: content.clone(),
                is_error: *is_error,
                timestamp: message.stamp(),
            }),
            _ => None,
        })
        .collect()
}

/// First tool result carried by a user message.
pub fn extract_tool_result(message: &Message) -> Option<ToolResult> {
    extract_tool_results(message).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_assistant_tool_use() {
        let raw = json!({
            "type": "assistant",
            "content": [
                {"type": "text", "text": "Let me look."},
                {"type": "tool_use", "id": "t1", "name": "Read", "input": {"file_path": "a.rs"}}
            ],
            "usage": {"input_tokens": 3, "output_tokens": 4}
        });
        let msg: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.kind, MessageKind::Assistant);
        assert_eq!(msg.usage.map(|u| u.total()), Some(7));

        let calls = extract_tool_calls(&msg);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "t1");
        assert_eq!(calls[0].name, "Read");
        assert_eq!(calls[0].input["file_path"], "a.rs");
    }

    #[test]
    fn untimestamped_extraction_is_stable() {
        let msg = Message::new(
            MessageKind::Assistant,
            vec![ContentBlock::ToolUse { id: "t1".into(), name: "Bash".into(), input: json!({"command": "ls"}) }],
        );
        let first = extract_tool_calls(&msg);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(first, extract_tool_calls(&msg));
        assert_eq!(first[0].timestamp, DateTime::<Utc>::UNIX_EPOCH);

        let at = "2026-01-02T03:04:05Z".parse::<DateTime<Utc>>().unwrap();
        let stamped = Message { timestamp: Some(at), ..msg };
        assert_eq!(extract_tool_calls(&stamped)[0].timestamp, at);
    }

    #[test]
    fn tool_calls_only_come_from_assistant_messages() {
        let msg = Message::new(
            MessageKind::User,
            vec![ContentBlock::ToolUse { id: "x".into(), name: "Write".into(), input: Value::Null }],
        );
        assert!(extract_tool_calls(&msg).is_empty());
    }

    #[test]
    fn extracts_first_tool_result_from_user_message() {
        let msg = Message::new(
            MessageKind::User,
            vec![
                ContentBlock::ToolResult { tool_use_id: "a".into(), content: json!("ok"), is_error: false },
                ContentBlock::ToolResult { tool_use_id: "b".into(), content: json!("boom"), is_error: true },
            ],
        );
        let first = extract_tool_result(&msg).unwrap();
        assert_eq!(first.tool_use_id, "a");
        assert_eq!(extract_tool_results(&msg).len(), 2);
        assert!(extract_tool_results(&msg)[1].is_error);
    }

    #[test]
    fn unknown_block_kinds_are_tolerated() {
        let raw = json!({"type": "user", "content": [{"type": "image", "source": {}}]});
        let msg: Message = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.blocks(), &[ContentBlock::Unsupported]);
        assert!(extract_tool_result(&msg).is_none());
    }
}
