//! Feed items as they arrive from an agent run.
//!
//! Every item becomes one [`StreamEvent`] and one entry in the session log,
//! including discriminants this crate does not understand.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::message::{Message, MessageKind, Usage};
use crate::error::EventError;

/// Streaming fragment of a tool call being assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub content: String,
    /// Content accumulated for this call index up to and including this fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulated: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Start,
    Partial {
        #[serde(default)]
        tool_calls: Vec<ToolCallFragment>,
    },
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error {
        message: String,
    },
    SessionInfo {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
}

impl ControlEvent {
    pub const ALL: [&'static str; 5] = ["start", "partial", "response", "error", "session_info"];
}

/// One entry of a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Control(ControlEvent),
    Message(Message),
    Unknown(Value),
}

impl StreamEvent {
    pub fn message(&self) -> Option<&Message> {
        match self {
            StreamEvent::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            StreamEvent::Control(ControlEvent::Start) => "start",
            StreamEvent::Control(ControlEvent::Partial { .. }) => "partial",
            StreamEvent::Control(ControlEvent::Response { .. }) => "response",
            StreamEvent::Control(ControlEvent::Error { .. }) => "error",
            StreamEvent::Control(ControlEvent::SessionInfo { .. }) => "session_info",
            StreamEvent::Message(m) => match m.kind {
                MessageKind::System => "system",
                MessageKind::User => "user",
                MessageKind::Assistant => "assistant",
                MessageKind::Result => "result",
                MessageKind::Thinking => "thinking",
            },
            StreamEvent::Unknown(v) => v.get("type").and_then(Value::as_str).unwrap_or("unknown"),
        }
    }

    /// Usage reported by a `response` event.
    pub fn response_usage(&self) -> Option<Usage> {
        match self {
            StreamEvent::Control(ControlEvent::Response { usage }) => *usage,
            _ => None,
        }
    }

    /// Dispatch on the `type` discriminant. Unrecognised kinds are kept as
    /// [`StreamEvent::Unknown`] and logged.
    pub fn from_value(value: Value) -> Result<Self, EventError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EventError::MissingDiscriminant)?
            .to_owned();
        if ControlEvent::ALL.contains(&kind.as_str()) {
            return Ok(StreamEvent::Control(serde_json::from_value(value)?));
        }
        if MessageKind::ALL.contains(&kind.as_str()) {
            return Ok(StreamEvent::Message(serde_json::from_value(value)?));
        }
        warn!(kind = %kind, "unrecognised stream event kind");
        metrics::counter!("stream_events_unknown_total").increment(1);
        Ok(StreamEvent::Unknown(value))
    }
}

pub fn parse_event(line: &str) -> Result<StreamEvent, EventError> {
    let value: Value = serde_json::from_str(line)?;
    StreamEvent::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::message::ContentBlock;

    #[test]
    fn parses_control_events() {
        assert_eq!(parse_event(r#"{"type":"start"}"#).unwrap(), StreamEvent::Control(ControlEvent::Start));
        let ev = parse_event(r#"{"type":"response","usage":{"input_tokens":10,"output_tokens":5}}"#).unwrap();
        assert_eq!(ev.response_usage().map(|u| u.total()), Some(15));
        let ev = parse_event(r#"{"type":"session_info","session_id":"s-1","project_id":"p"}"#).unwrap();
        assert_eq!(
            ev,
            StreamEvent::Control(ControlEvent::SessionInfo { session_id: "s-1".into(), project_id: Some("p".into()) })
        );
    }

    #[test]
    fn parses_messages() {
        let ev = parse_event(r#"{"type":"user","content":[{"type":"text","text":"hi"}]}"#).unwrap();
        let msg = ev.message().unwrap();
        assert_eq!(msg.kind, MessageKind::User);
        assert_eq!(msg.blocks(), &[ContentBlock::Text { text: "hi".into() }]);
        assert_eq!(ev.kind(), "user");
    }

    #[test]
    fn unknown_kind_is_kept() {
        let ev = parse_event(r#"{"type":"heartbeat","n":1}"#).unwrap();
        assert!(matches!(ev, StreamEvent::Unknown(_)));
        assert_eq!(ev.kind(), "heartbeat");
    }

    #[test]
    fn malformed_items_are_errors() {
        assert!(matches!(parse_event("{not json"), Err(EventError::Json(_))));
        assert!(matches!(parse_event(r#"{"no_type":true}"#), Err(EventError::MissingDiscriminant)));
        assert!(matches!(parse_event(r#"{"type":7}"#), Err(EventError::MissingDiscriminant)));
        // right discriminant, wrong payload shape
        assert!(matches!(parse_event(r#"{"type":"error"}"#), Err(EventError::Json(_))));
    }

    #[test]
    fn stored_entries_survive_a_json_round_trip() {
        let entries = vec![
            parse_event(r#"{"type":"partial","tool_calls":[{"index":0,"content":"ab","accumulated":"ab"}]}"#).unwrap(),
            parse_event(r#"{"type":"assistant","content":[{"type":"tool_use","id":"t","name":"Bash","input":{}}]}"#).unwrap(),
            parse_event(r#"{"type":"mystery"}"#).unwrap(),
        ];
        let json = serde_json::to_string(&entries).unwrap();
        let back: Vec<StreamEvent> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entries);
    }
}
