pub mod enhance;
pub mod event;
pub mod message;

pub use enhance::{EnhancedMessage, enhance_messages};
pub use event::{ControlEvent, StreamEvent, ToolCallFragment, parse_event};
pub use message::{
    ContentBlock, Message, MessageKind, ToolCall, ToolResult, Usage, extract_tool_calls, extract_tool_result,
    extract_tool_results,
};
