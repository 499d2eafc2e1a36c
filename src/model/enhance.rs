use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::debug;

use super::event::StreamEvent;
use super::message::{ContentBlock, MessageKind, ToolCall, ToolResult, extract_tool_calls, extract_tool_results};

/// A log entry paired with its correlated tool calls and results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnhancedMessage {
    pub index: usize,
    pub entry: StreamEvent,
    pub tool_calls: Vec<ToolCall>,
    /// Results attached to this entry's tool calls, keyed by call id.
    pub tool_results: BTreeMap<String, ToolResult>,
    /// User message made up entirely of matched tool results.
    pub is_meta: bool,
}

/// Correlate tool results with the assistant messages that issued them.
///
/// Output is parallel to `log`. Calls are indexed in a first pass so a result
/// can be matched no matter where its call sits in the log.
pub fn enhance_messages(log: &[StreamEvent]) -> Vec<EnhancedMessage> {
    let mut out: Vec<EnhancedMessage> = Vec::with_capacity(log.len());
    let mut owners: HashMap<String, usize> = HashMap::new();

    for (index, entry) in log.iter().enumerate() {
        let tool_calls = entry.message().map(extract_tool_calls).unwrap_or_default();
        for call in &tool_calls {
            if let Some(first) = owners.get(&call.id) {
                debug!(call_id = %call.id, first, index, "duplicate tool call id, keeping first owner");
                continue;
            }
            owners.insert(call.id.clone(), index);
        }
        out.push(EnhancedMessage {
            index,
            entry: entry.clone(),
            tool_calls,
            tool_results: BTreeMap::new(),
            is_meta: false,
        });
    }

    for index in 0..out.len() {
        let Some(message) = log[index].message() else { continue };
        if message.kind != MessageKind::User {
            continue;
        }
        let mut matched = 0usize;
        for result in extract_tool_results(message) {
            let Some(&owner) = owners.get(&result.tool_use_id) else {
                debug!(tool_use_id = %result.tool_use_id, index, "orphan tool result");
                continue;
            };
            let slot = &mut out[owner].tool_results;
            if slot.contains_key(&result.tool_use_id) {
                debug!(tool_use_id = %result.tool_use_id, index, "second result for tool call ignored");
                continue;
            }
            slot.insert(result.tool_use_id.clone(), result);
            matched += 1;
        }
        let blocks = message.blocks();
        let all_results = blocks.iter().all(|b| matches!(b, ContentBlock::ToolResult { .. }));
        out[index].is_meta = !blocks.is_empty() && all_results && matched == blocks.len();
    }

    out
}
