use serde::Serialize;

use crate::model::{StreamEvent, enhance_messages};
use crate::reconciler::{StreamReconciler, StreamState};
use crate::session::SessionId;

/// Result of reconciling a JSONL transcript offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub session_id: Option<SessionId>,
    pub project_id: Option<String>,
    pub entries: usize,
    pub malformed: usize,
    pub unknown: usize,
    pub meta_messages: usize,
    pub tool_calls: usize,
    pub total_tokens: u64,
    pub state: StreamState,
    pub last_error: Option<String>,
}

pub fn replay_transcript(text: &str) -> ReplaySummary {
    let mut reconciler = StreamReconciler::new();
    let mut malformed = 0;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if reconciler.ingest_line(line).is_none() {
            malformed += 1;
        }
    }
    let enhanced = enhance_messages(reconciler.log());
    ReplaySummary {
        session_id: reconciler.session_id().cloned(),
        project_id: reconciler.project_id().map(str::to_owned),
        entries: reconciler.len(),
        malformed,
        unknown: reconciler.log().iter().filter(|e| matches!(e, StreamEvent::Unknown(_))).count(),
        meta_messages: enhanced.iter().filter(|m| m.is_meta).count(),
        tool_calls: enhanced.iter().map(|m| m.tool_calls.len()).sum(),
        total_tokens: reconciler.total_tokens(),
        state: reconciler.state(),
        last_error: reconciler.last_error().map(str::to_owned),
    }
}
