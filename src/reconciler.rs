//! Turns an ordered feed of agent events into a session log.
//!
//! The reconciler is a plain state machine (`Idle` / `Streaming`); it never
//! awaits. Callers feed it one item at a time from whatever channel delivers
//! the run's output and hold the session lock while doing so.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{ControlEvent, MessageKind, StreamEvent, parse_event};
use crate::session::SessionId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    Idle,
    Streaming,
}

/// What applying one event did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    pub index: usize,
    /// New state, when the event changed it.
    pub transition: Option<StreamState>,
    /// A `response` ended the turn.
    pub turn_completed: bool,
    pub error: Option<String>,
    /// Identity fixed by this event.
    pub derived_session: Option<SessionId>,
}

#[derive(Debug, Default)]
pub struct StreamReconciler {
    log: Vec<StreamEvent>,
    state: StreamState,
    total_tokens: u64,
    session_id: Option<SessionId>,
    project_id: Option<String>,
    partials: HashMap<usize, String>,
    last_error: Option<String>,
}

impl StreamReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconciler for a session whose identity is already known (resume, fork).
    pub fn with_session(session_id: SessionId, log: Vec<StreamEvent>) -> Self {
        let mut r = Self { session_id: Some(session_id), ..Self::default() };
        r.replace_log(log);
        r
    }

    pub fn log(&self) -> &[StreamEvent] {
        &self.log
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == StreamState::Streaming
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Parse and apply one raw feed item. Unparseable items are dropped with a
    /// warning and leave the log untouched.
    pub fn ingest_line(&mut self, line: &str) -> Option<Applied> {
        match parse_event(line) {
            Ok(event) => Some(self.apply(event)),
            Err(e) => {
                warn!(error = %e, session_id = ?self.session_id, "dropping malformed stream event");
                metrics::counter!("stream_events_malformed_total").increment(1);
                None
            }
        }
    }

    pub fn apply(&mut self, mut event: StreamEvent) -> Applied {
        let mut applied = Applied { index: self.log.len(), ..Applied::default() };
        metrics::counter!("stream_events_total").increment(1);

        match &mut event {
            StreamEvent::Control(ControlEvent::Start) => {
                self.partials.clear();
                self.last_error = None;
                applied.transition = self.transition(StreamState::Streaming);
            }
            StreamEvent::Control(ControlEvent::Partial { tool_calls }) => {
                for fragment in tool_calls.iter_mut() {
                    let acc = self.partials.entry(fragment.index).or_default();
                    acc.push_str(&fragment.content);
                    fragment.accumulated = Some(acc.clone());
                }
            }
            StreamEvent::Control(ControlEvent::Response { usage }) => {
                if let Some(usage) = usage {
                    self.total_tokens += usage.total();
                }
                applied.turn_completed = true;
                applied.transition = self.transition(StreamState::Idle);
            }
            StreamEvent::Control(ControlEvent::Error { message }) => {
                self.last_error = Some(message.clone());
                applied.error = Some(message.clone());
                applied.transition = self.transition(StreamState::Idle);
            }
            StreamEvent::Control(ControlEvent::SessionInfo { session_id, project_id }) => {
                applied.derived_session = self.derive(session_id, project_id.as_deref());
            }
            StreamEvent::Message(m) if m.kind == MessageKind::System => {
                if let Some(id) = &m.session_id {
                    applied.derived_session = self.derive(id, None);
                }
            }
            StreamEvent::Message(_) | StreamEvent::Unknown(_) => {}
        }

        self.log.push(event);
        applied
    }

    /// Force `Idle` without touching the log. Returns whether the state changed.
    pub fn cancel(&mut self) -> bool {
        self.partials.clear();
        self.transition(StreamState::Idle).is_some()
    }

    /// Replace the live log wholesale (restore). Token total is recomputed
    /// from the `response` events that remain.
    pub fn replace_log(&mut self, log: Vec<StreamEvent>) {
        self.total_tokens = log.iter().filter_map(|e| e.response_usage()).map(|u| u.total()).sum();
        self.log = log;
        self.partials.clear();
        self.last_error = None;
    }

    fn transition(&mut self, to: StreamState) -> Option<StreamState> {
        if self.state == to {
            return None;
        }
        debug!(from = ?self.state, to = ?to, session_id = ?self.session_id, "stream state");
        self.state = to;
        Some(to)
    }

    fn derive(&mut self, session_id: &str, project_id: Option<&str>) -> Option<SessionId> {
        if self.session_id.is_some() {
            return None;
        }
        let id = SessionId::from(session_id);
        self.session_id = Some(id.clone());
        self.project_id = project_id.map(str::to_owned);
        Some(id)
    }
}
