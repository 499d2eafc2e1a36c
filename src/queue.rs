//! Prompt queue in front of the single active execution.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{CoreError, CoreResult};
use crate::launcher::{ExecutionLauncher, PromptRequest};
use crate::reconciler::StreamState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedPrompt {
    pub id: u64,
    pub request: PromptRequest,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Submission {
    Dispatched,
    /// `position` is 1-based.
    Queued { id: u64, position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub active: bool,
    pub pending: Vec<QueuedPrompt>,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueuedPrompt>,
    active: bool,
    next_id: u64,
}

impl QueueState {
    fn publish_depth(&self) {
        metrics::gauge!("prompt_queue_depth").set(self.pending.len() as f64);
    }
}

pub struct ExecutionQueue {
    launcher: Arc<dyn ExecutionLauncher>,
    state: Mutex<QueueState>,
    quiescence: Duration,
}

impl ExecutionQueue {
    pub fn new(launcher: Arc<dyn ExecutionLauncher>, quiescence: Duration) -> Self {
        Self { launcher, state: Mutex::new(QueueState::default()), quiescence }
    }

    pub fn quiescence(&self) -> Duration {
        self.quiescence
    }

    /// Dispatch right away when nothing is running and nothing is waiting,
    /// otherwise append to the queue.
    pub async fn submit(&self, request: PromptRequest) -> CoreResult<Submission> {
        {
            let mut state = self.state.lock().await;
            if state.active || !state.pending.is_empty() {
                state.next_id += 1;
                let id = state.next_id;
                state.pending.push_back(QueuedPrompt { id, request, queued_at: Utc::now() });
                let position = state.pending.len();
                state.publish_depth();
                debug!(id, position, "prompt queued");
                return Ok(Submission::Queued { id, position });
            }
            state.active = true;
        }
        if let Err(e) = self.launcher.dispatch(&request).await {
            self.state.lock().await.active = false;
            return Err(CoreError::Launch(e.to_string()));
        }
        info!(path = %request.project_path.display(), "prompt dispatched");
        Ok(Submission::Dispatched)
    }

    pub async fn remove(&self, id: u64) -> bool {
        let mut state = self.state.lock().await;
        let before = state.pending.len();
        state.pending.retain(|p| p.id != id);
        state.publish_depth();
        state.pending.len() != before
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        QueueSnapshot { active: state.active, pending: state.pending.iter().cloned().collect() }
    }

    pub async fn mark_streaming(&self) {
        self.state.lock().await.active = true;
    }

    /// Returns whether anything is waiting to be dispatched.
    pub async fn mark_idle(&self) -> bool {
        let mut state = self.state.lock().await;
        state.active = false;
        !state.pending.is_empty()
    }

    /// Dispatch the head of the queue if no execution is active. A launch
    /// failure drops that prompt and is logged.
    pub async fn dispatch_next(&self) -> Option<QueuedPrompt> {
        let next = {
            let mut state = self.state.lock().await;
            if state.active {
                return None;
            }
            let next = state.pending.pop_front()?;
            state.active = true;
            state.publish_depth();
            next
        };
        match self.launcher.dispatch(&next.request).await {
            Ok(()) => {
                info!(id = next.id, path = %next.request.project_path.display(), "queued prompt dispatched");
                Some(next)
            }
            Err(e) => {
                error!(id = next.id, error = %e, "queued prompt failed to launch");
                self.state.lock().await.active = false;
                None
            }
        }
    }

    /// Follow the activity channel: each `Idle` dispatches at most one prompt
    /// after the quiescence delay, unless activity changed in the meantime.
    pub fn spawn_driver(self: &Arc<Self>, mut activity: watch::Receiver<StreamState>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            while activity.changed().await.is_ok() {
                let state = *activity.borrow_and_update();
                match state {
                    StreamState::Streaming => queue.mark_streaming().await,
                    StreamState::Idle => {
                        if !queue.mark_idle().await {
                            continue;
                        }
                        tokio::time::sleep(queue.quiescence).await;
                        if activity.has_changed().unwrap_or(true) {
                            debug!("activity changed during quiescence");
                            continue;
                        }
                        queue.dispatch_next().await;
                    }
                }
            }
            debug!("queue driver stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::PromptKind;
    use crate::launcher::testing::RecordingLauncher;

    fn prompt(text: &str) -> PromptRequest {
        PromptRequest { project_path: "/repo".into(), prompt: text.into(), model: "m".into(), kind: PromptKind::Continue }
    }

    fn setup() -> (Arc<RecordingLauncher>, Arc<ExecutionQueue>, watch::Sender<StreamState>, JoinHandle<()>) {
        let launcher = Arc::new(RecordingLauncher::default());
        let queue = Arc::new(ExecutionQueue::new(launcher.clone(), Duration::from_millis(500)));
        let (tx, rx) = watch::channel(StreamState::Idle);
        let driver = queue.spawn_driver(rx);
        (launcher, queue, tx, driver)
    }

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn queued_prompts_dispatch_in_order_one_per_idle() {
        let (launcher, queue, tx, _driver) = setup();

        assert_eq!(queue.submit(prompt("P1")).await.unwrap(), Submission::Dispatched);
        tx.send(StreamState::Streaming).unwrap();
        assert!(matches!(queue.submit(prompt("P2")).await.unwrap(), Submission::Queued { position: 1, .. }));
        assert!(matches!(queue.submit(prompt("P3")).await.unwrap(), Submission::Queued { position: 2, .. }));
        assert_eq!(launcher.calls(), vec!["continue:P1"]);

        tx.send(StreamState::Idle).unwrap();
        settle(100).await;
        assert_eq!(launcher.calls().len(), 1, "still inside the quiescence window");
        settle(500).await;
        assert_eq!(launcher.calls(), vec!["continue:P1", "continue:P2"]);

        // no further dispatch until the P2 run goes idle again
        settle(2_000).await;
        assert_eq!(queue.snapshot().await.pending.len(), 1);

        tx.send(StreamState::Streaming).unwrap();
        settle(10).await;
        tx.send(StreamState::Idle).unwrap();
        settle(600).await;
        assert_eq!(launcher.calls(), vec!["continue:P1", "continue:P2", "continue:P3"]);
        assert!(queue.snapshot().await.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn new_activity_during_quiescence_defers_dispatch() {
        let (launcher, queue, tx, _driver) = setup();
        queue.submit(prompt("P1")).await.unwrap();
        tx.send(StreamState::Streaming).unwrap();
        queue.submit(prompt("P2")).await.unwrap();

        tx.send(StreamState::Idle).unwrap();
        settle(100).await;
        tx.send(StreamState::Streaming).unwrap();
        settle(1_000).await;
        assert_eq!(launcher.calls(), vec!["continue:P1"]);
        assert_eq!(queue.snapshot().await.pending.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_item_is_skipped_and_rest_still_dispatch() {
        let (launcher, queue, tx, _driver) = setup();
        queue.submit(prompt("P1")).await.unwrap();
        tx.send(StreamState::Streaming).unwrap();
        let Submission::Queued { id: p2, .. } = queue.submit(prompt("P2")).await.unwrap() else {
            panic!("expected queued");
        };
        queue.submit(prompt("P3")).await.unwrap();
        assert!(queue.remove(p2).await);
        assert!(!queue.remove(p2).await);

        tx.send(StreamState::Idle).unwrap();
        settle(600).await;
        assert_eq!(launcher.calls(), vec!["continue:P1", "continue:P3"]);
    }

    #[tokio::test]
    async fn submit_while_items_wait_keeps_fifo() {
        let launcher = Arc::new(RecordingLauncher::default());
        let queue = ExecutionQueue::new(launcher.clone(), Duration::from_millis(500));
        queue.submit(prompt("P1")).await.unwrap();
        queue.submit(prompt("P2")).await.unwrap();
        // idle but P2 still waiting for its quiescence window
        assert!(queue.mark_idle().await);
        assert!(matches!(queue.submit(prompt("P3")).await.unwrap(), Submission::Queued { position: 2, .. }));
        assert_eq!(queue.dispatch_next().await.map(|p| p.request.prompt), Some("P2".to_string()));
        assert!(queue.dispatch_next().await.is_none(), "P2 run is active");
    }
}
