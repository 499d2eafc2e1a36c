//! Feed listeners: one per logical target, applying events to a live session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::launcher::ExecutionLauncher;
use crate::reconciler::StreamState;
use crate::timeline::{SharedSession, TimelineManager};

/// Lines buffered per runner-owned feed before [`SessionRunner::push`] waits.
const FEED_CAPACITY: usize = 256;

struct Listener {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
    session: SharedSession,
    /// Present when the runner owns the feed (see [`SessionRunner::start`]).
    feed: Option<broadcast::Sender<String>>,
}

/// Process-wide activity: Streaming while any attached listener's session is
/// mid-turn, Idle once none is.
struct Activity {
    streaming: Mutex<HashSet<String>>,
    tx: watch::Sender<StreamState>,
}

impl Activity {
    fn new() -> Self {
        let (tx, _) = watch::channel(StreamState::Idle);
        Self { streaming: Mutex::new(HashSet::new()), tx }
    }

    async fn set(&self, key: &str, state: StreamState) {
        let mut streaming = self.streaming.lock().await;
        match state {
            StreamState::Streaming => {
                streaming.insert(key.to_owned());
            }
            StreamState::Idle => {
                streaming.remove(key);
            }
        }
        let overall = if streaming.is_empty() { StreamState::Idle } else { StreamState::Streaming };
        let changed = self.tx.send_if_modified(|current| {
            if *current == overall {
                return false;
            }
            *current = overall;
            true
        });
        if changed {
            debug!(state = ?overall, streaming = streaming.len(), "activity changed");
        }
    }
}

pub struct SessionRunner {
    timeline: Arc<TimelineManager>,
    launcher: Arc<dyn ExecutionLauncher>,
    activity: Arc<Activity>,
    listeners: Mutex<HashMap<String, Listener>>,
}

impl SessionRunner {
    pub fn new(timeline: Arc<TimelineManager>, launcher: Arc<dyn ExecutionLauncher>) -> Self {
        Self { timeline, launcher, activity: Arc::new(Activity::new()), listeners: Mutex::new(HashMap::new()) }
    }

    pub fn timeline(&self) -> &Arc<TimelineManager> {
        &self.timeline
    }

    /// Idle/Streaming across every attached listener.
    pub fn activity(&self) -> watch::Receiver<StreamState> {
        self.activity.tx.subscribe()
    }

    pub async fn attached(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.listeners.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Start applying `feed` to `session`. Any listener already attached under
    /// `key` is stopped and awaited first, so a target never has two.
    pub async fn attach(&self, key: impl Into<String>, session: SharedSession, feed: broadcast::Receiver<String>) {
        self.spawn_listener(key.into(), session, feed, None).await;
    }

    /// Like [`attach`](Self::attach), with a feed owned by the runner. Lines
    /// reach it through [`push`](Self::push).
    pub async fn start(&self, key: impl Into<String>, session: SharedSession) {
        let (tx, rx) = broadcast::channel(FEED_CAPACITY);
        self.spawn_listener(key.into(), session, rx, Some(tx)).await;
    }

    /// Forward raw feed lines to the run started under `key`. Returns how many
    /// were queued, or `None` when no runner-owned feed is attached there.
    pub async fn push<I>(&self, key: &str, lines: I) -> Option<usize>
    where
        I: IntoIterator<Item = String>,
    {
        let feed = self.listeners.lock().await.get(key)?.feed.clone()?;
        let mut sent = 0;
        for line in lines {
            while feed.len() >= FEED_CAPACITY && feed.receiver_count() > 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            if feed.send(line).is_err() {
                debug!(key, sent, "feed closed while pushing");
                break;
            }
            sent += 1;
        }
        Some(sent)
    }

    async fn spawn_listener(
        &self,
        key: String,
        session: SharedSession,
        mut feed: broadcast::Receiver<String>,
        owned: Option<broadcast::Sender<String>>,
    ) {
        let mut listeners = self.listeners.lock().await;
        if let Some(old) = listeners.remove(&key) {
            stop_listener(&key, old).await;
        }
        let state = session.lock().await.reconciler.state();
        self.activity.set(&key, state).await;

        let (stop, mut stopped) = watch::channel(false);
        let timeline = self.timeline.clone();
        let activity = self.activity.clone();
        let target = session.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    item = feed.recv() => match item {
                        Ok(line) => {
                            if !apply_line(&timeline, &activity, &task_key, &target, &stopped, &line).await {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(key = %task_key, skipped, "listener lagged behind feed");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(key = %task_key, "listener exited");
        });
        info!(key = %key, owned_feed = owned.is_some(), "listener attached");
        listeners.insert(key, Listener { stop, handle, session, feed: owned });
    }

    pub async fn detach(&self, key: &str) -> bool {
        let removed = self.listeners.lock().await.remove(key);
        match removed {
            Some(listener) => {
                stop_listener(key, listener).await;
                self.activity.set(key, StreamState::Idle).await;
                true
            }
            None => false,
        }
    }

    /// Cancel the run attached under `key`: the session goes Idle at once, the
    /// listener is detached, the log keeps what already arrived and no
    /// auto-checkpoint is taken for the cancelled turn.
    pub async fn cancel(&self, key: &str) -> CoreResult<bool> {
        let Some(listener) = self.listeners.lock().await.remove(key) else {
            return Ok(false);
        };
        let session_id = {
            let mut live = listener.session.lock().await;
            live.reconciler.cancel();
            live.clear_pending_auto();
            let _ = listener.stop.send(true);
            self.activity.set(key, StreamState::Idle).await;
            self.timeline.persist_log(&live).await;
            live.session_id().cloned()
        };
        stop_listener(key, listener).await;
        self.launcher.cancel(session_id.as_ref()).await.map_err(|e| CoreError::Launch(e.to_string()))?;
        info!(key, session_id = ?session_id.as_ref().map(|s| s.as_str()), "run cancelled");
        Ok(true)
    }
}

async fn stop_listener(key: &str, listener: Listener) {
    let _ = listener.stop.send(true);
    if let Err(e) = listener.handle.await {
        warn!(key, error = %e, "listener task failed");
    }
    debug!(key, "listener detached");
}

/// Returns false once the listener has been told to stop.
async fn apply_line(
    timeline: &TimelineManager,
    activity: &Activity,
    key: &str,
    session: &SharedSession,
    stopped: &watch::Receiver<bool>,
    line: &str,
) -> bool {
    let mut live = session.lock().await;
    // an item received just before a cancel must not land after it
    if *stopped.borrow() {
        return false;
    }
    let Some(applied) = live.reconciler.ingest_line(line) else {
        return true;
    };
    if applied.derived_session.is_some()
        && let Err(e) = timeline.register(session, &mut live).await
    {
        warn!(key, error = %e, "session not registered; its checkpoints and log stay in memory");
    }
    timeline.evaluate_auto_checkpoint(&mut live, applied.index).await;
    if applied.error.is_some() {
        live.clear_pending_auto();
    }
    if applied.turn_completed {
        timeline.commit_auto_checkpoint(&mut live, applied.index).await;
    }
    if applied.turn_completed || applied.error.is_some() {
        timeline.persist_log(&live).await;
    }
    if let Some(state) = applied.transition {
        activity.set(key, state).await;
    }
    true
}
