//! Live sessions, their checkpoint trees, restore and fork.
//!
//! Each live session sits behind its own `tokio::sync::Mutex`; every structural
//! operation (checkpoint create/delete/cleanup, restore, fork, auto-checkpoint)
//! runs with that lock held, so they are serialized per session. The session
//! map lock is never held while waiting on a session lock.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::checkpoint::{
    Checkpoint, CheckpointSettings, CheckpointStore, CheckpointStrategy, CheckpointTrigger, NewCheckpoint,
};
use crate::error::{CoreError, CoreResult, StorageError};
use crate::model::{StreamEvent, extract_tool_calls};
use crate::reconciler::{StreamReconciler, StreamState};
use crate::session::{CheckpointId, ForkOrigin, Session, SessionId, SessionScope};

pub type SharedSession = Arc<Mutex<LiveSession>>;

/// In-memory state of one session: its reconciled log plus timeline position.
#[derive(Debug)]
pub struct LiveSession {
    pub project_id: String,
    pub project_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub forked_from: Option<ForkOrigin>,
    pub reconciler: StreamReconciler,
    pub current_checkpoint: Option<CheckpointId>,
    pending_auto: Option<CheckpointStrategy>,
    /// Set once this value owns its id in the [`TimelineManager`]. Checkpoints
    /// and log writes are skipped until then.
    registered: bool,
}

/// Read-only view handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<SessionId>,
    pub project_id: String,
    pub project_path: PathBuf,
    pub state: StreamState,
    pub total_tokens: u64,
    pub message_count: usize,
    pub current_checkpoint: Option<CheckpointId>,
    pub last_error: Option<String>,
    pub forked_from: Option<ForkOrigin>,
}

impl LiveSession {
    /// A fresh run whose identity will be derived from the stream.
    pub fn new(project_id: impl Into<String>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_id: project_id.into(),
            project_path: project_path.into(),
            created_at: Utc::now(),
            forked_from: None,
            reconciler: StreamReconciler::new(),
            current_checkpoint: None,
            pending_auto: None,
            registered: false,
        }
    }

    pub fn resume(session: Session, log: Vec<StreamEvent>) -> Self {
        Self {
            project_id: session.project_id,
            project_path: session.project_path,
            created_at: session.created_at,
            forked_from: session.forked_from,
            reconciler: StreamReconciler::with_session(session.id, log),
            current_checkpoint: None,
            pending_auto: None,
            registered: true,
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.reconciler.session_id()
    }

    /// Project id reported by the stream wins over the one supplied at start.
    pub fn project_id(&self) -> &str {
        self.reconciler.project_id().unwrap_or(&self.project_id)
    }

    pub fn session(&self) -> Option<Session> {
        Some(Session {
            id: self.session_id()?.clone(),
            project_id: self.project_id().to_owned(),
            project_path: self.project_path.clone(),
            created_at: self.created_at,
            forked_from: self.forked_from.clone(),
        })
    }

    pub fn scope(&self) -> Option<SessionScope> {
        Some(SessionScope {
            session_id: self.session_id()?.clone(),
            project_id: self.project_id().to_owned(),
            project_path: self.project_path.clone(),
        })
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn pending_auto_checkpoint(&self) -> Option<CheckpointStrategy> {
        self.pending_auto
    }

    /// Drop any auto-checkpoint decided during the current turn.
    pub fn clear_pending_auto(&mut self) {
        self.pending_auto = None;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id().cloned(),
            project_id: self.project_id().to_owned(),
            project_path: self.project_path.clone(),
            state: self.reconciler.state(),
            total_tokens: self.reconciler.total_tokens(),
            message_count: self.reconciler.len(),
            current_checkpoint: self.current_checkpoint,
            last_error: self.reconciler.last_error().map(str::to_owned),
            forked_from: self.forked_from.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineNode {
    pub checkpoint: Checkpoint,
    pub children: Vec<TimelineNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Timeline {
    pub session_id: SessionId,
    pub current_checkpoint: Option<CheckpointId>,
    pub roots: Vec<TimelineNode>,
    pub total_checkpoints: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointDiff {
    pub from: CheckpointId,
    pub to: CheckpointId,
    pub message_delta: i64,
    pub token_delta: i64,
    /// Names of tool calls present in `to` beyond the prefix it shares with `from`.
    pub tool_calls: Vec<String>,
}

pub struct TimelineManager {
    store: Arc<CheckpointStore>,
    sessions: RwLock<HashMap<SessionId, SharedSession>>,
    version: AtomicU64,
}

impl TimelineManager {
    pub fn new(store: Arc<CheckpointStore>) -> Self {
        Self { store, sessions: RwLock::new(HashMap::new()), version: AtomicU64::new(0) }
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Bumped on every structural change; consumers poll it to know when to re-fetch.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn bump(&self, reason: &'static str) -> u64 {
        let v = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(version = v, reason, "timeline version");
        v
    }

    pub async fn get(&self, id: &SessionId) -> Option<SharedSession> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Index a live session under its id and persist its metadata. `None` while
    /// the stream has not reported an identity yet. Call with the session lock
    /// held; `live` must be the guarded value of `handle`. A session that loses
    /// the id to another handle stays unregistered and never writes to storage.
    pub async fn register(&self, handle: &SharedSession, live: &mut LiveSession) -> CoreResult<Option<SessionId>> {
        let Some(session) = live.session() else { return Ok(None) };
        {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&session.id) {
                Some(existing) if !Arc::ptr_eq(existing, handle) => {
                    return Err(CoreError::DuplicateSessionId(session.id));
                }
                Some(_) => {}
                None => {
                    sessions.insert(session.id.clone(), handle.clone());
                }
            }
        }
        self.store.backend().upsert_session(&session).await?;
        live.registered = true;
        info!(session_id = %session.id, project_id = %session.project_id, "session registered");
        Ok(Some(session.id))
    }

    /// The live session for `id`, loading it from the backend if it is not in memory.
    pub async fn open(&self, id: &SessionId) -> CoreResult<SharedSession> {
        if let Some(live) = self.get(id).await {
            return Ok(live);
        }
        let (session, log) = self
            .store
            .backend()
            .load_session(id)
            .await?
            .ok_or_else(|| CoreError::SessionNotFound(id.clone()))?;
        let latest = self.store.list(id).await?.into_iter().max_by_key(|c| c.created_at).map(|c| c.id);
        let mut live = LiveSession::resume(session, log);
        live.current_checkpoint = latest;
        let handle = Arc::new(Mutex::new(live));
        let mut sessions = self.sessions.write().await;
        Ok(sessions.entry(id.clone()).or_insert(handle).clone())
    }

    async fn scope_of(&self, id: &SessionId) -> CoreResult<SessionScope> {
        let live = self.open(id).await?;
        let guard = live.lock().await;
        guard.scope().ok_or_else(|| CoreError::SessionNotFound(id.clone()))
    }

    pub async fn settings(&self, id: &SessionId) -> CoreResult<CheckpointSettings> {
        let scope = self.scope_of(id).await?;
        self.store.get_settings(&scope).await
    }

    pub async fn update_settings(&self, id: &SessionId, settings: CheckpointSettings) -> CoreResult<()> {
        let scope = self.scope_of(id).await?;
        self.store.update_settings(&scope, settings).await
    }

    /// User-initiated checkpoint. Allowed while streaming.
    pub async fn create_checkpoint(
        &self,
        id: &SessionId,
        message_index: usize,
        label: impl Into<String>,
    ) -> CoreResult<Checkpoint> {
        let handle = self.open(id).await?;
        let mut live = handle.lock().await;
        let scope = live.scope().ok_or_else(|| CoreError::SessionNotFound(id.clone()))?;
        let new = NewCheckpoint {
            message_index,
            label: label.into(),
            parent_id: live.current_checkpoint,
            trigger: CheckpointTrigger::Manual,
        };
        let checkpoint = self.store.create_checkpoint(&scope, live.reconciler.log(), new).await?;
        live.current_checkpoint = Some(checkpoint.id);
        self.bump("checkpoint created");
        Ok(checkpoint)
    }

    /// Run the auto-checkpoint policy against entry `index` of the live log and
    /// remember a positive decision until the turn completes. Settings failures
    /// are logged; they never interrupt the stream.
    pub async fn evaluate_auto_checkpoint(&self, live: &mut LiveSession, index: usize) {
        if !live.registered {
            return;
        }
        let Some(scope) = live.scope() else { return };
        let Some(entry) = live.reconciler.log().get(index) else { return };
        let decision = self.store.should_auto_checkpoint(&scope, entry).await;
        match decision {
            Ok(true) => match self.store.get_settings(&scope).await {
                Ok(settings) => live.pending_auto = Some(settings.strategy),
                Err(e) => warn!(session_id = %scope.session_id, error = %e, "auto-checkpoint settings unavailable"),
            },
            Ok(false) => {}
            Err(e) => warn!(session_id = %scope.session_id, error = %e, "auto-checkpoint policy unavailable"),
        }
    }

    /// Commit a pending auto-checkpoint at `index`. Failures are logged and swallowed.
    pub async fn commit_auto_checkpoint(&self, live: &mut LiveSession, index: usize) -> Option<Checkpoint> {
        let strategy = live.pending_auto.take()?;
        if !live.registered {
            return None;
        }
        let scope = live.scope()?;
        let new = NewCheckpoint {
            message_index: index,
            label: format!("auto ({})", strategy.as_str()),
            parent_id: live.current_checkpoint,
            trigger: CheckpointTrigger::Auto { strategy },
        };
        let created = self.store.create_checkpoint(&scope, live.reconciler.log(), new).await;
        match created {
            Ok(checkpoint) => {
                live.current_checkpoint = Some(checkpoint.id);
                self.bump("auto checkpoint");
                info!(session_id = %scope.session_id, checkpoint_id = %checkpoint.id, index, "auto checkpoint created");
                Some(checkpoint)
            }
            Err(e) => {
                warn!(session_id = %scope.session_id, index, error = %e, "auto checkpoint failed");
                metrics::counter!("auto_checkpoint_failures_total").increment(1);
                None
            }
        }
    }

    /// Persist the live log so a cold `open` sees it. Logged on failure.
    pub async fn persist_log(&self, live: &LiveSession) {
        if !live.registered {
            return;
        }
        let Some(id) = live.session_id() else { return };
        if let Err(e) = self.store.backend().save_log(id, live.reconciler.log()).await {
            warn!(session_id = %id, error = %e, "failed to persist session log");
        }
    }

    pub async fn list_checkpoints(&self, id: &SessionId) -> CoreResult<Vec<Checkpoint>> {
        self.store.list(id).await
    }

    pub async fn delete_checkpoint(&self, checkpoint_id: CheckpointId) -> CoreResult<bool> {
        let checkpoint = self.store.get(checkpoint_id).await?;
        let handle = self.get(&checkpoint.session_id).await;
        let mut guard = match &handle {
            Some(h) => Some(h.lock().await),
            None => None,
        };
        let removed = self.store.delete(checkpoint_id).await?;
        if let Some(live) = guard.as_mut()
            && live.current_checkpoint == Some(checkpoint_id)
        {
            live.current_checkpoint = checkpoint.parent_id;
        }
        if removed {
            self.bump("checkpoint deleted");
        }
        Ok(removed)
    }

    pub async fn cleanup(&self, id: &SessionId, keep_count: usize) -> CoreResult<usize> {
        let handle = self.open(id).await?;
        let live = handle.lock().await;
        let scope = live.scope().ok_or_else(|| CoreError::SessionNotFound(id.clone()))?;
        let removed = self.store.cleanup(&scope, keep_count).await?;
        if removed > 0 {
            self.bump("cleanup");
        }
        Ok(removed)
    }

    /// Truncate the live log back to `checkpoint_id` (inclusive). Destructive for
    /// later entries; confirmation is the caller's job. Checkpoints beyond the
    /// restored point are kept and remain restorable.
    pub async fn restore(&self, checkpoint_id: CheckpointId) -> CoreResult<()> {
        let checkpoint = self.store.get(checkpoint_id).await?;
        let handle = self.open(&checkpoint.session_id).await?;
        let mut live = handle.lock().await;
        if live.reconciler.is_streaming() {
            return Err(CoreError::SessionBusy(checkpoint.session_id));
        }
        let snapshot = self.store.snapshot(checkpoint_id).await?;
        if snapshot.len() != checkpoint.message_index + 1 {
            return Err(StorageError::Corrupt(format!(
                "checkpoint {checkpoint_id} snapshot has {} entries, expected {}",
                snapshot.len(),
                checkpoint.message_index + 1
            ))
            .into());
        }
        self.store.backend().save_log(&checkpoint.session_id, &snapshot).await?;
        live.reconciler.replace_log(snapshot);
        live.current_checkpoint = Some(checkpoint_id);
        live.pending_auto = None;
        self.bump("restore");
        info!(session_id = %checkpoint.session_id, checkpoint_id = %checkpoint_id, index = checkpoint.message_index, "session restored");
        Ok(())
    }

    /// Branch `checkpoint_id` into a new session. The source session and its
    /// checkpoints are left as they were.
    pub async fn fork(
        &self,
        checkpoint_id: CheckpointId,
        new_session_id: SessionId,
        new_label: impl Into<String>,
    ) -> CoreResult<Session> {
        let checkpoint = self.store.get(checkpoint_id).await?;
        let source = self.open(&checkpoint.session_id).await?;
        let source = source.lock().await;
        if source.reconciler.is_streaming() {
            return Err(CoreError::SessionBusy(checkpoint.session_id));
        }
        if self.get(&new_session_id).await.is_some()
            || self.store.backend().load_session(&new_session_id).await?.is_some()
        {
            return Err(CoreError::DuplicateSessionId(new_session_id));
        }
        let snapshot = self.store.snapshot(checkpoint_id).await?;
        let Some(last_index) = snapshot.len().checked_sub(1) else {
            return Err(StorageError::Corrupt(format!("checkpoint {checkpoint_id} has an empty snapshot")).into());
        };
        let inherited = match source.scope() {
            Some(scope) => Some(self.store.get_settings(&scope).await?),
            None => None,
        };

        let mut session = Session::new(new_session_id.clone(), checkpoint.project_id.clone(), source.project_path.clone());
        session.forked_from = Some(ForkOrigin { session_id: checkpoint.session_id.clone(), checkpoint_id });
        self.store.backend().create_session(&session, &snapshot).await.map_err(|e| match e {
            StorageError::Conflict(_) => CoreError::DuplicateSessionId(new_session_id.clone()),
            other => other.into(),
        })?;

        let seeded = self.seed_fork(&session, &snapshot, last_index, inherited, new_label.into()).await;
        let root = match seeded {
            Ok(root) => root,
            Err(e) => {
                self.discard_fork(&session.id).await;
                return Err(e);
            }
        };

        let mut live = LiveSession::resume(session.clone(), snapshot);
        live.current_checkpoint = Some(root.id);
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&session.id) {
                drop(sessions);
                self.discard_fork(&session.id).await;
                return Err(CoreError::DuplicateSessionId(session.id));
            }
            sessions.insert(session.id.clone(), Arc::new(Mutex::new(live)));
        }
        self.bump("fork");
        info!(source = %checkpoint.session_id, checkpoint_id = %checkpoint_id, session_id = %session.id, "session forked");
        Ok(session)
    }

    async fn seed_fork(
        &self,
        session: &Session,
        snapshot: &[StreamEvent],
        last_index: usize,
        inherited: Option<CheckpointSettings>,
        label: String,
    ) -> CoreResult<Checkpoint> {
        let scope = session.scope();
        if let Some(settings) = inherited {
            self.store.update_settings(&scope, settings).await?;
        }
        let new = NewCheckpoint { message_index: last_index, label, parent_id: None, trigger: CheckpointTrigger::Fork };
        self.store.create_checkpoint(&scope, snapshot, new).await
    }

    async fn discard_fork(&self, id: &SessionId) {
        if let Err(e) = self.store.backend().delete_session(id).await {
            warn!(session_id = %id, error = %e, "failed to roll back forked session");
        }
        self.store.forget_settings(id).await;
    }

    pub async fn timeline(&self, id: &SessionId) -> CoreResult<Timeline> {
        let checkpoints = self.store.list(id).await?;
        let current = match self.get(id).await {
            Some(live) => {
                let live = live.lock().await;
                live.current_checkpoint
            }
            None => checkpoints.iter().max_by_key(|c| c.created_at).map(|c| c.id),
        };
        let total = checkpoints.len();
        Ok(Timeline { session_id: id.clone(), current_checkpoint: current, roots: build_tree(checkpoints), total_checkpoints: total })
    }

    pub async fn diff(&self, from: CheckpointId, to: CheckpointId) -> CoreResult<CheckpointDiff> {
        let a = self.store.get(from).await?;
        let b = self.store.get(to).await?;
        if a.session_id != b.session_id {
            return Err(CoreError::SessionMismatch { expected: a.session_id, found: b.session_id });
        }
        let before = self.store.snapshot(from).await?;
        let after = self.store.snapshot(to).await?;
        let shared = before.iter().zip(after.iter()).take_while(|(x, y)| x == y).count();
        let tool_calls = after[shared..]
            .iter()
            .filter_map(StreamEvent::message)
            .flat_map(extract_tool_calls)
            .map(|c| c.name)
            .collect();
        Ok(CheckpointDiff {
            from,
            to,
            message_delta: after.len() as i64 - before.len() as i64,
            token_delta: b.metadata.total_tokens as i64 - a.metadata.total_tokens as i64,
            tool_calls,
        })
    }
}

fn build_tree(checkpoints: Vec<Checkpoint>) -> Vec<TimelineNode> {
    let ids: HashSet<CheckpointId> = checkpoints.iter().map(|c| c.id).collect();
    let mut children: HashMap<CheckpointId, Vec<Checkpoint>> = HashMap::new();
    let mut roots = Vec::new();
    for c in checkpoints {
        match c.parent_id.filter(|p| ids.contains(p) && *p != c.id) {
            Some(parent) => children.entry(parent).or_default().push(c),
            None => roots.push(c),
        }
    }
    let mut seen = HashSet::new();
    roots.into_iter().filter_map(|c| attach(c, &mut children, &mut seen)).collect()
}

fn attach(
    checkpoint: Checkpoint,
    children: &mut HashMap<CheckpointId, Vec<Checkpoint>>,
    seen: &mut HashSet<CheckpointId>,
) -> Option<TimelineNode> {
    if !seen.insert(checkpoint.id) {
        return None;
    }
    let kids = children.remove(&checkpoint.id).unwrap_or_default();
    let children = kids.into_iter().filter_map(|k| attach(k, children, seen)).collect();
    Some(TimelineNode { checkpoint, children })
}
