use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CheckpointBackend, StorageResult};
use crate::checkpoint::{Checkpoint, CheckpointSettings, sort_checkpoints};
use crate::error::StorageError;
use crate::model::StreamEvent;
use crate::session::{CheckpointId, Session, SessionId};

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, (Session, Vec<StreamEvent>)>,
    checkpoints: HashMap<CheckpointId, (Checkpoint, Vec<StreamEvent>)>,
    settings: HashMap<(SessionId, String), CheckpointSettings>,
}

/// Process-local backend. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointBackend for MemoryBackend {
    async fn load_checkpoints(&self, session: &SessionId) -> StorageResult<Vec<Checkpoint>> {
        let tables = self.tables.read().await;
        let mut out: Vec<Checkpoint> =
            tables.checkpoints.values().filter(|(c, _)| &c.session_id == session).map(|(c, _)| c.clone()).collect();
        sort_checkpoints(&mut out);
        Ok(out)
    }

    async fn load_checkpoint(&self, id: CheckpointId) -> StorageResult<Option<Checkpoint>> {
        Ok(self.tables.read().await.checkpoints.get(&id).map(|(c, _)| c.clone()))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint, snapshot: &[StreamEvent]) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        if tables.checkpoints.contains_key(&checkpoint.id) {
            return Err(StorageError::Conflict(checkpoint.id.to_string()));
        }
        tables.checkpoints.insert(checkpoint.id, (checkpoint.clone(), snapshot.to_vec()));
        Ok(())
    }

    async fn load_snapshot(&self, id: CheckpointId) -> StorageResult<Option<Vec<StreamEvent>>> {
        Ok(self.tables.read().await.checkpoints.get(&id).map(|(_, s)| s.clone()))
    }

    async fn delete_checkpoint(&self, id: CheckpointId) -> StorageResult<bool> {
        Ok(self.tables.write().await.checkpoints.remove(&id).is_some())
    }

    async fn load_settings(&self, session: &SessionId, project_id: &str) -> StorageResult<Option<CheckpointSettings>> {
        let key = (session.clone(), project_id.to_owned());
        Ok(self.tables.read().await.settings.get(&key).copied())
    }

    async fn save_settings(
        &self,
        session: &SessionId,
        project_id: &str,
        settings: &CheckpointSettings,
    ) -> StorageResult<()> {
        self.tables.write().await.settings.insert((session.clone(), project_id.to_owned()), *settings);
        Ok(())
    }

    async fn create_session(&self, session: &Session, log: &[StreamEvent]) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        if tables.sessions.contains_key(&session.id) {
            return Err(StorageError::Conflict(session.id.to_string()));
        }
        tables.sessions.insert(session.id.clone(), (session.clone(), log.to_vec()));
        Ok(())
    }

    async fn upsert_session(&self, session: &Session) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .sessions
            .entry(session.id.clone())
            .and_modify(|(s, _)| {
                s.project_id = session.project_id.clone();
                s.project_path = session.project_path.clone();
            })
            .or_insert_with(|| (session.clone(), Vec::new()));
        Ok(())
    }

    async fn load_session(&self, id: &SessionId) -> StorageResult<Option<(Session, Vec<StreamEvent>)>> {
        Ok(self.tables.read().await.sessions.get(id).cloned())
    }

    async fn save_log(&self, id: &SessionId, log: &[StreamEvent]) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let Some((_, stored)) = tables.sessions.get_mut(id) else {
            return Err(StorageError::Corrupt(format!("no session row for {id}")));
        };
        *stored = log.to_vec();
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        tables.checkpoints.retain(|_, (c, _)| &c.session_id != id);
        tables.settings.retain(|(session, _), _| session != id);
        Ok(tables.sessions.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_conflict_and_cascade_delete() {
        let db = MemoryBackend::new();
        let session = Session::new("s1".into(), "p", "/repo");
        db.create_session(&session, &[]).await.unwrap();
        assert!(matches!(db.create_session(&session, &[]).await, Err(StorageError::Conflict(_))));
        db.save_settings(&session.id, "p", &CheckpointSettings::default()).await.unwrap();
        db.save_settings(&session.id, "other", &CheckpointSettings::default()).await.unwrap();
        assert!(db.delete_session(&session.id).await.unwrap());
        assert!(db.load_settings(&session.id, "p").await.unwrap().is_none());
        assert!(db.load_settings(&session.id, "other").await.unwrap().is_none());
        assert!(db.save_log(&session.id, &[]).await.is_err());
    }
}
