use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

use super::{CheckpointBackend, StorageResult};
use crate::checkpoint::{Checkpoint, CheckpointMetadata, CheckpointSettings};
use crate::error::StorageError;
use crate::model::StreamEvent;
use crate::session::{CheckpointId, ForkOrigin, Session, SessionId};

#[derive(Clone)]
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
}

impl SqliteBackend {
    pub async fn initialize(database_url: Option<String>) -> StorageResult<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn resolve_default_db_url() -> StorageResult<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("session_timeline");
    std::fs::create_dir_all(&dir).map_err(|e| StorageError::Unavailable(format!("{}: {e}", dir.display())))?;
    let path = dir.join("timeline.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

fn parse_time(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp {s:?}: {e}")))
}

fn parse_checkpoint_id(s: &str) -> StorageResult<CheckpointId> {
    Uuid::parse_str(s)
        .map(CheckpointId::from_uuid)
        .map_err(|e| StorageError::Corrupt(format!("checkpoint id {s:?}: {e}")))
}

fn checkpoint_from_row(r: &SqliteRow) -> StorageResult<Checkpoint> {
    let id: String = r.try_get("id")?;
    let session_id: String = r.try_get("session_id")?;
    let index: i64 = r.try_get("message_index")?;
    let created_at: String = r.try_get("created_at")?;
    let parent_id: Option<String> = r.try_get("parent_id")?;
    let metadata_json: String = r.try_get("metadata_json")?;
    let metadata: CheckpointMetadata = serde_json::from_str(&metadata_json)?;
    Ok(Checkpoint {
        id: parse_checkpoint_id(&id)?,
        session_id: SessionId::from(session_id),
        project_id: r.try_get("project_id")?,
        message_index: usize::try_from(index).map_err(|_| StorageError::Corrupt(format!("message index {index}")))?,
        created_at: parse_time(&created_at)?,
        label: r.try_get("label")?,
        parent_id: parent_id.as_deref().map(parse_checkpoint_id).transpose()?,
        metadata,
    })
}

fn session_from_row(r: &SqliteRow) -> StorageResult<(Session, Vec<StreamEvent>)> {
    let id: String = r.try_get("id")?;
    let project_path: String = r.try_get("project_path")?;
    let created_at: String = r.try_get("created_at")?;
    let fork_session: Option<String> = r.try_get("forked_from_session")?;
    let fork_checkpoint: Option<String> = r.try_get("forked_from_checkpoint")?;
    let forked_from = match (fork_session, fork_checkpoint) {
        (Some(s), Some(c)) => Some(ForkOrigin { session_id: SessionId::from(s), checkpoint_id: parse_checkpoint_id(&c)? }),
        _ => None,
    };
    let log_json: String = r.try_get("log_json")?;
    let session = Session {
        id: SessionId::from(id),
        project_id: r.try_get("project_id")?,
        project_path: PathBuf::from(project_path),
        created_at: parse_time(&created_at)?,
        forked_from,
    };
    Ok((session, serde_json::from_str(&log_json)?))
}

fn index_to_i64(index: usize) -> StorageResult<i64> {
    i64::try_from(index).map_err(|_| StorageError::Corrupt(format!("message index {index} too large")))
}

#[async_trait]
impl CheckpointBackend for SqliteBackend {
    async fn load_checkpoints(&self, session: &SessionId) -> StorageResult<Vec<Checkpoint>> {
        let rows = sqlx::query(
            "SELECT id, session_id, project_id, message_index, created_at, label, parent_id, metadata_json \
             FROM checkpoints WHERE session_id = ?1 ORDER BY message_index ASC, created_at ASC",
        )
        .bind(session.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn load_checkpoint(&self, id: CheckpointId) -> StorageResult<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT id, session_id, project_id, message_index, created_at, label, parent_id, metadata_json \
             FROM checkpoints WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint, snapshot: &[StreamEvent]) -> StorageResult<()> {
        let metadata_json = serde_json::to_string(&checkpoint.metadata)?;
        let snapshot_json = serde_json::to_string(snapshot)?;
        sqlx::query(
            "INSERT INTO checkpoints (id, session_id, project_id, message_index, created_at, label, parent_id, metadata_json, snapshot_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(checkpoint.id.to_string())
        .bind(checkpoint.session_id.as_str())
        .bind(&checkpoint.project_id)
        .bind(index_to_i64(checkpoint.message_index)?)
        .bind(checkpoint.created_at.to_rfc3339())
        .bind(&checkpoint.label)
        .bind(checkpoint.parent_id.map(|p| p.to_string()))
        .bind(metadata_json)
        .bind(snapshot_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_snapshot(&self, id: CheckpointId) -> StorageResult<Option<Vec<StreamEvent>>> {
        let row = sqlx::query("SELECT snapshot_json FROM checkpoints WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(r) = row else { return Ok(None) };
        let json: String = r.try_get("snapshot_json")?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    async fn delete_checkpoint(&self, id: CheckpointId) -> StorageResult<bool> {
        let res = sqlx::query("DELETE FROM checkpoints WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn load_settings(&self, session: &SessionId, project_id: &str) -> StorageResult<Option<CheckpointSettings>> {
        let row = sqlx::query("SELECT settings_json FROM checkpoint_settings WHERE session_id = ?1 AND project_id = ?2")
            .bind(session.as_str())
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(r) = row else { return Ok(None) };
        let json: String = r.try_get("settings_json")?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    async fn save_settings(
        &self,
        session: &SessionId,
        project_id: &str,
        settings: &CheckpointSettings,
    ) -> StorageResult<()> {
        let json = serde_json::to_string(settings)?;
        sqlx::query(
            "INSERT INTO checkpoint_settings (session_id, project_id, settings_json) VALUES (?1, ?2, ?3) \
             ON CONFLICT(session_id, project_id) DO UPDATE SET settings_json = excluded.settings_json",
        )
        .bind(session.as_str())
        .bind(project_id)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_session(&self, session: &Session, log: &[StreamEvent]) -> StorageResult<()> {
        let log_json = serde_json::to_string(log)?;
        let res = sqlx::query(
            "INSERT INTO sessions (id, project_id, project_path, created_at, forked_from_session, forked_from_checkpoint, log_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) ON CONFLICT(id) DO NOTHING",
        )
        .bind(session.id.as_str())
        .bind(&session.project_id)
        .bind(session.project_path.to_string_lossy().into_owned())
        .bind(session.created_at.to_rfc3339())
        .bind(session.forked_from.as_ref().map(|f| f.session_id.to_string()))
        .bind(session.forked_from.as_ref().map(|f| f.checkpoint_id.to_string()))
        .bind(log_json)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StorageError::Conflict(session.id.to_string()));
        }
        Ok(())
    }

    async fn upsert_session(&self, session: &Session) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO sessions (id, project_id, project_path, created_at, forked_from_session, forked_from_checkpoint) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(id) DO UPDATE SET project_id = excluded.project_id, project_path = excluded.project_path",
        )
        .bind(session.id.as_str())
        .bind(&session.project_id)
        .bind(session.project_path.to_string_lossy().into_owned())
        .bind(session.created_at.to_rfc3339())
        .bind(session.forked_from.as_ref().map(|f| f.session_id.to_string()))
        .bind(session.forked_from.as_ref().map(|f| f.checkpoint_id.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_session(&self, id: &SessionId) -> StorageResult<Option<(Session, Vec<StreamEvent>)>> {
        let row = sqlx::query(
            "SELECT id, project_id, project_path, created_at, forked_from_session, forked_from_checkpoint, log_json \
             FROM sessions WHERE id = ?1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn save_log(&self, id: &SessionId, log: &[StreamEvent]) -> StorageResult<()> {
        let log_json = serde_json::to_string(log)?;
        let res = sqlx::query("UPDATE sessions SET log_json = ?1 WHERE id = ?2")
            .bind(log_json)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StorageError::Corrupt(format!("no session row for {id}")));
        }
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM checkpoints WHERE session_id = ?1").bind(id.as_str()).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM checkpoint_settings WHERE session_id = ?1").bind(id.as_str()).execute(&mut *tx).await?;
        let res = sqlx::query("DELETE FROM sessions WHERE id = ?1").bind(id.as_str()).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(res.rows_affected() > 0)
    }
}
