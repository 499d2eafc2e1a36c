use async_trait::async_trait;

use crate::checkpoint::{Checkpoint, CheckpointSettings};
use crate::error::StorageError;
use crate::model::StreamEvent;
use crate::session::{CheckpointId, Session, SessionId};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable home for sessions, their logs, checkpoints and checkpoint settings.
///
/// Every call is expected to be atomic on its own; callers never retry.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    async fn load_checkpoints(&self, session: &SessionId) -> StorageResult<Vec<Checkpoint>>;
    async fn load_checkpoint(&self, id: CheckpointId) -> StorageResult<Option<Checkpoint>>;
    /// Stores the checkpoint together with the log prefix it covers.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint, snapshot: &[StreamEvent]) -> StorageResult<()>;
    async fn load_snapshot(&self, id: CheckpointId) -> StorageResult<Option<Vec<StreamEvent>>>;
    async fn delete_checkpoint(&self, id: CheckpointId) -> StorageResult<bool>;

    /// Settings are scoped to a session within a project.
    async fn load_settings(&self, session: &SessionId, project_id: &str) -> StorageResult<Option<CheckpointSettings>>;
    async fn save_settings(
        &self,
        session: &SessionId,
        project_id: &str,
        settings: &CheckpointSettings,
    ) -> StorageResult<()>;

    /// Inserts a new session with its log. Fails with [`StorageError::Conflict`] if the id exists.
    async fn create_session(&self, session: &Session, log: &[StreamEvent]) -> StorageResult<()>;
    /// Inserts or updates session metadata, leaving any stored log in place.
    async fn upsert_session(&self, session: &Session) -> StorageResult<()>;
    async fn load_session(&self, id: &SessionId) -> StorageResult<Option<(Session, Vec<StreamEvent>)>>;
    async fn save_log(&self, id: &SessionId, log: &[StreamEvent]) -> StorageResult<()>;
    /// Removes a session and everything stored for it.
    async fn delete_session(&self, id: &SessionId) -> StorageResult<bool>;
}
