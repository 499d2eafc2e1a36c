use thiserror::Error;

use crate::session::{CheckpointId, SessionId};

/// Failure to turn a single feed item into a [`crate::model::StreamEvent`].
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event has no string `type` discriminant")]
    MissingDiscriminant,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("record already exists: {0}")]
    Conflict(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("session {0} is streaming")]
    SessionBusy(SessionId),
    #[error("checkpoint {0} not found")]
    CheckpointNotFound(CheckpointId),
    #[error("message index {index} out of range for log of length {len}")]
    InvalidIndex { index: usize, len: usize },
    #[error("session {0} already exists")]
    DuplicateSessionId(SessionId),
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("checkpoint belongs to session {found}, expected {expected}")]
    SessionMismatch { expected: SessionId, found: SessionId },
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] StorageError),
    #[error("malformed event: {0}")]
    MalformedEvent(#[from] EventError),
    #[error("launcher failed: {0}")]
    Launch(String),
    #[error("no run attached under {0}")]
    RunNotFound(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
