use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session identifier as reported by the agent (or chosen by the caller when forking).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(Uuid);

impl CheckpointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CheckpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a forked session branched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkOrigin {
    pub session_id: SessionId,
    pub checkpoint_id: CheckpointId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub project_id: String,
    pub project_path: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<ForkOrigin>,
}

impl Session {
    pub fn new(id: SessionId, project_id: impl Into<String>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            project_id: project_id.into(),
            project_path: project_path.into(),
            created_at: Utc::now(),
            forked_from: None,
        }
    }

    pub fn scope(&self) -> SessionScope {
        SessionScope {
            session_id: self.id.clone(),
            project_id: self.project_id.clone(),
            project_path: self.project_path.clone(),
        }
    }
}

/// The (session, project, path) triple that checkpoint settings and operations are keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionScope {
    pub session_id: SessionId,
    pub project_id: String,
    pub project_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_serializes_as_plain_string() {
        let id = SessionId::from("abc-123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc-123\"");
        let back: SessionId = serde_json::from_str("\"abc-123\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn scope_mirrors_session_fields() {
        let s = Session::new("s1".into(), "proj", "/repo");
        let scope = s.scope();
        assert_eq!(scope.session_id, s.id);
        assert_eq!(scope.project_id, "proj");
        assert_eq!(scope.project_path, PathBuf::from("/repo"));
        assert!(s.forked_from.is_none());
    }
}
