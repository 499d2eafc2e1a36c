use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::policy::{ToolClassifier, should_auto_checkpoint};
use super::{Checkpoint, CheckpointMetadata, CheckpointSettings, NewCheckpoint};
use crate::error::{CoreError, CoreResult};
use crate::model::{MessageKind, StreamEvent};
use crate::session::{CheckpointId, SessionId, SessionScope};
use crate::storage::CheckpointBackend;

/// Checkpoint persistence plus the settings cache the auto-checkpoint policy reads.
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
    classifier: ToolClassifier,
    defaults: CheckpointSettings,
    settings: RwLock<HashMap<SettingsKey, CheckpointSettings>>,
}

type SettingsKey = (SessionId, String);

fn settings_key(scope: &SessionScope) -> SettingsKey {
    (scope.session_id.clone(), scope.project_id.clone())
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>, classifier: ToolClassifier, defaults: CheckpointSettings) -> Self {
        Self { backend, classifier, defaults, settings: RwLock::new(HashMap::new()) }
    }

    pub fn backend(&self) -> &Arc<dyn CheckpointBackend> {
        &self.backend
    }

    pub async fn get_settings(&self, scope: &SessionScope) -> CoreResult<CheckpointSettings> {
        let key = settings_key(scope);
        if let Some(s) = self.settings.read().await.get(&key) {
            return Ok(*s);
        }
        let loaded = self.backend.load_settings(&scope.session_id, &scope.project_id).await?.unwrap_or(self.defaults);
        self.settings.write().await.insert(key, loaded);
        Ok(loaded)
    }

    /// The cache only changes once the backend accepted the write.
    pub async fn update_settings(&self, scope: &SessionScope, settings: CheckpointSettings) -> CoreResult<()> {
        self.backend.save_settings(&scope.session_id, &scope.project_id, &settings).await?;
        self.settings.write().await.insert(settings_key(scope), settings);
        info!(session_id = %scope.session_id, project_id = %scope.project_id, strategy = settings.strategy.as_str(), enabled = settings.auto_checkpoint_enabled, "checkpoint settings updated");
        Ok(())
    }

    /// Drop cached settings for every project of `session`, after its rows were deleted.
    pub async fn forget_settings(&self, session: &SessionId) {
        self.settings.write().await.retain(|(id, _), _| id != session);
    }

    pub async fn should_auto_checkpoint(&self, scope: &SessionScope, last: &StreamEvent) -> CoreResult<bool> {
        let settings = self.get_settings(scope).await?;
        Ok(should_auto_checkpoint(&settings, &self.classifier, last))
    }

    pub async fn create_checkpoint(
        &self,
        scope: &SessionScope,
        log: &[StreamEvent],
        new: NewCheckpoint,
    ) -> CoreResult<Checkpoint> {
        if new.message_index >= log.len() {
            return Err(CoreError::InvalidIndex { index: new.message_index, len: log.len() });
        }
        let prefix = &log[..=new.message_index];
        let checkpoint = Checkpoint {
            id: CheckpointId::new(),
            session_id: scope.session_id.clone(),
            project_id: scope.project_id.clone(),
            message_index: new.message_index,
            created_at: Utc::now(),
            label: new.label,
            parent_id: new.parent_id,
            metadata: CheckpointMetadata {
                total_tokens: prefix.iter().filter_map(|e| e.response_usage()).map(|u| u.total()).sum(),
                user_prompt: last_user_prompt(prefix),
                trigger: new.trigger,
            },
        };
        self.backend.save_checkpoint(&checkpoint, prefix).await?;
        metrics::counter!("checkpoints_created_total", "trigger" => checkpoint.metadata.trigger.as_str()).increment(1);
        debug!(session_id = %scope.session_id, checkpoint_id = %checkpoint.id, index = checkpoint.message_index, "checkpoint created");
        Ok(checkpoint)
    }

    /// Checkpoints of a session ordered by message index, then creation time.
    pub async fn list(&self, session: &SessionId) -> CoreResult<Vec<Checkpoint>> {
        let mut list = self.backend.load_checkpoints(session).await?;
        super::sort_checkpoints(&mut list);
        Ok(list)
    }

    pub async fn get(&self, id: CheckpointId) -> CoreResult<Checkpoint> {
        self.backend.load_checkpoint(id).await?.ok_or(CoreError::CheckpointNotFound(id))
    }

    pub async fn snapshot(&self, id: CheckpointId) -> CoreResult<Vec<StreamEvent>> {
        self.backend.load_snapshot(id).await?.ok_or(CoreError::CheckpointNotFound(id))
    }

    pub async fn delete(&self, id: CheckpointId) -> CoreResult<bool> {
        Ok(self.backend.delete_checkpoint(id).await?)
    }

    /// Keep the `keep_count` most recently created checkpoints, delete the rest.
    pub async fn cleanup(&self, scope: &SessionScope, keep_count: usize) -> CoreResult<usize> {
        let mut list = self.backend.load_checkpoints(&scope.session_id).await?;
        if list.len() <= keep_count {
            return Ok(0);
        }
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.message_index.cmp(&a.message_index)));
        let mut removed = 0;
        for stale in &list[keep_count..] {
            if self.backend.delete_checkpoint(stale.id).await? {
                removed += 1;
            }
        }
        metrics::counter!("checkpoints_removed_total").increment(removed as u64);
        info!(session_id = %scope.session_id, removed, keep_count, "checkpoint cleanup");
        Ok(removed)
    }
}

fn last_user_prompt(prefix: &[StreamEvent]) -> Option<String> {
    prefix
        .iter()
        .rev()
        .filter_map(StreamEvent::message)
        .filter(|m| m.kind == MessageKind::User)
        .find_map(|m| m.text_content())
}
