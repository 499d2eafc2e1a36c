use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::session::SessionId;

/// How a prompt reaches the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PromptKind {
    New,
    Continue,
    Resume { session_id: SessionId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub project_path: PathBuf,
    pub prompt: String,
    pub model: String,
    #[serde(flatten)]
    pub kind: PromptKind,
}

/// External agent-process control. The core never starts processes itself; it
/// only forwards dispatch and cancel requests through this seam.
#[async_trait]
pub trait ExecutionLauncher: Send + Sync {
    async fn execute(&self, project_path: &Path, prompt: &str, model: &str) -> anyhow::Result<()>;
    async fn continue_conversation(&self, project_path: &Path, prompt: &str, model: &str) -> anyhow::Result<()>;
    async fn resume(&self, project_path: &Path, session_id: &SessionId, prompt: &str, model: &str) -> anyhow::Result<()>;
    async fn cancel(&self, session_id: Option<&SessionId>) -> anyhow::Result<()>;

    async fn dispatch(&self, req: &PromptRequest) -> anyhow::Result<()> {
        match &req.kind {
            PromptKind::New => self.execute(&req.project_path, &req.prompt, &req.model).await,
            PromptKind::Continue => self.continue_conversation(&req.project_path, &req.prompt, &req.model).await,
            PromptKind::Resume { session_id } => {
                self.resume(&req.project_path, session_id, &req.prompt, &req.model).await
            }
        }
    }
}

/// Records requests in the log and does nothing else. Used by `serve` when no
/// agent process is wired in.
#[derive(Debug, Clone, Default)]
pub struct LoggingLauncher;

#[async_trait]
impl ExecutionLauncher for LoggingLauncher {
    async fn execute(&self, project_path: &Path, prompt: &str, model: &str) -> anyhow::Result<()> {
        info!(path = %project_path.display(), model, prompt_len = prompt.len(), "execute");
        Ok(())
    }

    async fn continue_conversation(&self, project_path: &Path, prompt: &str, model: &str) -> anyhow::Result<()> {
        info!(path = %project_path.display(), model, prompt_len = prompt.len(), "continue");
        Ok(())
    }

    async fn resume(&self, project_path: &Path, session_id: &SessionId, prompt: &str, model: &str) -> anyhow::Result<()> {
        info!(path = %project_path.display(), session_id = %session_id, model, prompt_len = prompt.len(), "resume");
        Ok(())
    }

    async fn cancel(&self, session_id: Option<&SessionId>) -> anyhow::Result<()> {
        info!(session_id = ?session_id.map(SessionId::as_str), "cancel");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every call in order.
    #[derive(Debug, Default)]
    pub struct RecordingLauncher {
        pub calls: Mutex<Vec<String>>,
    }

    impl RecordingLauncher {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ExecutionLauncher for RecordingLauncher {
        async fn execute(&self, _: &Path, prompt: &str, _: &str) -> anyhow::Result<()> {
            self.push(format!("execute:{prompt}"));
            Ok(())
        }

        async fn continue_conversation(&self, _: &Path, prompt: &str, _: &str) -> anyhow::Result<()> {
            self.push(format!("continue:{prompt}"));
            Ok(())
        }

        async fn resume(&self, _: &Path, session_id: &SessionId, prompt: &str, _: &str) -> anyhow::Result<()> {
            self.push(format!("resume:{session_id}:{prompt}"));
            Ok(())
        }

        async fn cancel(&self, session_id: Option<&SessionId>) -> anyhow::Result<()> {
            self.push(format!("cancel:{}", session_id.map(SessionId::as_str).unwrap_or("-")));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingLauncher;
    use super::*;

    #[test]
    fn prompt_request_json_shape() {
        let req: PromptRequest = serde_json::from_str(
            r#"{"project_path":"/repo","prompt":"hi","model":"sonnet","mode":"resume","session_id":"s1"}"#,
        )
        .unwrap();
        assert_eq!(req.kind, PromptKind::Resume { session_id: "s1".into() });
        let req: PromptRequest =
            serde_json::from_str(r#"{"project_path":"/repo","prompt":"hi","model":"sonnet","mode":"new"}"#).unwrap();
        assert_eq!(req.kind, PromptKind::New);
    }

    #[tokio::test]
    async fn dispatch_routes_by_kind() {
        let launcher = RecordingLauncher::default();
        let base = PromptRequest {
            project_path: "/repo".into(),
            prompt: "p".into(),
            model: "m".into(),
            kind: PromptKind::New,
        };
        launcher.dispatch(&base).await.unwrap();
        launcher.dispatch(&PromptRequest { kind: PromptKind::Continue, ..base.clone() }).await.unwrap();
        launcher
            .dispatch(&PromptRequest { kind: PromptKind::Resume { session_id: "s9".into() }, ..base })
            .await
            .unwrap();
        assert_eq!(launcher.calls(), vec!["execute:p", "continue:p", "resume:s9:p"]);
    }
}
