use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointSettings};
use crate::error::CoreError;
use crate::launcher::PromptRequest;
use crate::model::{EnhancedMessage, enhance_messages};
use crate::queue::{ExecutionQueue, QueueSnapshot, Submission};
use crate::runner::SessionRunner;
use crate::session::{CheckpointId, Session, SessionId};
use crate::timeline::{CheckpointDiff, LiveSession, SessionSnapshot, Timeline, TimelineManager};

#[derive(Clone)]
pub struct AppState {
    pub timeline: Arc<TimelineManager>,
    pub queue: Arc<ExecutionQueue>,
    pub runner: Arc<SessionRunner>,
    pub keep_count: usize,
}

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::SessionBusy(_) | CoreError::DuplicateSessionId(_) => StatusCode::CONFLICT,
            CoreError::CheckpointNotFound(_) | CoreError::SessionNotFound(_) | CoreError::RunNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            CoreError::InvalidIndex { .. } | CoreError::SessionMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::MalformedEvent(_) => StatusCode::BAD_REQUEST,
            CoreError::Launch(_) => StatusCode::BAD_GATEWAY,
            CoreError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
struct VersionResponse {
    version: u64,
}

async fn version(State(state): State<AppState>) -> Json<VersionResponse> {
    Json(VersionResponse { version: state.timeline.version() })
}

#[derive(Debug, Serialize)]
struct ListSessionsResponse {
    sessions: Vec<SessionSnapshot>,
}

async fn list_sessions(State(state): State<AppState>) -> Json<ListSessionsResponse> {
    let mut sessions = Vec::new();
    for id in state.timeline.session_ids().await {
        if let Some(live) = state.timeline.get(&id).await {
            sessions.push(live.lock().await.snapshot());
        }
    }
    Json(ListSessionsResponse { sessions })
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<SessionSnapshot> {
    let live = state.timeline.open(&SessionId::from(id)).await?;
    let snapshot = live.lock().await.snapshot();
    Ok(Json(snapshot))
}

async fn get_messages(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<EnhancedMessage>> {
    let live = state.timeline.open(&SessionId::from(id)).await?;
    let live = live.lock().await;
    Ok(Json(enhance_messages(live.reconciler.log())))
}

async fn get_settings(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<CheckpointSettings> {
    Ok(Json(state.timeline.settings(&SessionId::from(id)).await?))
}

async fn put_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(settings): Json<CheckpointSettings>,
) -> ApiResult<CheckpointSettings> {
    state.timeline.update_settings(&SessionId::from(id), settings).await?;
    Ok(Json(settings))
}

async fn list_checkpoints(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<Checkpoint>> {
    Ok(Json(state.timeline.list_checkpoints(&SessionId::from(id)).await?))
}

#[derive(Debug, Deserialize)]
struct CreateCheckpointBody {
    message_index: usize,
    label: Option<String>,
}

async fn create_checkpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateCheckpointBody>,
) -> Result<(StatusCode, Json<Checkpoint>), ApiError> {
    let label = body.label.unwrap_or_else(|| format!("checkpoint @{}", body.message_index));
    let checkpoint = state.timeline.create_checkpoint(&SessionId::from(id), body.message_index, label).await?;
    Ok((StatusCode::CREATED, Json(checkpoint)))
}

#[derive(Debug, Default, Deserialize)]
struct CleanupBody {
    keep_count: Option<usize>,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    removed: usize,
}

async fn cleanup(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CleanupBody>>,
) -> ApiResult<CleanupResponse> {
    let keep = body.and_then(|Json(b)| b.keep_count).unwrap_or(state.keep_count);
    let removed = state.timeline.cleanup(&SessionId::from(id), keep).await?;
    Ok(Json(CleanupResponse { removed }))
}

async fn get_timeline(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Timeline> {
    Ok(Json(state.timeline.timeline(&SessionId::from(id)).await?))
}

async fn get_checkpoint(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Checkpoint> {
    Ok(Json(state.timeline.store().get(CheckpointId::from_uuid(id)).await?))
}

async fn delete_checkpoint(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.timeline.delete_checkpoint(CheckpointId::from_uuid(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restore(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<SessionSnapshot> {
    let id = CheckpointId::from_uuid(id);
    state.timeline.restore(id).await?;
    let checkpoint = state.timeline.store().get(id).await?;
    let live = state.timeline.open(&checkpoint.session_id).await?;
    let snapshot = live.lock().await.snapshot();
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
struct ForkBody {
    new_session_id: String,
    label: String,
}

async fn fork(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ForkBody>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let session = state
        .timeline
        .fork(CheckpointId::from_uuid(id), SessionId::from(body.new_session_id), body.label)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn diff(State(state): State<AppState>, Path((from, to)): Path<(Uuid, Uuid)>) -> ApiResult<CheckpointDiff> {
    Ok(Json(state.timeline.diff(CheckpointId::from_uuid(from), CheckpointId::from_uuid(to)).await?))
}

async fn get_queue(State(state): State<AppState>) -> Json<QueueSnapshot> {
    Json(state.queue.snapshot().await)
}

async fn submit_prompt(State(state): State<AppState>, Json(req): Json<PromptRequest>) -> ApiResult<Submission> {
    Ok(Json(state.queue.submit(req).await?))
}

async fn remove_prompt(State(state): State<AppState>, Path(id): Path<u64>) -> StatusCode {
    if state.queue.remove(id).await { StatusCode::NO_CONTENT } else { StatusCode::NOT_FOUND }
}

#[derive(Debug, Deserialize)]
struct StartRunBody {
    project_id: String,
    project_path: PathBuf,
    /// Resume a stored session instead of deriving one from the feed.
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunStarted {
    key: String,
    session_id: Option<SessionId>,
}

async fn start_run(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<StartRunBody>,
) -> Result<(StatusCode, Json<RunStarted>), ApiError> {
    let session = match body.session_id {
        Some(id) => {
            let id = SessionId::from(id);
            let live = state.timeline.open(&id).await?;
            if live.lock().await.reconciler.is_streaming() {
                return Err(CoreError::SessionBusy(id).into());
            }
            live
        }
        None => Arc::new(Mutex::new(LiveSession::new(body.project_id, body.project_path))),
    };
    let session_id = session.lock().await.session_id().cloned();
    state.runner.start(key.clone(), session).await;
    Ok((StatusCode::CREATED, Json(RunStarted { key, session_id })))
}

#[derive(Debug, Serialize)]
struct EventsAccepted {
    accepted: usize,
}

/// JSONL body, one feed item per line.
async fn push_events(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: String,
) -> ApiResult<EventsAccepted> {
    let lines: Vec<String> = body.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_owned).collect();
    let accepted = state.runner.push(&key, lines).await.ok_or_else(|| CoreError::RunNotFound(key.clone()))?;
    Ok(Json(EventsAccepted { accepted }))
}

async fn cancel_run(State(state): State<AppState>, Path(key): Path<String>) -> Result<StatusCode, ApiError> {
    if state.runner.cancel(&key).await? { Ok(StatusCode::NO_CONTENT) } else { Ok(StatusCode::NOT_FOUND) }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/version", get(version))
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/:id", get(get_session))
        .route("/v1/sessions/:id/messages", get(get_messages))
        .route("/v1/sessions/:id/settings", get(get_settings).put(put_settings))
        .route("/v1/sessions/:id/checkpoints", get(list_checkpoints).post(create_checkpoint))
        .route("/v1/sessions/:id/checkpoints/cleanup", post(cleanup))
        .route("/v1/sessions/:id/timeline", get(get_timeline))
        .route("/v1/checkpoints/:id", get(get_checkpoint).delete(delete_checkpoint))
        .route("/v1/checkpoints/:id/restore", post(restore))
        .route("/v1/checkpoints/:id/fork", post(fork))
        .route("/v1/checkpoints/:id/diff/:to", get(diff))
        .route("/v1/queue", get(get_queue).post(submit_prompt))
        .route("/v1/queue/:id", delete(remove_prompt))
        .route("/v1/runs/:key", post(start_run))
        .route("/v1/runs/:key/events", post(push_events))
        .route("/v1/runs/:key/cancel", post(cancel_run))
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await?;
    Ok(())
}
