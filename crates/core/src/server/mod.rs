use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::config::{resolve_relative_to, AppConfig};
use crate::continuation::ContinuationStore;
use crate::engine::GenerationEngine;
use crate::events::EventBus;
use crate::job::{GenerationRequest, Job, JobStatus};
use crate::scheduler::JobScheduler;
use crate::store::{JobStore, MemoryJobStore, SqliteJobStore};
use crate::title::{DisabledTitleAssist, OllamaTitleClient, TitleAssist};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    scheduler: Arc<JobScheduler>,
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    continuations: ContinuationStore,
    config: RwLock<AppConfig>,
    config_path: PathBuf,
    audio_dir: PathBuf,
}

impl AppState {
    pub fn new(
        engine: Arc<dyn GenerationEngine>,
        config: AppConfig,
        config_path: PathBuf,
        data_dir: PathBuf,
    ) -> Self {
        let store: Arc<dyn JobStore> = match SqliteJobStore::new(&data_dir) {
            Ok(store) => {
                if let Err(err) = store.reconcile_interrupted() {
                    warn!(error = %err, "Failed to reconcile interrupted jobs at startup");
                }
                info!(db_path = %store.db_path().display(), "Using persistent job store");
                Arc::new(store)
            }
            Err(err) => {
                warn!(
                    error = %err,
                    data_dir = %data_dir.display(),
                    "Failed to initialize job persistence; running with in-memory job state only"
                );
                Arc::new(MemoryJobStore::new())
            }
        };

        let title: Arc<dyn TitleAssist> = match OllamaTitleClient::new(&config.title.base_url) {
            Ok(client) => Arc::new(client),
            Err(err) => {
                warn!(
                    error = %err,
                    base_url = %config.title.base_url,
                    "Title assist unavailable; jobs will use the placeholder title"
                );
                Arc::new(DisabledTitleAssist)
            }
        };

        let audio_dir = resolve_relative_to(&data_dir, &config.paths.audio_dir);
        let ref_audio_dir = resolve_relative_to(&data_dir, &config.paths.ref_audio_dir);
        let continuations = ContinuationStore::new(resolve_relative_to(
            &data_dir,
            &config.paths.continuations_dir,
        ));

        let bus = EventBus::new();
        let scheduler = JobScheduler::new(
            Arc::clone(&store),
            engine,
            title,
            continuations.clone(),
            Arc::clone(&bus),
            audio_dir.clone(),
            ref_audio_dir,
        );

        Self {
            inner: Arc::new(AppStateInner {
                scheduler,
                store,
                bus,
                continuations,
                config: RwLock::new(config),
                config_path,
                audio_dir,
            }),
        }
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.inner.scheduler
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CreateJobResponse {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,
    pub title: Option<String>,
    pub prompt: String,
    pub lyrics: Option<String>,
    pub tags: Option<String>,
    pub seed: Option<u32>,
    pub audio_path: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: u32,
    pub parent_job_id: Option<String>,
    pub ref_audio_id: Option<String>,
    pub style_influence: f32,
    pub created_at: DateTime<Utc>,
    /// 1-based position while waiting, absent otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
}

impl JobResponse {
    fn from_job(job: Job, queue_position: Option<usize>) -> Self {
        Self {
            id: job.id,
            status: job.status,
            title: job.title,
            prompt: job.prompt,
            lyrics: job.lyrics,
            tags: job.tags,
            seed: job.seed,
            audio_path: job.audio_path,
            error_message: job.error_message,
            duration_ms: job.duration_ms,
            parent_job_id: job.parent_job_id,
            ref_audio_id: job.ref_audio_id,
            style_influence: job.style_influence,
            created_at: job.created_at,
            queue_position,
        }
    }
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let audio_dir = state.inner.audio_dir.clone();
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config).put(update_config))
        .route("/api/generate", post(create_generation))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(get_job).delete(delete_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/events", get(event_stream))
        .nest_service("/audio", ServeDir::new(audio_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    let config = state.inner.config.read().await.clone();
    Json(config)
}

async fn update_config(
    State(state): State<AppState>,
    Json(payload): Json<AppConfig>,
) -> Result<Json<AppConfig>, ApiError> {
    payload.save_to_path(&state.inner.config_path)?;

    {
        let mut config = state.inner.config.write().await;
        *config = payload.clone();
    }

    Ok(Json(payload))
}

async fn create_generation(
    State(state): State<AppState>,
    Json(payload): Json<GenerationRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    payload.validate().map_err(ApiError::BadRequest)?;

    let job = Job::from_request(payload);
    state
        .inner
        .store
        .save(&job)
        .map_err(|e| ApiError::Internal(format!("failed to persist new job: {e:#}")))?;

    state.inner.scheduler.submit(&job.id);
    info!(job_id = %job.id, "Job created");

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            id: job.id,
            status: JobStatus::Queued,
            created_at: job.created_at,
        }),
    ))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let jobs = state
        .inner
        .store
        .list()
        .map_err(|e| ApiError::Internal(format!("failed to list jobs: {e:#}")))?;

    let responses = jobs
        .into_iter()
        .map(|job| {
            let position = queue_position_for(&state, &job);
            JobResponse::from_job(job, position)
        })
        .collect();
    Ok(Json(responses))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .inner
        .store
        .find(&job_id)
        .map_err(|e| ApiError::Internal(format!("failed to load job: {e:#}")))?
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {job_id}")))?;

    let position = queue_position_for(&state, &job);
    Ok(Json(JobResponse::from_job(job, position)))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Json<CancelResponse> {
    let cancelled = state.inner.scheduler.cancel(&job_id);
    Json(CancelResponse { cancelled })
}

/// Delete the durable record. This is the external delete the scheduler must
/// tolerate mid-flight: an active job is cancelled first, and any in-progress
/// pipeline observes the missing record and aborts silently.
async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    state.inner.scheduler.cancel(&job_id);

    let deleted = state
        .inner
        .store
        .delete(&job_id)
        .map_err(|e| ApiError::Internal(format!("failed to delete job: {e:#}")))?;
    if !deleted {
        return Err(ApiError::NotFound(format!("job not found: {job_id}")));
    }

    let audio_file = state.inner.audio_dir.join(format!("song_{job_id}.wav"));
    if audio_file.exists() {
        if let Err(err) = std::fs::remove_file(&audio_file) {
            warn!(job_id, error = %err, "Failed to remove audio artifact");
        }
    }
    if let Err(err) = state.inner.continuations.remove(&job_id) {
        warn!(job_id, error = %err, "Failed to remove continuation artifact");
    }

    info!(job_id, "Job deleted");
    Ok(Json(DeleteResponse { deleted: true }))
}

/// Live event feed. One bounded bus subscription per connection, closed by
/// the client going away (drop deregisters) or by the reserved shutdown
/// event.
async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.inner.bus.subscribe();
    let stream = subscription
        .map(|event| Ok(SseEvent::default().event(event.kind).data(event.payload.to_string())));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn queue_position_for(state: &AppState, job: &Job) -> Option<usize> {
    if job.status != JobStatus::Queued {
        return None;
    }
    match state.inner.scheduler.queue_position(&job.id) {
        0 => None,
        position => Some(position),
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}
