use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_DURATION_MS: u32 = 240_000;
pub const MIN_DURATION_MS: u32 = 1_000;
pub const MAX_DURATION_MS: u32 = 600_000;
pub const DEFAULT_STYLE_INFLUENCE: f32 = 100.0;

/// Lifecycle state of a generation job.
///
/// Only forward transitions are legal:
/// `Queued → Processing → {Completed, Failed}`. A user-requested abort of a
/// running job terminates as `Failed` with an abort message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// Durable record of one generation request.
///
/// The record is owned by the job store; the scheduler re-fetches it before
/// every mutation because an external actor may delete it at any time while
/// generation is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
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
    pub temperature: f32,
    pub cfg_scale: f32,
    pub top_k: u32,
    pub title_model: Option<String>,
    pub parent_job_id: Option<String>,
    pub ref_audio_id: Option<String>,
    pub style_influence: f32,
    pub ref_audio_start_sec: Option<f32>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn from_request(request: GenerationRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Queued,
            title: None,
            prompt: request.prompt,
            lyrics: request.lyrics,
            tags: request.tags,
            seed: request.seed,
            audio_path: None,
            error_message: None,
            duration_ms: request.duration_ms,
            temperature: request.temperature,
            cfg_scale: request.cfg_scale,
            top_k: request.top_k,
            title_model: request.title_model,
            parent_job_id: request.parent_job_id,
            ref_audio_id: request.ref_audio_id,
            style_influence: request.style_influence,
            ref_audio_start_sec: request.ref_audio_start_sec,
            created_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

/// API payload for `POST /api/generate`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub lyrics: Option<String>,
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub seed: Option<u32>,
    #[serde(default)]
    pub title_model: Option<String>,
    #[serde(default)]
    pub parent_job_id: Option<String>,
    #[serde(default)]
    pub ref_audio_id: Option<String>,
    #[serde(default = "default_style_influence")]
    pub style_influence: f32,
    #[serde(default)]
    pub ref_audio_start_sec: Option<f32>,
}

impl GenerationRequest {
    /// Validate request bounds before a job record is created.
    pub fn validate(&self) -> Result<(), String> {
        if self.prompt.trim().is_empty() {
            return Err("prompt must not be empty".to_string());
        }
        if self.duration_ms < MIN_DURATION_MS || self.duration_ms > MAX_DURATION_MS {
            return Err(format!(
                "duration_ms must be within [{MIN_DURATION_MS}, {MAX_DURATION_MS}]"
            ));
        }
        if !(0.0..=100.0).contains(&self.style_influence) {
            return Err("style_influence must be within [0, 100]".to_string());
        }
        if self.temperature <= 0.0 {
            return Err("temperature must be positive".to_string());
        }
        Ok(())
    }
}

fn default_duration_ms() -> u32 {
    DEFAULT_DURATION_MS
}

fn default_temperature() -> f32 {
    1.0
}

fn default_cfg_scale() -> f32 {
    1.5
}

fn default_top_k() -> u32 {
    50
}

fn default_style_influence() -> f32 {
    DEFAULT_STYLE_INFLUENCE
}
