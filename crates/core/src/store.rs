use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection};
use tracing::{info, warn};

use crate::job::{Job, JobStatus};

const STATUS_QUEUED: &str = "queued";
const STATUS_PROCESSING: &str = "processing";
const STATUS_COMPLETED: &str = "completed";
const STATUS_FAILED: &str = "failed";

/// Durable home of job records.
///
/// The scheduler never holds a `Job` in memory across the blocking generation
/// call — it re-fetches before every write, because records may be deleted by
/// an external actor at any point. Implementations must be safe to call
/// concurrently from multiple job lifecycles.
pub trait JobStore: Send + Sync {
    fn find(&self, job_id: &str) -> Result<Option<Job>>;
    fn save(&self, job: &Job) -> Result<()>;
    fn delete(&self, job_id: &str) -> Result<bool>;
    /// All records, newest first.
    fn list(&self) -> Result<Vec<Job>>;
}

/// SQLite-backed job store: one short-lived connection per operation, WAL
/// journal, bounded busy timeout.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    db_path: PathBuf,
}

impl SqliteJobStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!(
                "failed to create data directory for jobs db: {}",
                data_dir.display()
            )
        })?;

        let store = Self {
            db_path: data_dir.join("jobs.db"),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Mark jobs left `queued`/`processing` by a previous process as failed.
    ///
    /// Their generation threads died with that process; the record survives
    /// with an explanatory error so clients are not left watching a job that
    /// will never finish. Returns the number of reconciled rows.
    pub fn reconcile_interrupted(&self) -> Result<usize> {
        self.with_connection(|conn| {
            let reconciled = conn
                .execute(
                    "UPDATE jobs
                     SET status = ?1,
                         error_message = 'interrupted by process restart',
                         updated_at = ?2
                     WHERE status IN (?3, ?4)",
                    params![
                        STATUS_FAILED,
                        Utc::now().to_rfc3339(),
                        STATUS_QUEUED,
                        STATUS_PROCESSING
                    ],
                )
                .context("failed to reconcile interrupted jobs")?;
            if reconciled > 0 {
                info!(reconciled, "Marked interrupted jobs as failed at startup");
            }
            Ok(reconciled)
        })
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    title TEXT,
                    prompt TEXT NOT NULL,
                    lyrics TEXT,
                    tags TEXT,
                    seed INTEGER,
                    audio_path TEXT,
                    error_message TEXT,
                    duration_ms INTEGER NOT NULL,
                    temperature REAL NOT NULL,
                    cfg_scale REAL NOT NULL,
                    top_k INTEGER NOT NULL,
                    title_model TEXT,
                    parent_job_id TEXT,
                    ref_audio_id TEXT,
                    style_influence REAL NOT NULL,
                    ref_audio_start_sec REAL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at DESC);
                 CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);",
            )
            .with_context(|| {
                format!(
                    "failed to initialize jobs schema: {}",
                    self.db_path.display()
                )
            })?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open jobs db: {}", self.db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("failed to set jobs db busy timeout")?;
        op(&conn)
    }

    fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
        let status_raw: String = row.get("status")?;
        let status = parse_status(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown persisted status: {status_raw}"),
                )),
            )
        })?;

        let created_raw: String = row.get("created_at")?;
        let created_at = parse_timestamp(&created_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                18,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e.to_string(),
                )),
            )
        })?;

        Ok(Job {
            id: row.get("id")?,
            status,
            title: row.get("title")?,
            prompt: row.get("prompt")?,
            lyrics: row.get("lyrics")?,
            tags: row.get("tags")?,
            seed: row.get("seed")?,
            audio_path: row.get("audio_path")?,
            error_message: row.get("error_message")?,
            duration_ms: row.get("duration_ms")?,
            temperature: row.get("temperature")?,
            cfg_scale: row.get("cfg_scale")?,
            top_k: row.get("top_k")?,
            title_model: row.get("title_model")?,
            parent_job_id: row.get("parent_job_id")?,
            ref_audio_id: row.get("ref_audio_id")?,
            style_influence: row.get("style_influence")?,
            ref_audio_start_sec: row.get("ref_audio_start_sec")?,
            created_at,
        })
    }
}

impl JobStore for SqliteJobStore {
    fn find(&self, job_id: &str) -> Result<Option<Job>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
            let mut rows = stmt.query_map(params![job_id], Self::job_from_row)?;
            match rows.next() {
                Some(row) => Ok(Some(
                    row.with_context(|| format!("failed to decode persisted job {job_id}"))?,
                )),
                None => Ok(None),
            }
        })
    }

    fn save(&self, job: &Job) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO jobs (
                    id, status, title, prompt, lyrics, tags, seed, audio_path,
                    error_message, duration_ms, temperature, cfg_scale, top_k,
                    title_model, parent_job_id, ref_audio_id, style_influence,
                    ref_audio_start_sec, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                           ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    title = excluded.title,
                    prompt = excluded.prompt,
                    lyrics = excluded.lyrics,
                    tags = excluded.tags,
                    seed = excluded.seed,
                    audio_path = excluded.audio_path,
                    error_message = excluded.error_message,
                    duration_ms = excluded.duration_ms,
                    temperature = excluded.temperature,
                    cfg_scale = excluded.cfg_scale,
                    top_k = excluded.top_k,
                    title_model = excluded.title_model,
                    parent_job_id = excluded.parent_job_id,
                    ref_audio_id = excluded.ref_audio_id,
                    style_influence = excluded.style_influence,
                    ref_audio_start_sec = excluded.ref_audio_start_sec,
                    updated_at = excluded.updated_at",
                params![
                    job.id,
                    status_to_str(job.status),
                    job.title,
                    job.prompt,
                    job.lyrics,
                    job.tags,
                    job.seed,
                    job.audio_path,
                    job.error_message,
                    job.duration_ms,
                    job.temperature,
                    job.cfg_scale,
                    job.top_k,
                    job.title_model,
                    job.parent_job_id,
                    job.ref_audio_id,
                    job.style_influence,
                    job.ref_audio_start_sec,
                    job.created_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to upsert persisted job {}", job.id))?;
            Ok(())
        })
    }

    fn delete(&self, job_id: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let deleted = conn
                .execute("DELETE FROM jobs WHERE id = ?1", params![job_id])
                .with_context(|| format!("failed to delete persisted job {job_id}"))?;
            Ok(deleted > 0)
        })
    }

    fn list(&self) -> Result<Vec<Job>> {
        self.with_connection(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM jobs ORDER BY created_at DESC, id DESC")?;
            let rows = stmt.query_map([], Self::job_from_row)?;

            let mut jobs = Vec::new();
            for row in rows {
                match row {
                    Ok(job) => jobs.push(job),
                    Err(err) => {
                        warn!(error = %err, "Skipping invalid persisted job row");
                    }
                }
            }
            Ok(jobs)
        })
    }
}

/// In-memory store used when SQLite initialization fails and throughout the
/// scheduler test suite.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: DashMap<String, Job>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn find(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.get(job_id).map(|entry| entry.value().clone()))
    }

    fn save(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn delete(&self, job_id: &str) -> Result<bool> {
        Ok(self.jobs.remove(job_id).is_some())
    }

    fn list(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs)
    }
}

fn status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => STATUS_QUEUED,
        JobStatus::Processing => STATUS_PROCESSING,
        JobStatus::Completed => STATUS_COMPLETED,
        JobStatus::Failed => STATUS_FAILED,
    }
}

fn parse_status(value: &str) -> Option<JobStatus> {
    match value {
        STATUS_QUEUED => Some(JobStatus::Queued),
        STATUS_PROCESSING => Some(JobStatus::Processing),
        STATUS_COMPLETED => Some(JobStatus::Completed),
        STATUS_FAILED => Some(JobStatus::Failed),
        _ => None,
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
        .map(|ts| ts.with_timezone(&Utc))
}
