use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::reference::ReferenceConditioning;

pub mod synth;

pub use synth::SynthEngine;

/// Resolved parameter bundle handed to the generation engine.
///
/// Everything here is fully resolved by the scheduler: the seed is concrete
/// (never "auto"), the reference conditioning carries a clamped window, and
/// the continuation state was already loaded from disk.
#[derive(Debug, Clone)]
pub struct EngineParams {
    pub job_id: String,
    pub lyrics: Option<String>,
    pub tags: String,
    pub duration_ms: u32,
    pub temperature: f32,
    pub cfg_scale: f32,
    pub top_k: u32,
    pub seed: u32,
    pub output_path: PathBuf,
    pub reference: Option<ReferenceConditioning>,
    pub continuation: Option<Vec<u8>>,
}

/// Artifact location plus optional continuation state for future extension
/// requests.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub audio_path: PathBuf,
    pub continuation: Option<Vec<u8>>,
}

/// Distinguished abort condition raised when the cancellation token was set.
///
/// Cancellation is cooperative: the engine observes the token at its own
/// checkpoints, so some work may still happen after the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationAborted;

impl fmt::Display for GenerationAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "generation aborted by cancellation request")
    }
}

impl std::error::Error for GenerationAborted {}

/// Progress callback: percentage in 0–100 plus a short message.
pub type ProgressFn<'a> = dyn Fn(u8, &str) + Send + Sync + 'a;

/// The long-running, accelerator-bound generation callable.
///
/// `generate` blocks the calling thread for the whole run; the scheduler
/// always invokes it from the worker-thread pool while holding the pipeline
/// gate, so implementations may assume exclusive ownership of resident model
/// state for the duration of the call.
pub trait GenerationEngine: Send + Sync {
    fn generate(
        &self,
        params: &EngineParams,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<EngineOutput>;

    /// Drop per-run caches after a generation. Failures are logged by the
    /// scheduler, never escalated.
    fn release_cached_state(&self) -> Result<()> {
        Ok(())
    }

    /// Ask the host runtime to reclaim accelerator memory.
    fn reclaim_device_memory(&self) -> Result<()> {
        Ok(())
    }
}
