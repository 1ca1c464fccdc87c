use anyhow::{bail, Result};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Registry mapping actively-running job ids to their cancellation tokens.
///
/// A token exists exactly for the duration of a job's generation call. The
/// generation engine polls `is_cancelled()` at its own checkpoints; signalling
/// requests a stop, it does not preempt.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    active: DashMap<String, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh token for `job_id`.
    ///
    /// A duplicate registration is a scheduler bug, not a user-facing
    /// condition, so it is reported as an error rather than replacing the
    /// existing token.
    pub fn register(&self, job_id: &str) -> Result<CancellationToken> {
        if self.active.contains_key(job_id) {
            bail!("job {job_id} already has an active cancellation token");
        }
        let token = CancellationToken::new();
        self.active.insert(job_id.to_string(), token.clone());
        Ok(token)
    }

    /// Signal the token for `job_id`. Returns `false` when the job is not
    /// actively running — the caller should then try the admission queue.
    pub fn signal(&self, job_id: &str) -> bool {
        match self.active.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove and discard the token for `job_id`. Idempotent.
    pub fn unregister(&self, job_id: &str) {
        self.active.remove(job_id);
    }

    /// Signal every currently-registered token. Used on process shutdown.
    pub fn signal_all(&self) {
        for entry in self.active.iter() {
            entry.value().cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
