use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

const CONTINUATION_EXTENSION: &str = "bin";

/// File-backed store of opaque engine continuation state, keyed by job id.
///
/// Continuation state lets a later job extend a prior generation. Loading is
/// best-effort from the scheduler's perspective: a missing artifact is
/// `Ok(None)`, never an error.
#[derive(Debug, Clone)]
pub struct ContinuationStore {
    dir: PathBuf,
}

impl ContinuationStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn save(&self, job_id: &str, state: &[u8]) -> Result<()> {
        let path = self.artifact_path(job_id)?;
        fs::create_dir_all(&self.dir).with_context(|| {
            format!(
                "failed to create continuation directory: {}",
                self.dir.display()
            )
        })?;
        fs::write(&path, state)
            .with_context(|| format!("failed to write continuation state: {}", path.display()))?;
        Ok(())
    }

    pub fn load(&self, job_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.artifact_path(job_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read continuation state: {}", path.display()))?;
        Ok(Some(bytes))
    }

    pub fn remove(&self, job_id: &str) -> Result<()> {
        let path = self.artifact_path(job_id)?;
        if path.exists() {
            fs::remove_file(&path).with_context(|| {
                format!("failed to remove continuation state: {}", path.display())
            })?;
        }
        Ok(())
    }

    fn artifact_path(&self, job_id: &str) -> Result<PathBuf> {
        sanitize_job_id(job_id)?;
        Ok(self
            .dir
            .join(format!("{job_id}.{CONTINUATION_EXTENSION}")))
    }
}

/// Job ids come from our own uuid generation, but they also arrive over the
/// API as parent references, so they must never escape the store directory.
fn sanitize_job_id(job_id: &str) -> Result<()> {
    if job_id.is_empty() {
        bail!("job id must not be empty");
    }
    if job_id.contains('/') || job_id.contains('\\') || job_id.contains("..") {
        bail!("job id must not contain path separators or '..'");
    }
    Ok(())
}

pub fn sanitize_artifact_id(id: &str) -> Result<()> {
    sanitize_job_id(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ContinuationStore) {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let store = ContinuationStore::new(temp.path().join("continuations"));
        (temp, store)
    }

    #[test]
    fn save_then_load_round_trips() {
        let (_temp, store) = store();
        store.save("job-1", b"opaque state").expect("save state");
        let loaded = store.load("job-1").expect("load state");
        assert_eq!(loaded.as_deref(), Some(b"opaque state".as_slice()));
    }

    #[test]
    fn missing_artifact_is_none_not_error() {
        let (_temp, store) = store();
        assert!(store.load("never-saved").expect("load").is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let (_temp, store) = store();
        store.save("job-1", b"state").expect("save state");
        store.remove("job-1").expect("first remove");
        store.remove("job-1").expect("second remove");
        assert!(store.load("job-1").expect("load").is_none());
    }

    #[test]
    fn path_traversal_ids_are_rejected() {
        let (_temp, store) = store();
        assert!(store.load("../escape").is_err());
        assert!(store.save("a/b", b"x").is_err());
        assert!(store.load("").is_err());
    }
}
