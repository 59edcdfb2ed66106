use std::io;
use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use tokio::fs;

use crate::error::JobError;
use crate::job::JobSpec;

/// The per-job temporary files: the staged output and the progress feed
#[derive(Debug, Clone)]
pub struct TempArtifacts {
    output: PathBuf,
    progress: PathBuf,
}

impl TempArtifacts {
    pub fn new(spec: &JobSpec) -> Self {
        TempArtifacts {
            output: spec.temp_output.clone(),
            progress: spec.progress_path.clone(),
        }
    }

    #[cfg(test)]
    pub fn output(&self) -> &Path {
        &self.output
    }

    #[cfg(test)]
    pub fn progress(&self) -> &Path {
        &self.progress
    }

    /// Create an empty progress feed so the tracker can open it before the engine writes
    pub async fn prepare(&self) -> Result<(), JobError> {
        fs::write(&self.progress, b"")
            .await
            .map_err(|e| JobError::io(format!("failed to create progress file {}", self.progress.display()), e))
    }

    /// Atomically publish the staged output at `dest`.
    ///
    /// On error the staged output is left in place for [`TempArtifacts::discard`].
    pub async fn commit(&self, dest: &Path) -> Result<(), JobError> {
        let commit_err = |source: io::Error| JobError::Commit {
            from: self.output.clone(),
            to: dest.to_path_buf(),
            source,
        };

        let meta = fs::metadata(&self.output).await.map_err(commit_err)?;
        if meta.len() == 0 {
            return Err(commit_err(io::Error::new(
                io::ErrorKind::InvalidData,
                "engine produced an empty output file",
            )));
        }

        fs::rename(&self.output, dest).await.map_err(commit_err)?;
        info!(
            "Published {} ({})",
            dest.display(),
            humansize::format_size(meta.len(), humansize::DECIMAL)
        );
        Ok(())
    }

    /// Remove the staged output and the progress feed, whatever state they are in
    pub async fn discard(&self) {
        remove_if_present(&self.output).await;
        self.discard_progress().await;
    }

    pub async fn discard_progress(&self) {
        remove_if_present(&self.progress).await;
    }

    /// Synchronous best-effort removal for drop paths that cannot await
    pub(crate) fn discard_blocking(&self) {
        let _ = std::fs::remove_file(&self.output);
        let _ = std::fs::remove_file(&self.progress);
    }
}

async fn remove_if_present(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("Deleted temp file: {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete temp file {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifacts(dir: &tempfile::TempDir) -> TempArtifacts {
        TempArtifacts {
            output: dir.path().join("temp_1.mkv"),
            progress: dir.path().join("progress_1.txt"),
        }
    }

    #[tokio::test]
    async fn test_commit_moves_output() {
        let dir = tempfile::tempdir().unwrap();
        let a = artifacts(&dir);
        a.prepare().await.unwrap();
        std::fs::write(a.output(), b"encoded").unwrap();
        let dest = dir.path().join("out.mkv");
        std::fs::write(&dest, b"stale").unwrap();

        a.commit(&dest).await.unwrap();
        a.discard().await;

        assert_eq!(std::fs::read(&dest).unwrap(), b"encoded");
        assert!(!a.output().exists());
        assert!(!a.progress().exists());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_nothing_after_discard() {
        let dir = tempfile::tempdir().unwrap();
        let a = artifacts(&dir);
        a.prepare().await.unwrap();
        std::fs::write(a.output(), b"encoded").unwrap();
        let dest = dir.path().join("missing-dir").join("out.mkv");

        let err = a.commit(&dest).await.unwrap_err();
        assert!(matches!(err, JobError::Commit { .. }));
        assert!(a.output().exists());

        a.discard().await;
        assert!(!a.output().exists());
        assert!(!a.progress().exists());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_empty_or_missing_output_is_not_published() {
        let dir = tempfile::tempdir().unwrap();
        let a = artifacts(&dir);
        let dest = dir.path().join("out.mkv");

        assert!(matches!(a.commit(&dest).await, Err(JobError::Commit { .. })));

        std::fs::write(a.output(), b"").unwrap();
        assert!(matches!(a.commit(&dest).await, Err(JobError::Commit { .. })));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_discard_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let a = artifacts(&dir);
        a.discard().await;
        a.discard().await;
    }
}
