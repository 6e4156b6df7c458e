//! Local scratch-space helpers.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Per-job scratch directory. Only the owning job writes or deletes here.
pub fn job_work_dir(root: &Path, job_id: &str) -> PathBuf {
    root.join(job_id)
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_file_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub async fn remove_dir_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed scratch directory");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Size of a file, `None` when it does not exist.
pub async fn file_size(path: &Path) -> std::io::Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn removing_missing_paths_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("gone.bin");
        assert!(!remove_file_if_exists(&file).await.unwrap());
        assert_eq!(file_size(&file).await.unwrap(), None);

        tokio::fs::write(&file, b"abc").await.unwrap();
        assert_eq!(file_size(&file).await.unwrap(), Some(3));
        assert!(remove_file_if_exists(&file).await.unwrap());

        let sub = job_work_dir(dir.path(), "job-1");
        tokio::fs::create_dir_all(sub.join("nested")).await.unwrap();
        assert!(remove_dir_if_exists(&sub).await.unwrap());
        assert!(!remove_dir_if_exists(&sub).await.unwrap());
    }
}
