use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// An uploaded document handed over by the upload layer.
///
/// The file at `path` belongs to this value. Once it has been processed it
/// is deleted, whatever the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUpload {
    pub path: PathBuf,
    pub original_file_name: String,
    pub file_size_bytes: u64,
}

impl DocumentUpload {
    pub fn new(
        path: impl Into<PathBuf>,
        original_file_name: impl Into<String>,
        file_size_bytes: u64,
    ) -> Self {
        Self {
            path: path.into(),
            original_file_name: original_file_name.into(),
            file_size_bytes,
        }
    }
}

/// Deletes a file when it goes out of scope.
///
/// Prefer [`ScopedDocument::cleanup`] on the normal path. `Drop` covers early
/// returns, cancelled futures and panics.
#[derive(Debug)]
pub struct ScopedDocument {
    path: PathBuf,
    armed: bool,
}

impl ScopedDocument {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file and hand its path back to the caller.
    pub fn into_path(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }

    pub async fn cleanup(mut self) {
        self.armed = false;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Cleaned up uploaded document"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Could not clean up file"),
        }
    }
}

impl Drop for ScopedDocument {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Cleaned up uploaded document"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleanup_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        ScopedDocument::new(&path).cleanup().await;

        assert!(!path.exists());
    }

    #[test]
    fn drop_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        {
            let _guard = ScopedDocument::new(&path);
        }

        assert!(!path.exists());
    }

    #[test]
    fn into_path_keeps_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        let kept = ScopedDocument::new(&path).into_path();

        assert_eq!(kept, path);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        ScopedDocument::new(dir.path().join("gone.pdf")).cleanup().await;
    }
}
