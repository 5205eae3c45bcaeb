//! Upload of batched Parquet files to a remote object store, with retry,
//! archive/pending state transitions, and pending-retry sidecar metadata.

pub mod backend;
pub mod sidecar;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::RetryConfig;
use crate::error::UploadError;
use crate::retry::retry_with_backoff;
use backend::UploadBackend;

/// Uploads local Hive-partitioned files to the remote store, moving each one
/// to `archive_dir` on success or `pending_dir` on exhausted retry.
pub struct Uploader {
    backend: Arc<dyn UploadBackend>,
    prefix: String,
    archive_dir: PathBuf,
    pending_dir: PathBuf,
    retry_config: RetryConfig,
}

impl Uploader {
    /// Construct an uploader. `archive_dir`/`pending_dir` are created if
    /// missing.
    pub fn new(
        backend: Arc<dyn UploadBackend>,
        prefix: String,
        archive_dir: PathBuf,
        pending_dir: PathBuf,
        retry_config: RetryConfig,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&archive_dir)?;
        std::fs::create_dir_all(&pending_dir)?;
        Ok(Self { backend, prefix, archive_dir, pending_dir, retry_config })
    }

    /// Derive the S3 key from a Hive-partitioned local path: every
    /// `name=value` path segment is kept, in order, under `prefix`.
    pub fn derive_key(&self, local_path: &Path) -> String {
        let partition_segments: Vec<&str> = local_path
            .iter()
            .filter_map(|c| c.to_str())
            .filter(|segment| segment.contains('='))
            .collect();
        let filename = local_path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

        let mut parts = vec![self.prefix.as_str()];
        parts.extend(partition_segments);
        parts.push(filename);
        parts.join("/")
    }

    /// Upload one freshly-batched file, moving it to archive on success or
    /// pending (with a sidecar recording its intended key) on failure.
    pub async fn upload(&self, local_path: &Path) -> Result<bool, UploadError> {
        if !local_path.exists() {
            tracing::error!(path = %local_path.display(), "file to upload does not exist");
            return Ok(false);
        }

        let key = self.derive_key(local_path);
        tracing::info!(path = %local_path.display(), key, "uploading");

        match self.upload_with_retry(local_path, &key).await {
            Ok(()) => {
                self.move_to_archive(local_path)?;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(path = %local_path.display(), error = %e, "upload failed, moving to pending");
                self.move_to_pending(local_path, &key)?;
                Ok(false)
            }
        }
    }

    /// Retry every file currently in `pending_dir`. Returns
    /// `(succeeded, failed)`.
    pub async fn retry_pending(&self) -> (usize, usize) {
        let pending_files = self.list_pending_files();
        if pending_files.is_empty() {
            return (0, 0);
        }

        tracing::info!(count = pending_files.len(), "retrying pending uploads");
        let mut succeeded = 0;
        let mut failed = 0;

        for pending_path in pending_files {
            let key = match sidecar::read(&pending_path) {
                Ok(Some(meta)) => meta.s3_key,
                Ok(None) => {
                    tracing::warn!(
                        path = %pending_path.display(),
                        "no sidecar metadata for pending file, re-deriving key from filename only"
                    );
                    self.derive_key(&pending_path)
                }
                Err(e) => {
                    tracing::error!(path = %pending_path.display(), error = %e, "failed to read sidecar metadata");
                    failed += 1;
                    continue;
                }
            };

            match self.upload_with_retry(&pending_path, &key).await {
                Ok(()) => {
                    if let Err(e) = self.move_to_archive(&pending_path) {
                        tracing::error!(path = %pending_path.display(), error = %e, "failed to archive retried upload");
                        failed += 1;
                        continue;
                    }
                    sidecar::remove(&pending_path);
                    succeeded += 1;
                }
                Err(_) => failed += 1,
            }
        }

        tracing::info!(succeeded, failed, "pending retry complete");
        (succeeded, failed)
    }

    /// Pending files, oldest first by modification time (matches
    /// `OfflineBuffer::get_pending_files`'s ordering).
    fn list_pending_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.pending_dir) else {
            return Vec::new();
        };

        let mut files: Vec<(PathBuf, std::time::SystemTime)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
            .filter_map(|p| std::fs::metadata(&p).ok().and_then(|m| m.modified().ok()).map(|mtime| (p, mtime)))
            .collect();

        files.sort_by_key(|(_, mtime)| *mtime);
        files.into_iter().map(|(p, _)| p).collect()
    }

    async fn upload_with_retry(&self, local_path: &Path, key: &str) -> Result<(), UploadError> {
        let backend = &self.backend;
        retry_with_backoff(&self.retry_config, || async { backend.put(local_path, key).await }).await
    }

    fn move_to_archive(&self, local_path: &Path) -> Result<(), UploadError> {
        let dest = self.archive_dir.join(local_path.file_name().unwrap_or_default());
        std::fs::rename(local_path, &dest).map_err(|source| UploadError::StateTransition {
            path: local_path.to_path_buf(),
            dest_dir: self.archive_dir.clone(),
            source,
        })?;
        tracing::info!(path = %dest.display(), "moved to archive");
        Ok(())
    }

    fn move_to_pending(&self, local_path: &Path, key: &str) -> Result<(), UploadError> {
        let dest = self.pending_dir.join(local_path.file_name().unwrap_or_default());
        if dest.exists() {
            tracing::warn!(path = %dest.display(), "pending destination already exists, leaving original in place");
            return Ok(());
        }
        std::fs::rename(local_path, &dest).map_err(|source| UploadError::StateTransition {
            path: local_path.to_path_buf(),
            dest_dir: self.pending_dir.clone(),
            source,
        })?;
        sidecar::write(&dest, key)?;
        tracing::info!(path = %dest.display(), "moved to pending");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::error::UploadError;
    use backend::fakes::FakeBackend;
    use std::time::Duration;

    fn fast_retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn write_hive_file(root: &Path, vehicle: &str) -> PathBuf {
        let dir = root
            .join(format!("vehicle_id={vehicle}"))
            .join("year=2026")
            .join("month=01")
            .join("day=15");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("20260115T120000Z_raw.parquet");
        std::fs::write(&path, b"parquet-bytes").unwrap();
        path
    }

    #[test]
    fn derive_key_keeps_hive_partition_segments_in_order() {
        let root = tempfile::tempdir().unwrap();
        let uploader = Uploader::new(
            Arc::new(FakeBackend::always_succeeds()),
            "raw".to_string(),
            root.path().join("archive"),
            root.path().join("pending"),
            fast_retry_config(),
        )
        .unwrap();

        let file = write_hive_file(root.path(), "veh-1");
        let key = uploader.derive_key(&file);
        assert_eq!(key, "raw/vehicle_id=veh-1/year=2026/month=01/day=15/20260115T120000Z_raw.parquet");
    }

    #[tokio::test]
    async fn successful_upload_moves_file_to_archive() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::always_succeeds());
        let uploader = Uploader::new(
            backend.clone(),
            "raw".to_string(),
            root.path().join("archive"),
            root.path().join("pending"),
            fast_retry_config(),
        )
        .unwrap();

        let file = write_hive_file(root.path(), "veh-1");
        let ok = uploader.upload(&file).await.unwrap();
        assert!(ok);
        assert!(!file.exists());
        assert!(root.path().join("archive").join("20260115T120000Z_raw.parquet").exists());
    }

    #[tokio::test]
    async fn exhausted_retries_move_file_to_pending_with_sidecar() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::fails_n_times(
            10,
            UploadError::Transient { code: "500".to_string(), message: "boom".to_string() },
        ));
        let uploader = Uploader::new(
            backend,
            "raw".to_string(),
            root.path().join("archive"),
            root.path().join("pending"),
            fast_retry_config(),
        )
        .unwrap();

        let file = write_hive_file(root.path(), "veh-1");
        let ok = uploader.upload(&file).await.unwrap();
        assert!(!ok);
        let pending_file = root.path().join("pending").join("20260115T120000Z_raw.parquet");
        assert!(pending_file.exists());
        let meta = sidecar::read(&pending_file).unwrap().unwrap();
        assert_eq!(meta.s3_key, "raw/vehicle_id=veh-1/year=2026/month=01/day=15/20260115T120000Z_raw.parquet");
    }

    #[tokio::test]
    async fn retry_pending_uses_sidecar_key_not_filename_reconstruction() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::always_succeeds());
        let uploader = Uploader::new(
            backend.clone(),
            "raw".to_string(),
            root.path().join("archive"),
            root.path().join("pending"),
            fast_retry_config(),
        )
        .unwrap();

        let pending_dir = root.path().join("pending");
        std::fs::create_dir_all(&pending_dir).unwrap();
        let pending_file = pending_dir.join("20260115T120000Z_raw.parquet");
        std::fs::write(&pending_file, b"data").unwrap();
        sidecar::write(&pending_file, "raw/vehicle_id=veh-9/year=2026/month=01/day=15/20260115T120000Z_raw.parquet")
            .unwrap();

        let (succeeded, failed) = uploader.retry_pending().await;
        assert_eq!((succeeded, failed), (1, 0));

        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls[0], "raw/vehicle_id=veh-9/year=2026/month=01/day=15/20260115T120000Z_raw.parquet");
    }

    #[tokio::test]
    async fn retry_pending_with_no_files_is_a_noop() {
        let root = tempfile::tempdir().unwrap();
        let uploader = Uploader::new(
            Arc::new(FakeBackend::always_succeeds()),
            "raw".to_string(),
            root.path().join("archive"),
            root.path().join("pending"),
            fast_retry_config(),
        )
        .unwrap();

        assert_eq!(uploader.retry_pending().await, (0, 0));
    }
}
