//! Sidecar metadata written alongside files moved into `pending_dir`.
//!
//! The original uploader reconstructed an S3 key from a pending file's
//! *name* alone (`{prefix}/{filename}`), silently losing the
//! `vehicle_id=/year=/month=/day=` partition segments stripped off during
//! the move. A small `<filename>.meta.json` sidecar carries the original S3
//! key forward so a retried upload lands in the same partition it was meant
//! for.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::UploadError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMetadata {
    /// Full S3 key the file should be uploaded under, partitions included.
    pub s3_key: String,
}

fn sidecar_path(file_path: &Path) -> PathBuf {
    let mut name = file_path.as_os_str().to_owned();
    name.push(".meta.json");
    PathBuf::from(name)
}

/// Write the sidecar metadata for `file_path`.
pub fn write(file_path: &Path, s3_key: &str) -> Result<(), UploadError> {
    let meta = PendingMetadata { s3_key: s3_key.to_string() };
    let json = serde_json::to_string(&meta).map_err(|source| UploadError::Sidecar {
        path: file_path.to_path_buf(),
        source,
    })?;
    std::fs::write(sidecar_path(file_path), json).map_err(|e| UploadError::StateTransition {
        path: file_path.to_path_buf(),
        dest_dir: sidecar_path(file_path),
        source: e,
    })?;
    Ok(())
}

/// Read the sidecar metadata for `file_path`, if present.
pub fn read(file_path: &Path) -> Result<Option<PendingMetadata>, UploadError> {
    let path = sidecar_path(file_path);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| UploadError::StateTransition { path: file_path.to_path_buf(), dest_dir: path.clone(), source: e })?;
    let meta: PendingMetadata =
        serde_json::from_str(&contents).map_err(|source| UploadError::Sidecar { path: file_path.to_path_buf(), source })?;
    Ok(Some(meta))
}

/// Remove the sidecar file for `file_path`, ignoring a missing file.
pub fn remove(file_path: &Path) {
    let path = sidecar_path(file_path);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove sidecar metadata");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("20260101T000000Z_raw.parquet");
        std::fs::write(&file_path, b"data").unwrap();

        write(&file_path, "raw/vehicle_id=v1/year=2026/month=01/day=01/20260101T000000Z_raw.parquet").unwrap();
        let meta = read(&file_path).unwrap().expect("sidecar should exist");
        assert_eq!(meta.s3_key, "raw/vehicle_id=v1/year=2026/month=01/day=01/20260101T000000Z_raw.parquet");
    }

    #[test]
    fn missing_sidecar_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("nope.parquet");
        assert!(read(&file_path).unwrap().is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.parquet");
        std::fs::write(&file_path, b"x").unwrap();
        write(&file_path, "raw/a.parquet").unwrap();
        remove(&file_path);
        remove(&file_path);
        assert!(read(&file_path).unwrap().is_none());
    }
}
