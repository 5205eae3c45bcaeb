//! Bounds the `pending_dir` queue of not-yet-uploaded files by disk usage
//! and file count, evicting the oldest files first.

use std::path::PathBuf;
use std::time::SystemTime;

use crate::uploader::sidecar;

/// Point-in-time statistics about the pending queue.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferStats {
    pub pending_count: usize,
    pub disk_usage_bytes: u64,
    pub disk_limit_bytes: u64,
    pub queue_limit: usize,
    pub oldest_file: Option<String>,
    pub newest_file: Option<String>,
}

/// Manages the on-disk pending-upload queue, enforcing `max_disk_bytes` and
/// `max_queue_size` by evicting the oldest files (by mtime) first.
pub struct OfflineBuffer {
    pending_dir: PathBuf,
    max_disk_bytes: u64,
    max_queue_size: usize,
}

impl OfflineBuffer {
    /// Construct a buffer over `pending_dir`, creating it if missing.
    pub fn new(pending_dir: PathBuf, max_disk_gb: f64, max_queue_size: usize) -> std::io::Result<Self> {
        std::fs::create_dir_all(&pending_dir)?;
        let max_disk_bytes = (max_disk_gb * 1024.0 * 1024.0 * 1024.0) as u64;
        Ok(Self { pending_dir, max_disk_bytes, max_queue_size })
    }

    /// List pending `.parquet` files sorted oldest-first by modification time.
    pub fn get_pending_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.pending_dir) else {
            return Vec::new();
        };

        let mut files: Vec<(PathBuf, SystemTime)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
            .filter_map(|p| std::fs::metadata(&p).ok().and_then(|m| m.modified().ok()).map(|mtime| (p, mtime)))
            .collect();

        files.sort_by_key(|(_, mtime)| *mtime);
        files.into_iter().map(|(p, _)| p).collect()
    }

    /// Sum the size of all pending files.
    pub fn get_disk_usage(&self) -> u64 {
        self.get_pending_files()
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }

    fn over_disk_limit(&self) -> bool {
        let usage = self.get_disk_usage();
        if usage > self.max_disk_bytes {
            tracing::warn!(
                usage_gb = usage as f64 / (1024.0 * 1024.0 * 1024.0),
                limit_gb = self.max_disk_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
                "pending queue disk usage exceeds limit"
            );
            true
        } else {
            false
        }
    }

    /// Evict the `count` oldest pending files (and their sidecars). Returns
    /// the number actually evicted.
    pub fn evict_oldest(&self, count: usize) -> usize {
        let pending_files = self.get_pending_files();
        let mut evicted = 0;

        for file_path in pending_files.into_iter().take(count) {
            let size_mb = std::fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0) as f64 / (1024.0 * 1024.0);
            match std::fs::remove_file(&file_path) {
                Ok(()) => {
                    sidecar::remove(&file_path);
                    tracing::warn!(
                        file = %file_path.file_name().and_then(|n| n.to_str()).unwrap_or_default(),
                        size_mb,
                        "evicted old pending file"
                    );
                    evicted += 1;
                }
                Err(e) => {
                    tracing::error!(path = %file_path.display(), error = %e, "failed to evict pending file");
                }
            }
        }

        evicted
    }

    /// Evict files until both the queue-size and disk-usage limits are
    /// satisfied. Queue size is enforced first (overflow evicted in one
    /// pass), then disk usage (evicted in max(1, 10%) batches).
    pub fn enforce_limits(&self) {
        let pending_files = self.get_pending_files();
        if pending_files.len() > self.max_queue_size {
            let overflow = pending_files.len() - self.max_queue_size;
            tracing::warn!(
                pending_count = pending_files.len(),
                queue_limit = self.max_queue_size,
                overflow,
                "pending queue exceeds size limit, evicting oldest files"
            );
            self.evict_oldest(overflow);
        }

        while self.over_disk_limit() {
            let pending_files = self.get_pending_files();
            if pending_files.is_empty() {
                tracing::error!("disk limit exceeded but no pending files left to evict");
                break;
            }

            let evict_count = (pending_files.len() / 10).max(1);
            let evicted = self.evict_oldest(evict_count);
            if evicted == 0 {
                tracing::error!("failed to evict any pending files despite exceeding disk limit");
                break;
            }
        }
    }

    /// Move `file_path` into the pending queue and enforce limits.
    pub fn add_to_pending(&self, file_path: &std::path::Path) -> bool {
        if !file_path.exists() {
            tracing::error!(path = %file_path.display(), "file to add to pending does not exist");
            return false;
        }

        let dest = self.pending_dir.join(file_path.file_name().unwrap_or_default());
        match std::fs::rename(file_path, &dest) {
            Ok(()) => {
                tracing::info!(path = %dest.display(), "added to pending queue");
                self.enforce_limits();
                true
            }
            Err(e) => {
                tracing::error!(path = %file_path.display(), error = %e, "failed to add file to pending queue");
                false
            }
        }
    }

    /// Point-in-time statistics about the pending queue.
    pub fn get_stats(&self) -> BufferStats {
        let pending_files = self.get_pending_files();
        let disk_usage_bytes = pending_files.iter().filter_map(|p| std::fs::metadata(p).ok()).map(|m| m.len()).sum();

        let file_name = |p: &PathBuf| p.file_name().and_then(|n| n.to_str()).map(str::to_string);

        BufferStats {
            pending_count: pending_files.len(),
            disk_usage_bytes,
            disk_limit_bytes: self.max_disk_bytes,
            queue_limit: self.max_queue_size,
            oldest_file: pending_files.first().and_then(file_name),
            newest_file: pending_files.last().and_then(file_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_pending_file(dir: &std::path::Path, name: &str, size: usize) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; size]).unwrap();
        path
    }

    #[test]
    fn get_pending_files_sorts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = OfflineBuffer::new(dir.path().to_path_buf(), 10.0, 100).unwrap();

        write_pending_file(dir.path(), "a.parquet", 10);
        std::thread::sleep(Duration::from_millis(10));
        write_pending_file(dir.path(), "b.parquet", 10);

        let files = buffer.get_pending_files();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.parquet"));
        assert!(files[1].ends_with("b.parquet"));
    }

    #[test]
    fn enforce_limits_evicts_overflow_when_over_queue_size() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = OfflineBuffer::new(dir.path().to_path_buf(), 10.0, 2).unwrap();

        for i in 0..5 {
            write_pending_file(dir.path(), &format!("f{i}.parquet"), 10);
            std::thread::sleep(Duration::from_millis(5));
        }

        buffer.enforce_limits();
        assert_eq!(buffer.get_pending_files().len(), 2);
    }

    #[test]
    fn enforce_limits_evicts_when_over_disk_cap() {
        let dir = tempfile::tempdir().unwrap();
        // 100 bytes cap expressed in GB.
        let tiny_gb = 100.0 / (1024.0 * 1024.0 * 1024.0);
        let buffer = OfflineBuffer::new(dir.path().to_path_buf(), tiny_gb, 1000).unwrap();

        for i in 0..20 {
            write_pending_file(dir.path(), &format!("f{i}.parquet"), 50);
            std::thread::sleep(Duration::from_millis(2));
        }

        buffer.enforce_limits();
        assert!(buffer.get_disk_usage() <= 100 || buffer.get_pending_files().len() < 20);
    }

    #[test]
    fn add_to_pending_moves_file_and_enforces_limits() {
        let dir = tempfile::tempdir().unwrap();
        let source_dir = tempfile::tempdir().unwrap();
        let buffer = OfflineBuffer::new(dir.path().to_path_buf(), 10.0, 100).unwrap();

        let source = write_pending_file(source_dir.path(), "new.parquet", 10);
        assert!(buffer.add_to_pending(&source));
        assert!(!source.exists());
        assert!(dir.path().join("new.parquet").exists());
    }

    #[test]
    fn add_to_pending_fails_gracefully_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = OfflineBuffer::new(dir.path().to_path_buf(), 10.0, 100).unwrap();
        assert!(!buffer.add_to_pending(std::path::Path::new("/nonexistent/file.parquet")));
    }

    #[test]
    fn evict_oldest_removes_sidecar_too() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = OfflineBuffer::new(dir.path().to_path_buf(), 10.0, 100).unwrap();
        let file = write_pending_file(dir.path(), "a.parquet", 10);
        sidecar::write(&file, "raw/a.parquet").unwrap();

        assert_eq!(buffer.evict_oldest(1), 1);
        assert!(!file.exists());
        assert!(sidecar::read(&file).unwrap().is_none());
    }

    #[test]
    fn get_stats_reports_oldest_and_newest() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = OfflineBuffer::new(dir.path().to_path_buf(), 10.0, 100).unwrap();
        write_pending_file(dir.path(), "a.parquet", 10);
        std::thread::sleep(Duration::from_millis(5));
        write_pending_file(dir.path(), "b.parquet", 20);

        let stats = buffer.get_stats();
        assert_eq!(stats.pending_count, 2);
        assert_eq!(stats.disk_usage_bytes, 30);
        assert_eq!(stats.oldest_file.as_deref(), Some("a.parquet"));
        assert_eq!(stats.newest_file.as_deref(), Some("b.parquet"));
    }
}
