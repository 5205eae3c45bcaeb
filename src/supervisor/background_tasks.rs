//! The two long-running background tasks: the pending-upload retry worker
//! and the hardware health monitor.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::Disks;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::frame::ReaderStats;
use crate::offline_buffer::OfflineBuffer;
use crate::uploader::Uploader;

/// Wakes every `interval` (or immediately on cancellation) and retries every
/// file in the pending queue, logging the `(ok, fail)` tuple when non-zero.
pub fn spawn_retry_worker(
    uploader: Arc<Uploader>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_secs = interval.as_secs(), "started pending retry worker");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::debug!("running pending upload retry");
                    let (succeeded, failed) = uploader.retry_pending().await;
                    if succeeded > 0 || failed > 0 {
                        tracing::info!(succeeded, failed, "pending retry complete");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!("pending retry worker stopped");
    })
}

/// Snapshot logged once per heartbeat interval by the health monitor.
pub struct HealthSnapshot {
    pub uptime_minutes: f64,
    pub frames: u64,
    pub frames_per_sec: f64,
    pub errors: u64,
    pub bus_off: u64,
    pub pending_count: usize,
    pub disk_used_gb: f64,
    pub disk_free_gb: f64,
    pub board_temp_celsius: Option<f64>,
}

/// Runs only for the real-hardware reader (skipped for the simulator). Every
/// `interval`, emits one combined health line.
pub fn spawn_health_monitor(
    stats: Arc<ReaderStats>,
    buffer: Arc<OfflineBuffer>,
    data_dir: std::path::PathBuf,
    interval: Duration,
    fps_window: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_secs = interval.as_secs(), "started health monitor");
        let start = std::time::Instant::now();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = build_snapshot(&stats, &buffer, &data_dir, start, fps_window);
                    log_snapshot(&snapshot);
                }
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!("health monitor stopped");
    })
}

fn build_snapshot(
    stats: &ReaderStats,
    buffer: &OfflineBuffer,
    data_dir: &std::path::Path,
    start: std::time::Instant,
    fps_window: Duration,
) -> HealthSnapshot {
    let reader_snapshot = stats.snapshot(fps_window);
    let buffer_stats = buffer.get_stats();
    let (disk_used_gb, disk_free_gb) = disk_usage_for(data_dir);

    HealthSnapshot {
        uptime_minutes: start.elapsed().as_secs_f64() / 60.0,
        frames: reader_snapshot.frames,
        frames_per_sec: reader_snapshot.frames_per_sec,
        errors: reader_snapshot.errors,
        bus_off: reader_snapshot.bus_off,
        pending_count: buffer_stats.pending_count,
        disk_used_gb,
        disk_free_gb,
        board_temp_celsius: read_board_temp(),
    }
}

fn log_snapshot(snapshot: &HealthSnapshot) {
    tracing::info!(
        uptime_minutes = format!("{:.1}", snapshot.uptime_minutes),
        frames = snapshot.frames,
        frames_per_sec = snapshot.frames_per_sec,
        errors = snapshot.errors,
        bus_off = snapshot.bus_off,
        pending_count = snapshot.pending_count,
        disk_used_gb = format!("{:.2}", snapshot.disk_used_gb),
        disk_free_gb = format!("{:.2}", snapshot.disk_free_gb),
        board_temp_celsius = snapshot.board_temp_celsius,
        "health"
    );
}

/// Used/free gigabytes for the filesystem backing `path`, via `sysinfo`'s
/// disk listing. Falls back to `(0.0, 0.0)` if no matching mount is found.
fn disk_usage_for(path: &std::path::Path) -> (f64, f64) {
    let disks = Disks::new_with_refreshed_list();
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

    let mut best_match: Option<(&std::path::Path, u64, u64)> = None;
    for disk in disks.list() {
        let mount_point = disk.mount_point();
        if canonical.starts_with(mount_point) {
            let is_better = best_match.is_none_or(|(current, _, _)| mount_point.as_os_str().len() > current.as_os_str().len());
            if is_better {
                best_match = Some((mount_point, disk.total_space(), disk.available_space()));
            }
        }
    }

    match best_match {
        Some((_, total, available)) => {
            let used = total.saturating_sub(available);
            (to_gb(used), to_gb(available))
        }
        None => (0.0, 0.0),
    }
}

fn to_gb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

/// Reads the Raspberry Pi thermal zone file if present; any other platform
/// (or a missing sysfs entry) silently yields `None`.
fn read_board_temp() -> Option<f64> {
    let raw = std::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp").ok()?;
    let millidegrees: f64 = raw.trim().parse().ok()?;
    Some(millidegrees / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_gb_converts_bytes() {
        assert_eq!(to_gb(1024 * 1024 * 1024), 1.0);
    }

    #[test]
    fn read_board_temp_is_none_on_non_pi_hosts() {
        // CI/dev hosts won't have this sysfs entry; the function must not panic.
        let _ = read_board_temp();
    }
}
