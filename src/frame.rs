//! The CAN frame value type and the reader's live statistics.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A single CAN frame, timestamped at arrival.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Wall-clock arrival time (UTC). Hardware timestamps are preferred when
    /// the backend supplies them; the reader falls back to the local clock.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// 29-bit (or 11-bit) arbitration ID.
    pub arb_id: u32,
    /// Data-length code, 0..=8 for classic CAN or 0..=64 for FD.
    pub dlc: u8,
    /// Raw payload, exactly `dlc` bytes.
    pub data: Vec<u8>,
    /// Whether this frame was received on an FD-capable bus.
    pub fd: bool,
    /// Interface/channel this frame arrived on.
    pub channel: String,
}

/// Monotonic counters plus a rolling frames-per-second window.
///
/// Written only by the reader task; observed without locking by the health
/// monitor, matching the single-writer / lock-free-read discipline.
#[derive(Debug, Default)]
pub struct ReaderStats {
    frames: AtomicU64,
    errors: AtomicU64,
    bus_off: AtomicU64,
    recent_arrivals: Mutex<VecDeque<Instant>>,
}

/// A point-in-time snapshot of [`ReaderStats`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatsSnapshot {
    /// Cumulative valid frame count.
    pub frames: u64,
    /// Cumulative error-frame count.
    pub errors: u64,
    /// Cumulative bus-off event count.
    pub bus_off: u64,
    /// Rounded-to-0.1 frames-per-second over the rolling window.
    pub frames_per_sec: f64,
}

impl ReaderStats {
    /// Width of the rolling arrival-time window used for the FPS calculation.
    pub const DEFAULT_FPS_WINDOW: Duration = Duration::from_secs(10);

    /// Record a single valid frame arrival.
    pub fn record_frame(&self, window: Duration) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut recent = self.recent_arrivals.lock().expect("reader stats lock poisoned");
        recent.push_back(now);
        while let Some(&front) = recent.front() {
            if now.duration_since(front) > window {
                recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record an error frame (counted, never yielded downstream).
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bus-off transition.
    pub fn record_bus_off(&self) {
        self.bus_off.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent snapshot of all counters.
    pub fn snapshot(&self, window: Duration) -> StatsSnapshot {
        let recent_count = {
            let mut recent = self.recent_arrivals.lock().expect("reader stats lock poisoned");
            let now = Instant::now();
            while let Some(&front) = recent.front() {
                if now.duration_since(front) > window {
                    recent.pop_front();
                } else {
                    break;
                }
            }
            recent.len()
        };
        let fps = (recent_count as f64 / window.as_secs_f64() * 10.0).round() / 10.0;

        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bus_off: self.bus_off.load(Ordering::Relaxed),
            frames_per_sec: fps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_starts_at_zero() {
        let stats = ReaderStats::default();
        let snap = stats.snapshot(ReaderStats::DEFAULT_FPS_WINDOW);
        assert_eq!(snap.frames, 0);
        assert_eq!(snap.errors, 0);
        assert_eq!(snap.bus_off, 0);
        assert_eq!(snap.frames_per_sec, 0.0);
    }

    #[test]
    fn record_frame_increments_cumulative_and_window_count() {
        let stats = ReaderStats::default();
        for _ in 0..5 {
            stats.record_frame(ReaderStats::DEFAULT_FPS_WINDOW);
        }
        let snap = stats.snapshot(ReaderStats::DEFAULT_FPS_WINDOW);
        assert_eq!(snap.frames, 5);
        assert_eq!(snap.frames_per_sec, 0.5);
    }

    #[test]
    fn record_error_and_bus_off_do_not_affect_frame_count() {
        let stats = ReaderStats::default();
        stats.record_error();
        stats.record_error();
        stats.record_bus_off();
        let snap = stats.snapshot(ReaderStats::DEFAULT_FPS_WINDOW);
        assert_eq!(snap.frames, 0);
        assert_eq!(snap.errors, 2);
        assert_eq!(snap.bus_off, 1);
    }

    #[test]
    fn old_arrivals_fall_out_of_the_rolling_window() {
        let stats = ReaderStats::default();
        let tiny_window = Duration::from_millis(20);
        stats.record_frame(tiny_window);
        std::thread::sleep(Duration::from_millis(40));
        let snap = stats.snapshot(tiny_window);
        assert_eq!(snap.frames, 1, "cumulative count is never decremented");
        assert_eq!(snap.frames_per_sec, 0.0, "stale arrival dropped from window");
    }
}
