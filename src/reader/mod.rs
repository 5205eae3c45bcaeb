//! CAN frame acquisition: a real SocketCAN backend and a synthetic simulator
//! sharing one [`Frame`] channel-producer interface.

pub mod dbc;
pub mod real;
pub mod simulator;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CanConfig;
use crate::error::ReaderError;
use crate::frame::{Frame, ReaderStats};
use dbc::Database;
use real::RealCanReader;
use simulator::SimulatedCanReader;

/// Channel capacity between the reader task and the batcher. Bounded so a
/// stalled batcher applies backpressure instead of unbounded memory growth.
pub const FRAME_CHANNEL_CAPACITY: usize = 4096;

/// Spawns the configured reader (real hardware or simulator) as a background
/// task and returns the receiving half of its frame channel along with the
/// task's join handle.
pub struct ReaderHandle {
    /// Receives frames produced by the reader task.
    pub frames: mpsc::Receiver<Frame>,
    /// Join handle for the spawned reader task.
    pub task: JoinHandle<()>,
    /// Shared live statistics, readable by the health monitor.
    pub stats: Arc<ReaderStats>,
}

/// Start the real hardware reader against `can.interface`/`can.channel`.
pub fn spawn_real(
    config: &CanConfig,
    fps_window: Duration,
    cancel: CancellationToken,
) -> ReaderHandle {
    let stats = Arc::new(ReaderStats::default());
    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let reader = RealCanReader::new(config.clone(), stats.clone(), fps_window);
    let task = tokio::spawn(reader.run(tx, cancel));
    ReaderHandle { frames: rx, task, stats }
}

/// Start the simulated reader, loading the message-definition database from
/// `dbc_path` first.
pub fn spawn_simulated(
    dbc_path: &std::path::Path,
    frequency_hz: u32,
    duration: Option<Duration>,
    fps_window: Duration,
    cancel: CancellationToken,
) -> Result<ReaderHandle, ReaderError> {
    let database = Database::load(dbc_path)?;
    let stats = Arc::new(ReaderStats::default());
    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let reader = SimulatedCanReader::new(database, frequency_hz, duration, stats.clone(), fps_window);
    let task = tokio::spawn(reader.run(tx, cancel));
    Ok(ReaderHandle { frames: rx, task, stats })
}
