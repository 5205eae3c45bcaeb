//! Wires the reader, batcher, uploader, offline buffer, and background tasks
//! together and owns the main processing loop and graceful shutdown.

pub mod background_tasks;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::Client as S3Client;
use tokio_util::sync::CancellationToken;

use crate::batcher::Batcher;
use crate::config::Config;
use crate::error::Result;
use crate::offline_buffer::OfflineBuffer;
use crate::reader::{self, ReaderHandle};
use crate::uploader::backend::{S3Backend, UploadBackend};
use crate::uploader::Uploader;

/// Which of the four mutually-exclusive run modes the agent was started in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Real CAN hardware, full pipeline: batch, upload, retry worker, health monitor.
    Normal,
    /// Simulated CAN traffic, full pipeline except the health monitor.
    Simulation,
    /// Full local pipeline (real or simulated, per config) with uploading forced off.
    DryRun,
    /// Real CAN hardware, decode-and-print only — no batching, no storage.
    DecodeLive,
}

/// Cumulative counters logged in the periodic stats line and at shutdown.
#[derive(Debug, Default, Clone, Copy)]
struct RunStats {
    batches: u64,
    upload_ok: u64,
    upload_fail: u64,
}

/// Orchestrates one run of the agent for a given [`Mode`].
pub struct Supervisor {
    config: Config,
    mode: Mode,
}

impl Supervisor {
    /// Construct a supervisor for `config` running in `mode`.
    pub fn new(config: Config, mode: Mode) -> Self {
        Self { config, mode }
    }

    /// Run until `cancel` fires (a termination signal) or a fatal error
    /// occurs. Returns `Ok(())` for a clean shutdown; any `Err` should cause
    /// the caller to exit with code 1.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(vehicle_id = %self.config.vehicle_id, mode = ?self.mode, "starting CAN telemetry edge agent");

        if self.mode == Mode::DecodeLive {
            return self.run_decode_live(cancel).await;
        }

        let fps_window = Duration::from_secs(self.config.monitoring.fps_window_seconds);
        let ReaderHandle { mut frames, task: reader_task, stats: reader_stats } = self.spawn_reader(&cancel, fps_window)?;

        let mut batcher = Batcher::new(
            self.config.vehicle_id.clone(),
            self.config.batch.interval_sec as i64,
            self.config.batch.max_frames,
            self.config.storage.data_dir.clone(),
        );

        let upload_enabled = self.config.upload.enabled && self.mode != Mode::DryRun;
        let uploader = if upload_enabled { Some(Arc::new(self.build_uploader().await?)) } else { None };

        let offline_buffer = Arc::new(OfflineBuffer::new(
            self.config.storage.pending_dir.clone(),
            self.config.storage.max_disk_gb,
            self.config.offline.max_queue_size,
        )?);

        let mut background_tasks = Vec::new();
        if let Some(uploader) = &uploader {
            background_tasks.push(background_tasks::spawn_retry_worker(
                uploader.clone(),
                Duration::from_secs(self.config.offline.check_interval_sec),
                cancel.clone(),
            ));
        }
        if self.mode == Mode::Normal {
            background_tasks.push(background_tasks::spawn_health_monitor(
                reader_stats,
                offline_buffer.clone(),
                self.config.storage.data_dir.clone(),
                Duration::from_secs(self.config.monitoring.heartbeat_interval_seconds),
                fps_window,
                cancel.clone(),
            ));
        }

        let mut stats = RunStats::default();
        let run_result = self
            .main_loop(&mut frames, &mut batcher, uploader.as_deref(), &offline_buffer, &cancel, &mut stats)
            .await;

        self.shutdown(batcher, reader_task, background_tasks, stats).await;
        run_result
    }

    fn spawn_reader(&self, cancel: &CancellationToken, fps_window: Duration) -> Result<ReaderHandle> {
        match self.mode {
            Mode::Simulation => Ok(reader::spawn_simulated(
                &self.config.dbc.path,
                100,
                None,
                fps_window,
                cancel.clone(),
            )?),
            Mode::Normal | Mode::DryRun => Ok(reader::spawn_real(&self.config.can, fps_window, cancel.clone())),
            Mode::DecodeLive => unreachable!("decode-live takes the run_decode_live path before spawn_reader is called"),
        }
    }

    async fn build_uploader(&self) -> Result<Uploader> {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(self.config.s3.region.clone()))
            .load()
            .await;
        let client = S3Client::new(&aws_config);
        let backend: Arc<dyn UploadBackend> = Arc::new(S3Backend::new(client, self.config.s3.bucket.clone()));

        Ok(Uploader::new(
            backend,
            self.config.s3.prefix.clone(),
            self.config.storage.archive_dir.clone(),
            self.config.storage.pending_dir.clone(),
            self.config.upload.retry_config(),
        )?)
    }

    #[allow(clippy::too_many_arguments)]
    async fn main_loop(
        &self,
        frames: &mut tokio::sync::mpsc::Receiver<crate::frame::Frame>,
        batcher: &mut Batcher,
        uploader: Option<&Uploader>,
        offline_buffer: &OfflineBuffer,
        cancel: &CancellationToken,
        stats: &mut RunStats,
    ) -> Result<()> {
        loop {
            let frame = tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => {
                        tracing::warn!("frame channel closed unexpectedly, stopping main loop");
                        break;
                    }
                },
                _ = cancel.cancelled() => {
                    tracing::info!("shutdown requested, stopping frame capture");
                    break;
                }
            };

            if let Some(path) = batcher.add_frame(frame)? {
                self.handle_closed_file(path, uploader, offline_buffer, stats).await;
            }
        }
        Ok(())
    }

    async fn handle_closed_file(
        &self,
        path: PathBuf,
        uploader: Option<&Uploader>,
        offline_buffer: &OfflineBuffer,
        stats: &mut RunStats,
    ) {
        stats.batches += 1;
        tracing::info!(batch = stats.batches, path = %path.display(), "batch written");

        if let Some(uploader) = uploader {
            match uploader.upload(&path).await {
                Ok(true) => stats.upload_ok += 1,
                Ok(false) => {
                    stats.upload_fail += 1;
                    tracing::warn!(batch = stats.batches, "upload failed for batch, file moved to pending");
                    offline_buffer.enforce_limits();
                }
                Err(e) => {
                    tracing::error!(batch = stats.batches, error = %e, "upload raised an unexpected error");
                    stats.upload_fail += 1;
                }
            }
        }

        if stats.batches % self.config.monitoring.stats_log_every_n_batches == 0 {
            let buffer_stats = offline_buffer.get_stats();
            tracing::info!(
                batches = stats.batches,
                upload_ok = stats.upload_ok,
                upload_fail = stats.upload_fail,
                pending = buffer_stats.pending_count,
                disk_gb = format!("{:.2}", buffer_stats.disk_usage_bytes as f64 / (1024.0 * 1024.0 * 1024.0)),
                "stats"
            );
        }
    }

    async fn run_decode_live(&self, cancel: CancellationToken) -> Result<()> {
        let database = reader::dbc::Database::load(&self.config.dbc.path)?;
        tracing::info!(messages = database.messages.len(), "decode-live: loaded message definitions");

        let fps_window = Duration::from_secs(self.config.monitoring.fps_window_seconds);
        let ReaderHandle { mut frames, task, .. } = reader::spawn_real(&self.config.can, fps_window, cancel.clone());

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    match database.messages.iter().find(|m| m.frame_id == frame.arb_id) {
                        Some(message) => tracing::info!(
                            message = %message.name,
                            arb_id = format!("0x{:X}", frame.arb_id),
                            dlc = frame.dlc,
                            data = ?frame.data,
                            "decoded frame"
                        ),
                        None => tracing::debug!(arb_id = format!("0x{:X}", frame.arb_id), "frame with no matching message definition"),
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("shutdown requested, stopping decode-live");
                    break;
                }
            }
        }

        task.abort();
        Ok(())
    }

    async fn shutdown(
        &self,
        mut batcher: Batcher,
        reader_task: tokio::task::JoinHandle<()>,
        background_tasks: Vec<tokio::task::JoinHandle<()>>,
        stats: RunStats,
    ) {
        tracing::info!("shutting down edge agent");

        if let Ok(Some(path)) = batcher.flush() {
            tracing::info!(path = %path.display(), "flushed final in-flight batch on shutdown");
        }

        reader_task.abort();

        const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
        let joined = tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(background_tasks)).await;
        if joined.is_err() {
            tracing::warn!("background tasks did not finish within the shutdown grace period");
        }

        tracing::info!(
            batches = stats.batches,
            upload_ok = stats.upload_ok,
            upload_fail = stats.upload_fail,
            "final stats"
        );
        tracing::info!("edge agent stopped");
    }
}
