//! Time/count-bounded batching of CAN frames into Hive-partitioned Parquet
//! files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{BinaryArray, StringArray, TimestampNanosecondArray, UInt8Array, UInt32Array};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Datelike, Utc};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;

use crate::error::BatchError;
use crate::frame::Frame;

/// Parquet schema for raw CAN batch files: `timestamp/arb_id/dlc/data/vehicle_id`.
pub fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("timestamp", DataType::Timestamp(TimeUnit::Nanosecond, None), false),
        Field::new("arb_id", DataType::UInt32, false),
        Field::new("dlc", DataType::UInt8, false),
        Field::new("data", DataType::Binary, false),
        Field::new("vehicle_id", DataType::Utf8, false),
    ]))
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(3).expect("zstd level 3 is valid")))
        .set_dictionary_enabled(true)
        .set_statistics_enabled(parquet::file::properties::EnabledStatistics::Chunk)
        .build()
}

/// Batches frames into a time/count-bounded window and flushes them to a
/// Hive-partitioned Parquet file under `output_dir`.
pub struct Batcher {
    vehicle_id: String,
    window: chrono::Duration,
    max_frames: usize,
    output_dir: PathBuf,
    current_batch: Vec<Frame>,
    batch_start_time: Option<DateTime<Utc>>,
}

impl Batcher {
    /// Construct a batcher flushing every `window_sec` seconds or after
    /// `max_frames` frames, whichever comes first.
    pub fn new(vehicle_id: String, window_sec: i64, max_frames: usize, output_dir: PathBuf) -> Self {
        Self {
            vehicle_id,
            window: chrono::Duration::seconds(window_sec),
            max_frames,
            output_dir,
            current_batch: Vec::new(),
            batch_start_time: None,
        }
    }

    /// Whether the current batch should be flushed given `current_time`.
    pub fn should_flush(&self, current_time: DateTime<Utc>) -> bool {
        let Some(start) = self.batch_start_time else {
            return false;
        };
        if self.current_batch.is_empty() {
            return false;
        }
        if current_time - start >= self.window {
            return true;
        }
        if self.current_batch.len() >= self.max_frames {
            tracing::warn!(max_frames = self.max_frames, "batch reached max frames, flushing early");
            return true;
        }
        false
    }

    /// Add a frame to the current batch, flushing and returning the written
    /// path if the window or frame-count bound was crossed.
    pub fn add_frame(&mut self, frame: Frame) -> Result<Option<PathBuf>, BatchError> {
        if self.current_batch.is_empty() {
            self.batch_start_time = Some(frame.timestamp);
        }
        let timestamp = frame.timestamp;
        self.current_batch.push(frame);
        let should_flush_now = self.should_flush(timestamp);

        if should_flush_now {
            Ok(Some(self.flush()?.expect("batch is non-empty after push")))
        } else {
            Ok(None)
        }
    }

    /// Flush any buffered frames to a new Parquet file, resetting batch state.
    pub fn flush(&mut self) -> Result<Option<PathBuf>, BatchError> {
        if self.current_batch.is_empty() {
            return Ok(None);
        }
        let start_time = self.batch_start_time.unwrap_or_else(|| self.current_batch[0].timestamp);
        let frames = std::mem::take(&mut self.current_batch);
        self.batch_start_time = None;

        let path = self.write_batch(&frames, start_time)?;
        Ok(Some(path))
    }

    fn partition_path(&self, start_time: DateTime<Utc>) -> PathBuf {
        self.output_dir
            .join(format!("vehicle_id={}", self.vehicle_id))
            .join(format!("year={:04}", start_time.year()))
            .join(format!("month={:02}", start_time.month()))
            .join(format!("day={:02}", start_time.day()))
    }

    fn write_batch(&self, frames: &[Frame], start_time: DateTime<Utc>) -> Result<PathBuf, BatchError> {
        let partition_dir = self.partition_path(start_time);
        std::fs::create_dir_all(&partition_dir)
            .map_err(|source| BatchError::CreateDir { path: partition_dir.clone(), source })?;

        let filename = format!("{}Z_raw.parquet", start_time.format("%Y%m%dT%H%M%S"));
        let final_path = partition_dir.join(&filename);
        let tmp_path = partition_dir.join(format!(".{filename}.tmp"));

        let batch = self.frames_to_record_batch(frames)?;
        {
            let file = std::fs::File::create(&tmp_path)
                .map_err(|source| BatchError::CreateDir { path: tmp_path.clone(), source })?;
            let mut writer = ArrowWriter::try_new(file, schema(), Some(writer_properties()))?;
            writer.write(&batch)?;
            writer.close()?;
        }

        std::fs::rename(&tmp_path, &final_path)
            .map_err(|source| BatchError::Rename { from: tmp_path.clone(), to: final_path.clone(), source })?;

        let file_size = std::fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);
        tracing::info!(
            frames = frames.len(),
            size_mb = file_size as f64 / (1024.0 * 1024.0),
            path = %final_path.display(),
            "wrote batch"
        );

        Ok(final_path)
    }

    fn frames_to_record_batch(&self, frames: &[Frame]) -> Result<RecordBatch, BatchError> {
        let timestamps: Vec<i64> = frames.iter().map(|f| f.timestamp.timestamp_nanos_opt().unwrap_or(0)).collect();
        let arb_ids: Vec<u32> = frames.iter().map(|f| f.arb_id).collect();
        let dlcs: Vec<u8> = frames.iter().map(|f| f.dlc).collect();
        let data: Vec<&[u8]> = frames.iter().map(|f| f.data.as_slice()).collect();
        let vehicle_ids: Vec<&str> = frames.iter().map(|_| self.vehicle_id.as_str()).collect();

        let batch = RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(TimestampNanosecondArray::from(timestamps)),
                Arc::new(UInt32Array::from(arb_ids)),
                Arc::new(UInt8Array::from(dlcs)),
                Arc::new(BinaryArray::from(data)),
                Arc::new(StringArray::from(vehicle_ids)),
            ],
        )?;
        Ok(batch)
    }
}

/// Drain-and-flush helper used by the supervisor's shutdown path: flushes
/// whatever is buffered, ignoring an empty batch.
pub fn flush_remaining(batcher: &mut Batcher) -> Result<Option<PathBuf>, BatchError> {
    batcher.flush()
}

#[allow(dead_code)]
fn _assert_output_dir_exists(p: &Path) -> bool {
    p.exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn frame_at(ts: DateTime<Utc>, arb_id: u32) -> Frame {
        Frame { timestamp: ts, arb_id, dlc: 4, data: vec![1, 2, 3, 4], fd: false, channel: "can0".to_string() }
    }

    #[test]
    fn flush_empty_batch_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut batcher = Batcher::new("veh-1".to_string(), 60, 1000, dir.path().to_path_buf());
        assert!(batcher.flush().unwrap().is_none());
    }

    #[test]
    fn add_frame_flushes_on_max_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut batcher = Batcher::new("veh-1".to_string(), 3600, 3, dir.path().to_path_buf());
        let t0 = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();

        assert!(batcher.add_frame(frame_at(t0, 0x100)).unwrap().is_none());
        assert!(batcher.add_frame(frame_at(t0, 0x101)).unwrap().is_none());
        let flushed = batcher.add_frame(frame_at(t0, 0x102)).unwrap();
        assert!(flushed.is_some());
        assert!(flushed.unwrap().exists());
    }

    #[test]
    fn add_frame_flushes_on_window_elapsed() {
        let dir = tempfile::tempdir().unwrap();
        let mut batcher = Batcher::new("veh-1".to_string(), 60, 100_000, dir.path().to_path_buf());
        let t0 = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(61);

        assert!(batcher.add_frame(frame_at(t0, 0x100)).unwrap().is_none());
        let flushed = batcher.add_frame(frame_at(t1, 0x101)).unwrap();
        assert!(flushed.is_some());
    }

    #[test]
    fn written_path_follows_hive_partitioning() {
        let dir = tempfile::tempdir().unwrap();
        let mut batcher = Batcher::new("veh-42".to_string(), 60, 100, dir.path().to_path_buf());
        let t0 = Utc.with_ymd_and_hms(2026, 3, 5, 8, 30, 0).unwrap();
        batcher.add_frame(frame_at(t0, 0x200)).unwrap();
        let path = batcher.flush().unwrap().unwrap();

        let expected_dir = dir.path().join("vehicle_id=veh-42").join("year=2026").join("month=03").join("day=05");
        assert_eq!(path.parent().unwrap(), expected_dir);
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with("Z_raw.parquet"));
    }

    #[test]
    fn no_tmp_file_survives_a_successful_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut batcher = Batcher::new("veh-1".to_string(), 60, 100, dir.path().to_path_buf());
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        batcher.add_frame(frame_at(t0, 0x1)).unwrap();
        let path = batcher.flush().unwrap().unwrap();
        let dir_entries: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(dir_entries.len(), 1, "only the final file should remain, no .tmp");
    }

    #[test]
    fn parquet_file_round_trips_all_frame_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut batcher = Batcher::new("veh-7".to_string(), 60, 100, dir.path().to_path_buf());
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        batcher.add_frame(frame_at(t0, 0x7ab)).unwrap();
        let path = batcher.flush().unwrap().unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let reader = parquet::file::reader::SerializedFileReader::new(file).unwrap();
        use parquet::file::reader::FileReader;
        assert_eq!(reader.metadata().file_metadata().num_rows(), 1);
    }
}
