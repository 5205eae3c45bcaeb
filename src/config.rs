//! Configuration types for the CAN telemetry edge agent.
//!
//! The on-disk format is YAML. Fields are grouped into nested sub-configs
//! matching the canonical schema in the configuration reference; a legacy
//! schema (`batching.*`, `upload.s3_bucket`, `offline_buffer.*`) is accepted
//! and normalized before strict deserialization.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level agent configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Vehicle identifier embedded in every partition path and column.
    pub vehicle_id: String,

    /// CAN bus connection settings.
    #[serde(default)]
    pub can: CanConfig,

    /// Message-definition database used by the simulator and decode-live mode.
    #[serde(default)]
    pub dbc: DbcConfig,

    /// Batch window settings.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Local storage directories and disk cap.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Remote object store location.
    #[serde(default)]
    pub s3: S3Config,

    /// Upload behavior and retry policy.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Offline buffer (pending queue) limits.
    #[serde(default)]
    pub offline: OfflineConfig,

    /// Health monitor and reporting cadence.
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Logging setup.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// CAN bus connection settings (§6.4 `can.*`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CanConfig {
    /// Backend name, e.g. "socketcan".
    #[serde(default = "default_can_interface")]
    pub interface: String,
    /// Interface/channel name, e.g. "can0".
    #[serde(default = "default_can_channel")]
    pub channel: String,
    /// Bus bitrate in bits per second.
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// CAN FD support.
    #[serde(default)]
    pub fd: bool,
    /// Receive frames this node transmitted.
    #[serde(default)]
    pub receive_own_messages: bool,
    /// Optional kernel-level receive filters.
    #[serde(default)]
    pub filters: Vec<CanFilterConfig>,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: default_can_interface(),
            channel: default_can_channel(),
            bitrate: default_bitrate(),
            fd: false,
            receive_own_messages: false,
            filters: Vec::new(),
        }
    }
}

/// A single kernel-level CAN receive filter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CanFilterConfig {
    /// Arbitration ID to match.
    pub id: u32,
    /// Mask applied before comparison.
    pub mask: u32,
    /// Whether `id`/`mask` use the 29-bit extended format.
    #[serde(default)]
    pub extended: bool,
}

/// Message-definition database location (§4.1 simulator/decode-live).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbcConfig {
    /// Path to the message-definition file.
    #[serde(default)]
    pub path: PathBuf,
}

impl Default for DbcConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("messages.json") }
    }
}

/// Batch window settings (§6.4 `batch.*`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Window length in seconds before a batch is flushed.
    #[serde(default = "default_interval_sec")]
    pub interval_sec: u64,
    /// Maximum frames per batch regardless of elapsed time.
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { interval_sec: default_interval_sec(), max_frames: default_max_frames() }
    }
}

/// Local storage directories and disk cap (§6.4 `storage.*`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Staging directory where the batcher writes new files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory for files whose upload has succeeded.
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    /// Directory for files awaiting upload.
    #[serde(default = "default_pending_dir")]
    pub pending_dir: PathBuf,
    /// Maximum pending-directory size in gigabytes.
    #[serde(default = "default_max_disk_gb")]
    pub max_disk_gb: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            archive_dir: default_archive_dir(),
            pending_dir: default_pending_dir(),
            max_disk_gb: default_max_disk_gb(),
        }
    }
}

/// Remote object store location (§6.4 `s3.*`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct S3Config {
    /// Bucket name.
    #[serde(default)]
    pub bucket: String,
    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Key prefix under which all objects are stored.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self { bucket: String::new(), region: default_region(), prefix: default_prefix() }
    }
}

/// Upload behavior and retry policy (§6.4 `upload.*`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Whether uploading is enabled at all (dry-run-like toggle independent of CLI mode).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum retry attempts per upload.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial backoff delay in seconds.
    #[serde(default = "default_initial_backoff_sec")]
    pub initial_backoff_sec: f64,
    /// Maximum backoff delay in seconds.
    #[serde(default = "default_max_backoff_sec")]
    pub max_backoff_sec: f64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            initial_backoff_sec: default_initial_backoff_sec(),
            max_backoff_sec: default_max_backoff_sec(),
        }
    }
}

impl UploadConfig {
    /// Project this config onto the generic [`RetryConfig`] shape used by [`crate::retry`].
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retries,
            initial_delay: Duration::from_secs_f64(self.initial_backoff_sec),
            max_delay: Duration::from_secs_f64(self.max_backoff_sec),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Offline buffer (pending queue) limits and retry cadence (§6.4 `offline.*`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OfflineConfig {
    /// Retry worker wake interval in seconds.
    #[serde(default = "default_check_interval_sec")]
    pub check_interval_sec: u64,
    /// Maximum number of pending files.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            check_interval_sec: default_check_interval_sec(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

/// Health monitor cadence and reporting knobs (§6.4 `monitoring.*`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Health monitor heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Width of the rolling frames-per-second window, in seconds.
    #[serde(default = "default_fps_window")]
    pub fps_window_seconds: u64,
    /// Log a combined stats line every N closed batches.
    #[serde(default = "default_stats_cadence")]
    pub stats_log_every_n_batches: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            fps_window_seconds: default_fps_window(),
            stats_log_every_n_batches: default_stats_cadence(),
        }
    }
}

/// Logging setup (§6.4 `logging.*`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Tracing filter directive, e.g. "info" or "can_telemetry_agent=debug".
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Optional log file path; when set, a rotating file appender is added.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Maximum size in bytes before rotating (used only with `file`).
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
    /// Number of rotated backups to retain.
    #[serde(default = "default_log_backup_count")]
    pub backup_count: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            max_bytes: default_log_max_bytes(),
            backup_count: default_log_backup_count(),
        }
    }
}

/// Retry configuration shared by the uploader's backoff loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_attempts: u32,
    /// Initial delay before the first retry.
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retryable failure.
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_retries(),
            initial_delay: Duration::from_secs_f64(default_initial_backoff_sec()),
            max_delay: Duration::from_secs_f64(default_max_backoff_sec()),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

impl Config {
    /// Load and normalize configuration from a YAML file.
    ///
    /// Accepts both the canonical schema and the legacy schema
    /// (`batching.*`, `upload.s3_bucket`, `offline_buffer.*`), normalizing
    /// the latter into the former before strict deserialization.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut value: serde_yaml::Value = serde_yaml::from_str(&raw)?;
        normalize_legacy_schema(&mut value);

        let config: Config = serde_yaml::from_value(value)?;
        if config.vehicle_id.trim().is_empty() {
            return Err(ConfigError::MissingField("vehicle_id".to_string()));
        }
        if config.upload.enabled && config.s3.bucket.trim().is_empty() {
            return Err(ConfigError::MissingField("s3.bucket".to_string()));
        }
        Ok(config)
    }
}

/// Rewrite legacy top-level keys (`batching.*`, `upload.s3_bucket`,
/// `offline_buffer.*`) into their canonical equivalents in place, logging one
/// warning per key translated.
fn normalize_legacy_schema(value: &mut serde_yaml::Value) {
    let serde_yaml::Value::Mapping(map) = value else { return };

    if let Some(legacy) = map.remove("batching") {
        tracing::warn!("config uses legacy key `batching`; normalizing to `batch`");
        merge_into(map, "batch", legacy);
    }

    if let Some(serde_yaml::Value::Mapping(upload)) = map.get_mut("upload") {
        if let Some(bucket) = upload.remove("s3_bucket") {
            tracing::warn!("config uses legacy key `upload.s3_bucket`; normalizing to `s3.bucket`");
            let s3_entry = map
                .entry(serde_yaml::Value::String("s3".to_string()))
                .or_insert_with(|| serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
            if let serde_yaml::Value::Mapping(s3) = s3_entry {
                s3.insert(serde_yaml::Value::String("bucket".to_string()), bucket);
            }
        }
    }

    if let Some(legacy) = map.remove("offline_buffer") {
        tracing::warn!("config uses legacy key `offline_buffer`; normalizing to `offline`");
        merge_into(map, "offline", legacy);
    }
}

fn merge_into(map: &mut serde_yaml::Mapping, canonical_key: &str, legacy_value: serde_yaml::Value) {
    let key = serde_yaml::Value::String(canonical_key.to_string());
    match (map.get_mut(&key), legacy_value) {
        (Some(serde_yaml::Value::Mapping(existing)), serde_yaml::Value::Mapping(legacy)) => {
            for (k, v) in legacy {
                existing.insert(k, v);
            }
        }
        (None, legacy) => {
            map.insert(key, legacy);
        }
        _ => {}
    }
}

fn default_can_interface() -> String {
    "socketcan".to_string()
}
fn default_can_channel() -> String {
    "can0".to_string()
}
fn default_bitrate() -> u32 {
    500_000
}
fn default_interval_sec() -> u64 {
    60
}
fn default_max_frames() -> usize {
    100_000
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_archive_dir() -> PathBuf {
    PathBuf::from("./data/archive")
}
fn default_pending_dir() -> PathBuf {
    PathBuf::from("./data/pending")
}
fn default_max_disk_gb() -> f64 {
    10.0
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_prefix() -> String {
    "raw".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_sec() -> f64 {
    2.0
}
fn default_max_backoff_sec() -> f64 {
    300.0
}
fn default_check_interval_sec() -> u64 {
    60
}
fn default_max_queue_size() -> usize {
    100
}
fn default_heartbeat_interval() -> u64 {
    60
}
fn default_fps_window() -> u64 {
    10
}
fn default_stats_cadence() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_log_max_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_log_backup_count() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn canonical_config_loads_with_defaults() {
        let file = write_temp(
            r#"
vehicle_id: VIN12345
s3:
  bucket: my-bucket
"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.vehicle_id, "VIN12345");
        assert_eq!(config.batch.interval_sec, 60);
        assert_eq!(config.batch.max_frames, 100_000);
        assert_eq!(config.s3.bucket, "my-bucket");
        assert_eq!(config.s3.region, "us-east-1");
    }

    #[test]
    fn legacy_batching_key_is_normalized() {
        let file = write_temp(
            r#"
vehicle_id: VIN1
s3:
  bucket: b
batching:
  interval_sec: 30
  max_frames: 500
"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.batch.interval_sec, 30);
        assert_eq!(config.batch.max_frames, 500);
    }

    #[test]
    fn legacy_s3_bucket_key_is_normalized() {
        let file = write_temp(
            r#"
vehicle_id: VIN1
upload:
  s3_bucket: legacy-bucket
"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.s3.bucket, "legacy-bucket");
    }

    #[test]
    fn legacy_offline_buffer_key_is_normalized() {
        let file = write_temp(
            r#"
vehicle_id: VIN1
s3:
  bucket: b
offline_buffer:
  max_queue_size: 42
"#,
        );
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.offline.max_queue_size, 42);
    }

    #[test]
    fn missing_vehicle_id_is_rejected() {
        let file = write_temp("s3:\n  bucket: b\n");
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(ref f) if f == "vehicle_id"));
    }

    #[test]
    fn missing_bucket_rejected_when_upload_enabled() {
        let file = write_temp("vehicle_id: VIN1\n");
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(ref f) if f == "s3.bucket"));
    }

    #[test]
    fn missing_bucket_allowed_when_upload_disabled() {
        let file = write_temp("vehicle_id: VIN1\nupload:\n  enabled: false\n");
        let config = Config::load(file.path()).unwrap();
        assert!(!config.upload.enabled);
    }

    #[test]
    fn retry_config_projection_matches_upload_config() {
        let upload = UploadConfig { max_retries: 3, initial_backoff_sec: 1.5, max_backoff_sec: 30.0, ..Default::default() };
        let retry = upload.retry_config();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay, Duration::from_secs_f64(1.5));
        assert_eq!(retry.max_delay, Duration::from_secs_f64(30.0));
    }
}
