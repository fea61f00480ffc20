//! The agent's declarative TOML configuration schema.
//!
//! Unknown keys are accepted and ignored (we don't `deny_unknown_fields`, so
//! a config written for a newer agent version doesn't fail an older one);
//! missing *required* keys fail [`AgentConfig::validate`] with
//! `ErrorCode::BadConfig`. Only the `sinks.*`, `dlq.*`, and `logging.*`
//! sections are hot-reloadable; changes elsewhere take effect on restart
//! only (enforced by the caller diffing old vs. new config on reload, not by
//! this crate).
use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use errors::ErrorMetadata;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub file_monitor: FileMonitorConfig,
    #[serde(default)]
    pub container_monitor: ContainerMonitorConfig,
    #[serde(default)]
    pub sinks: HashMap<String, SinkConfig>,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub position_store: PositionStoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl AgentConfig {
    /// Checks cross-field invariants that `serde`'s per-field defaults can't
    /// express. Called once at startup and again after every hot reload.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatcher.worker_count == 0 {
            return Err(ErrorMetadata::bad_config(
                "DispatcherWorkerCountZero",
                "dispatcher.worker_count must be at least 1",
            )
            .into());
        }
        if self.dispatcher.queue_size == 0 {
            return Err(ErrorMetadata::bad_config(
                "DispatcherQueueSizeZero",
                "dispatcher.queue_size must be at least 1",
            )
            .into());
        }
        let bp = &self.dispatcher.backpressure;
        if !(0.0..=1.0).contains(&bp.soft) || !(0.0..=1.0).contains(&bp.hard) || bp.soft > bp.hard
        {
            return Err(ErrorMetadata::bad_config(
                "DispatcherBackpressureRange",
                "dispatcher.backpressure.{soft,hard} must satisfy 0 <= soft <= hard <= 1",
            )
            .into());
        }
        if self.file_monitor.enabled && self.file_monitor.paths.is_empty() {
            return Err(ErrorMetadata::bad_config(
                "FileMonitorNoPaths",
                "file_monitor.paths must be non-empty when file_monitor.enabled = true",
            )
            .into());
        }
        if self.dlq.enabled && self.dlq.directory.as_os_str().is_empty() {
            return Err(ErrorMetadata::bad_config(
                "DlqDirectoryMissing",
                "dlq.directory is required when dlq.enabled = true",
            )
            .into());
        }
        if self.position_store.path.as_os_str().is_empty() {
            return Err(ErrorMetadata::bad_config(
                "PositionStorePathMissing",
                "position_store.path is required",
            )
            .into());
        }
        for (name, sink) in &self.sinks {
            if sink.enabled && sink.max_batch_size == 0 {
                return Err(ErrorMetadata::bad_config(
                    "SinkMaxBatchSizeZero",
                    format!("sinks.{name}.max_batch_size must be at least 1"),
                )
                .into());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub queue_size: usize,
    pub worker_count: u32,
    pub batch_processor: BatchProcessorConfig,
    pub backpressure: BackpressureConfig,
    /// Per-`sink.Send` call timeout, in milliseconds.
    pub send_timeout_ms: u64,
    /// Grace period given to queue drain during shutdown, in milliseconds.
    pub shutdown_grace_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_size: 50_000,
            worker_count: 8,
            batch_processor: BatchProcessorConfig::default(),
            backpressure: BackpressureConfig::default(),
            send_timeout_ms: 120_000,
            shutdown_grace_ms: 60_000,
        }
    }
}

impl DispatcherConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BatchProcessorConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for BatchProcessorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 500,
            flush_interval_ms: 1_000,
        }
    }
}

impl BatchProcessorConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub soft: f64,
    pub hard: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            soft: 0.7,
            hard: 0.95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekStrategy {
    Beginning,
    Recent,
    End,
}

impl Default for SeekStrategy {
    fn default() -> Self {
        Self::End
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    Oldest,
    Newest,
    Random,
}

impl Default for DropPolicy {
    fn default() -> Self {
        Self::Oldest
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileMonitorConfig {
    pub enabled: bool,
    pub paths: Vec<String>,
    pub seek_strategy: SeekStrategy,
    pub seek_recent_bytes: u64,
    pub ignore_old_timestamps: bool,
    pub max_retry_queue_size: usize,
    pub retry: RetryQueueConfig,
}

impl Default for FileMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            paths: Vec::new(),
            seek_strategy: SeekStrategy::default(),
            seek_recent_bytes: 64 * 1024,
            ignore_old_timestamps: false,
            max_retry_queue_size: 1_000,
            retry: RetryQueueConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryQueueConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub drop_policy: DropPolicy,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            drop_policy: DropPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ContainerMonitorConfig {
    pub enabled: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub stream_rotation_interval_secs: u64,
    pub read_deadline_secs: u64,
    /// Self-monitoring circuit breaker: if more than this fraction of
    /// records in `self_monitor_window_secs` come from a single container,
    /// it's suspected of log-flooding and gets throttled.
    pub self_monitor_threshold: f64,
    pub self_monitor_window_secs: u64,
}

impl Default for ContainerMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            include: Vec::new(),
            exclude: Vec::new(),
            stream_rotation_interval_secs: 3_600,
            read_deadline_secs: 30,
            self_monitor_threshold: 0.9,
            self_monitor_window_secs: 60,
        }
    }
}

impl ContainerMonitorConfig {
    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    HttpStream,
    MessageBus,
    LocalFile,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SinkConfig {
    pub kind: SinkKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_sink_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_sink_worker_count")]
    pub worker_count: u32,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: usize,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub retry: SinkRetryConfig,
    /// URL for `http_stream`, broker list for `message_bus`, directory for
    /// `local_file`. Kept as a flat string map rather than a `kind`-tagged
    /// enum of option structs so new wire options don't require a schema
    /// migration for every sink.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}
fn default_max_batch_size() -> usize {
    500
}
fn default_flush_interval_ms() -> u64 {
    1_000
}
fn default_sink_queue_size() -> usize {
    10_000
}
fn default_sink_worker_count() -> u32 {
    4
}
fn default_max_open_files() -> usize {
    256
}

impl SinkConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub open_duration_secs: u64,
    /// Ceiling for the cool-down after repeated half-open probe failures
    /// keep doubling it.
    pub max_open_duration_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_secs: 30,
            max_open_duration_secs: 600,
        }
    }
}

impl CircuitConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_duration_secs)
    }

    pub fn max_open_duration(&self) -> Duration {
        Duration::from_secs(self.max_open_duration_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SinkRetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for SinkRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 250,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub retention: RetentionConfig,
    pub reprocess: ReprocessConfig,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("/var/lib/agent/dlq"),
            retention: RetentionConfig::default(),
            reprocess: ReprocessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_age_secs: u64,
    pub max_size_bytes: u64,
    pub max_entries: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 7 * 24 * 3600,
            max_size_bytes: 10 * 1024 * 1024 * 1024,
            max_entries: 10_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReprocessConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub rate_limit: u32,
}

impl Default for ReprocessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 300,
            rate_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PositionStoreConfig {
    pub path: PathBuf,
    pub flush_interval_ms: u64,
}

impl Default for PositionStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/agent/positions.json"),
            flush_interval_ms: 5_000,
        }
    }
}

impl PositionStoreConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Pretty
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_validate() {
        AgentConfig::default_for_test().validate().unwrap();
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = AgentConfig::default_for_test();
        config.dispatcher.worker_count = 0;
        let err = config.validate().unwrap_err();
        assert!(err.downcast_ref::<ErrorMetadata>().unwrap().is_permanent());
    }

    #[test]
    fn backwards_backpressure_rejected() {
        let mut config = AgentConfig::default_for_test();
        config.dispatcher.backpressure.soft = 0.9;
        config.dispatcher.backpressure.hard = 0.5;
        assert!(config.validate().is_err());
    }

    impl AgentConfig {
        fn default_for_test() -> Self {
            AgentConfig {
                dispatcher: DispatcherConfig::default(),
                file_monitor: FileMonitorConfig::default(),
                container_monitor: ContainerMonitorConfig::default(),
                sinks: HashMap::new(),
                dlq: DlqConfig {
                    enabled: false,
                    ..DlqConfig::default()
                },
                position_store: PositionStoreConfig::default(),
                logging: LoggingConfig::default(),
                admin: AdminConfig::default(),
            }
        }
    }
}
