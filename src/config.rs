//! Pipeline configuration
//!
//! Every field has a default, so a YAML file only needs the values it
//! overrides:
//!
//! ```rust
//! use laptrace::PipelineConfig;
//!
//! let yaml = "target_hz: 30\nconnection:\n  max_attempts_per_minute: 5\n";
//! let config = PipelineConfig::from_yaml_str(yaml).unwrap();
//! assert_eq!(config.target_hz, 30.0);
//! assert_eq!(config.connection.max_attempts_per_minute, 5);
//! assert_eq!(config.work_queue_capacity, 512);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TelemetryError};

/// Top-level configuration for [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Producer sampling frequency
    pub target_hz: f64,
    /// Sleep between ticks while the source is disconnected
    pub disconnected_poll_ms: u64,
    /// Upper bound on any single call into the telemetry source
    pub source_timeout_ms: u64,

    /// Time span the circular buffer should cover
    pub buffer_window_secs: f64,
    pub buffer_min_capacity: usize,
    pub buffer_max_capacity: usize,
    /// Minimum spacing between buffer resizes
    pub buffer_resize_interval_secs: u64,
    /// Relative capacity change below which a resize is skipped
    pub buffer_resize_threshold: f64,

    /// Achieved/target ratio under which a low-frequency diagnostic fires
    pub low_frequency_ratio: f64,
    /// Interval of achieved-frequency reports
    pub frequency_report_secs: u64,

    pub work_queue_capacity: usize,
    /// Consumer queue pop timeout, also the shutdown poll interval
    pub pop_timeout_ms: u64,
    /// Upper bound on waiting for in-flight persistence at shutdown
    pub shutdown_timeout_secs: u64,
    /// Capacity of the observer event channel
    pub event_capacity: usize,

    pub connection: ConnectionConfig,
    pub session: SessionConfig,
    pub persistence: PersistenceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_hz: 60.0,
            disconnected_poll_ms: 500,
            source_timeout_ms: 1_000,
            buffer_window_secs: 60.0,
            buffer_min_capacity: 60,
            buffer_max_capacity: 36_000,
            buffer_resize_interval_secs: 30,
            buffer_resize_threshold: 0.05,
            low_frequency_ratio: 0.92,
            frequency_report_secs: 5,
            work_queue_capacity: 512,
            pop_timeout_ms: 100,
            shutdown_timeout_secs: 5,
            event_capacity: 256,
            connection: ConnectionConfig::default(),
            session: SessionConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

/// Connection state manager tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub backoff_floor_secs: f64,
    pub backoff_cap_secs: f64,
    pub max_attempts_per_minute: u32,
    /// How long a connectivity result is trusted before probing again
    pub cache_ttl_secs: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backoff_floor_secs: 5.0,
            backoff_cap_secs: 30.0,
            max_attempts_per_minute: 3,
            cache_ttl_secs: 2.0,
        }
    }
}

/// Session resolver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Store user the sessions belong to
    pub user_id: String,
    /// Resume window when the simulator reports no native session id
    pub offline_lookback_secs: u64,
    pub online_lookback_secs: u64,
    /// Delay before retrying a failed resolution
    pub resolve_retry_secs: u64,
    /// A store call without a response by then counts as unavailable
    pub store_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: "local".to_string(),
            offline_lookback_secs: 3_600,
            online_lookback_secs: 4 * 3_600,
            resolve_retry_secs: 5,
            store_timeout_ms: 5_000,
        }
    }
}

/// Lap persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Root directory for per-session artifact folders
    pub artifact_root: PathBuf,
    pub write_artifacts: bool,
    /// Remote attempts per lap after the first failure
    pub remote_retries: u32,
    /// Upper bound on a single remote lap write
    pub remote_timeout_ms: u64,
    /// Laps held for remote retry before the oldest is given up
    pub pending_cap: usize,
    /// Laps with fewer frames are not written
    pub min_lap_points: usize,
    /// Minimum lap duration for the pattern and jump heuristics of the raw detector
    pub raw_lap_min_secs: f64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from("laps"),
            write_artifacts: true,
            remote_retries: 3,
            remote_timeout_ms: 5_000,
            pending_cap: 64,
            min_lap_points: 10,
            raw_lap_min_secs: 10.0,
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| TelemetryError::file_error(path.to_path_buf(), e))?;
        let config = Self::from_yaml_str(&text)?;
        debug!(path = %path.display(), "Loaded pipeline configuration");
        Ok(config)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if !(self.target_hz.is_finite() && self.target_hz > 0.0) {
            return Err(TelemetryError::config("target_hz must be positive"));
        }
        if !(self.buffer_window_secs.is_finite() && self.buffer_window_secs > 0.0) {
            return Err(TelemetryError::config("buffer_window_secs must be positive"));
        }
        if self.buffer_min_capacity == 0 || self.buffer_min_capacity > self.buffer_max_capacity {
            return Err(TelemetryError::config(
                "buffer capacities must satisfy 0 < buffer_min_capacity <= buffer_max_capacity",
            ));
        }
        if !(0.0..1.0).contains(&self.buffer_resize_threshold) {
            return Err(TelemetryError::config("buffer_resize_threshold must be in [0, 1)"));
        }
        if !(self.low_frequency_ratio > 0.0 && self.low_frequency_ratio <= 1.0) {
            return Err(TelemetryError::config("low_frequency_ratio must be in (0, 1]"));
        }
        if self.frequency_report_secs == 0 {
            return Err(TelemetryError::config("frequency_report_secs must be non-zero"));
        }
        if self.work_queue_capacity == 0 || self.event_capacity == 0 {
            return Err(TelemetryError::config("queue capacities must be non-zero"));
        }
        if self.pop_timeout_ms == 0 {
            return Err(TelemetryError::config("pop_timeout_ms must be non-zero"));
        }
        if self.source_timeout_ms == 0 {
            return Err(TelemetryError::config("source_timeout_ms must be non-zero"));
        }

        let connection = &self.connection;
        if !(connection.backoff_floor_secs > 0.0
            && connection.backoff_floor_secs <= connection.backoff_cap_secs)
        {
            return Err(TelemetryError::config(
                "backoff must satisfy 0 < backoff_floor_secs <= backoff_cap_secs",
            ));
        }
        if connection.max_attempts_per_minute == 0 {
            return Err(TelemetryError::config("max_attempts_per_minute must be non-zero"));
        }
        if !(connection.cache_ttl_secs.is_finite() && connection.cache_ttl_secs >= 0.0) {
            return Err(TelemetryError::config("cache_ttl_secs must be non-negative"));
        }

        if self.session.user_id.trim().is_empty() {
            return Err(TelemetryError::config("session.user_id must not be empty"));
        }
        if self.session.store_timeout_ms == 0 || self.persistence.remote_timeout_ms == 0 {
            return Err(TelemetryError::config("store timeouts must be non-zero"));
        }
        if self.persistence.pending_cap == 0 {
            return Err(TelemetryError::config("persistence.pending_cap must be non-zero"));
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.target_hz)
    }

    pub fn disconnected_poll(&self) -> Duration {
        Duration::from_millis(self.disconnected_poll_ms)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn frequency_report_interval(&self) -> Duration {
        Duration::from_secs(self.frequency_report_secs)
    }

    pub fn buffer_resize_interval(&self) -> Duration {
        Duration::from_secs(self.buffer_resize_interval_secs)
    }

    /// Initial buffer capacity: the target rate over the configured window.
    pub fn initial_buffer_capacity(&self) -> usize {
        self.buffer_capacity_for(self.target_hz)
    }

    /// Capacity that spans the configured window at `hz`, clamped.
    pub fn buffer_capacity_for(&self, hz: f64) -> usize {
        let wanted = (hz * self.buffer_window_secs).round();
        let wanted = if wanted.is_finite() && wanted > 0.0 { wanted as usize } else { 0 };
        wanted.clamp(self.buffer_min_capacity, self.buffer_max_capacity)
    }
}

impl ConnectionConfig {
    pub fn backoff_floor(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_floor_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_cap_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.cache_ttl_secs)
    }
}

impl SessionConfig {
    /// Resume lookback for a session with or without a native id.
    pub fn lookback(&self, offline: bool) -> Duration {
        if offline {
            Duration::from_secs(self.offline_lookback_secs)
        } else {
            Duration::from_secs(self.online_lookback_secs)
        }
    }

    pub fn resolve_retry(&self) -> Duration {
        Duration::from_secs(self.resolve_retry_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl PersistenceConfig {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.initial_buffer_capacity(), 3_600);
        assert_eq!(config.connection.backoff_floor(), Duration::from_secs(5));
        assert_eq!(config.session.lookback(true), Duration::from_secs(3_600));
        assert_eq!(config.session.lookback(false), Duration::from_secs(14_400));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = PipelineConfig::from_yaml_str(
            "work_queue_capacity: 64\npersistence:\n  artifact_root: /tmp/laps\n",
        )
        .unwrap();
        assert_eq!(config.work_queue_capacity, 64);
        assert_eq!(config.persistence.artifact_root, PathBuf::from("/tmp/laps"));
        assert_eq!(config.persistence.remote_retries, 3);
        assert_eq!(config.target_hz, 60.0);
    }

    #[test]
    fn rejects_inverted_backoff() {
        let err = PipelineConfig::from_yaml_str(
            "connection:\n  backoff_floor_secs: 40\n  backoff_cap_secs: 30\n",
        )
        .unwrap_err();
        assert!(matches!(err, TelemetryError::Config { .. }));
    }

    #[test]
    fn rejects_zero_rate_and_capacity() {
        let config = PipelineConfig { target_hz: 0.0, ..PipelineConfig::default() };
        assert!(config.validate().is_err());

        let config = PipelineConfig { work_queue_capacity: 0, ..PipelineConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unbounded_io() {
        let config = PipelineConfig { source_timeout_ms: 0, ..PipelineConfig::default() };
        assert!(config.validate().is_err());

        let err = PipelineConfig::from_yaml_str("session:\n  store_timeout_ms: 0\n").unwrap_err();
        assert!(matches!(err, TelemetryError::Config { .. }));

        let err =
            PipelineConfig::from_yaml_str("persistence:\n  remote_timeout_ms: 0\n").unwrap_err();
        assert!(matches!(err, TelemetryError::Config { .. }));
    }

    #[test]
    fn capacity_is_clamped() {
        let config = PipelineConfig::default();
        assert_eq!(config.buffer_capacity_for(0.0), 60);
        assert_eq!(config.buffer_capacity_for(55.2), 3_312);
        assert_eq!(config.buffer_capacity_for(10_000.0), 36_000);
        assert_eq!(config.buffer_capacity_for(f64::NAN), 60);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("laptrace.yaml");
        std::fs::write(&path, "target_hz: 50\n").unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap().target_hz, 50.0);

        let missing = PipelineConfig::load(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(missing, TelemetryError::File { .. }));
    }
}
