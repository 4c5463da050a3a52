//! Observer events and pipeline statistics
//!
//! Workers publish [`PipelineEvent`] values on a broadcast channel. Nothing
//! here formats log lines: a collector consumes the typed values directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::connection::ConnectionTransition;
use crate::session::{LapId, Resolution, SessionIdentity};
use crate::types::{LapSectorRecord, SectorComparison};

/// Structured health signals. Never errors: the pipeline keeps running.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// Periodic achieved sampling rate
    FrequencyReport { achieved_hz: f64, target_hz: f64 },
    /// Achieved rate fell below the configured ratio of the target
    LowFrequency { achieved_hz: f64, target_hz: f64, ratio: f64 },
    BufferResized { from: usize, to: usize, achieved_hz: f64 },
    ConnectionTransition(ConnectionTransition),
    /// Frames dropped from the work queue path since the last report
    FramesDropped { since_last: u64, total: u64 },
    /// A sector crossing with a negative duration was skipped
    ClockRegression { sector_index: usize, entry_clock: f64, session_clock: f64 },
    LayoutRejected { reason: String },
    SessionResolveFailed { reason: String },
    ArtifactWriteFailed { lap_number: i32, reason: String },
    /// Remote lap write given up after the retry budget
    LapPersistFailed { lap_number: i32, attempts: u32, reason: String },
}

/// Everything observers can subscribe to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// The timing engine produced a lap record (valid or partial)
    LapCompleted { record: LapSectorRecord, comparison: SectorComparison },
    /// The raw position detector closed a lap while no layout was loaded
    RawLapDetected { lap_number: i32, point_count: usize, duration: f64 },
    LayoutLoaded { sectors: usize },
    SessionChanged { resolution: Resolution, identity: Arc<SessionIdentity> },
    LapPersisted { lap_number: i32, artifact: Option<PathBuf>, remote_id: Option<LapId> },
    Diagnostic(Diagnostic),
}

/// Lock-free pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_captured: AtomicU64,
    frames_queued: AtomicU64,
    frames_dropped: AtomicU64,
    adapter_misses: AtomicU64,
    laps_completed: AtomicU64,
    partial_laps: AtomicU64,
    artifacts_written: AtomicU64,
    laps_persisted: AtomicU64,
    remote_failures: AtomicU64,
}

/// Plain copy of [`PipelineStats`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_queued: u64,
    pub frames_dropped: u64,
    /// Ticks with no frame or an adapter error while connected
    pub adapter_misses: u64,
    pub laps_completed: u64,
    pub partial_laps: u64,
    pub artifacts_written: u64,
    /// Laps written to the remote store
    pub laps_persisted: u64,
    pub remote_failures: u64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl PipelineStats {
    counter!(record_captured, frames_captured);
    counter!(record_queued, frames_queued);
    counter!(record_adapter_miss, adapter_misses);
    counter!(record_lap, laps_completed);
    counter!(record_partial_lap, partial_laps);
    counter!(record_artifact, artifacts_written);
    counter!(record_persisted, laps_persisted);
    counter!(record_remote_failure, remote_failures);

    /// Count a dropped frame; returns the new total.
    pub fn record_dropped(&self) -> u64 {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_queued: self.frames_queued.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            adapter_misses: self.adapter_misses.load(Ordering::Relaxed),
            laps_completed: self.laps_completed.load(Ordering::Relaxed),
            partial_laps: self.partial_laps.load(Ordering::Relaxed),
            artifacts_written: self.artifacts_written.load(Ordering::Relaxed),
            laps_persisted: self.laps_persisted.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = PipelineStats::default();
        stats.record_captured();
        stats.record_captured();
        stats.record_queued();
        assert_eq!(stats.record_dropped(), 1);
        assert_eq!(stats.record_dropped(), 2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_captured, 2);
        assert_eq!(snapshot.frames_queued, 1);
        assert_eq!(snapshot.frames_dropped, 2);
        assert_eq!(snapshot.laps_persisted, 0);
    }

    #[test]
    fn diagnostics_serialize_with_kind_tag() {
        let value = serde_json::to_value(Diagnostic::FramesDropped { since_last: 3, total: 10 })
            .unwrap();
        assert_eq!(value["kind"], "frames_dropped");
        assert_eq!(value["total"], 10);
    }
}
