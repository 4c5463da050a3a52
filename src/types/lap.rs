//! Lap and sector timing records

use serde::{Deserialize, Serialize};

/// One completed lap's sector splits.
///
/// Created by the sector timing engine when a lap completes, never mutated
/// afterwards. Laps finalized by an interruption (reset, lap counter jump)
/// are kept with `is_valid == false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapSectorRecord {
    /// Lap counter at the time the lap was being driven
    pub lap_number: i32,
    /// Sector durations in seconds, in sector order
    pub sector_times: Vec<f64>,
    /// Sum of `sector_times`
    pub total_time: f64,
    /// Session clock at which the lap was finalized
    pub completed_at: f64,
    /// False for partial laps
    pub is_valid: bool,
}

impl LapSectorRecord {
    /// Build a record whose total is the sum of its sector durations.
    pub fn new(lap_number: i32, sector_times: Vec<f64>, completed_at: f64, is_valid: bool) -> Self {
        let total_time = sector_times.iter().sum();
        Self { lap_number, sector_times, total_time, completed_at, is_valid }
    }
}

/// A single sector crossing kept in the engine's history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectorTime {
    pub sector_index: usize,
    pub duration: f64,
    pub lap_number: i32,
    /// Session clock at which the sector was left
    pub session_clock: f64,
}

/// Read-only view of the engine's in-progress state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Whether a sector layout has been loaded
    pub is_initialized: bool,
    /// 0-based index of the sector currently being driven
    pub current_sector: usize,
    pub total_sectors: usize,
    /// Seconds spent in the current sector so far
    pub elapsed_in_sector: f64,
    /// Number of sectors completed on the current lap
    pub completed_sectors: usize,
    /// Durations completed on the current lap
    pub current_lap_splits: Vec<f64>,
    pub best_sector_times: Vec<Option<f64>>,
    pub best_lap_time: Option<f64>,
}

/// Deltas of a lap against the engine's best times.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectorComparison {
    /// Per-sector delta to the best time; `None` where no best exists yet
    pub sector_deltas: Vec<Option<f64>>,
    /// Number of sectors faster than the stored best
    pub sectors_improved: usize,
    pub lap_delta: Option<f64>,
    pub is_best_lap: bool,
}
