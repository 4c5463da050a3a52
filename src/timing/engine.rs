//! Sector and lap crossing detection

use std::collections::VecDeque;

use tracing::{debug, info, trace, warn};

use super::boundary::SectorBoundaries;
use crate::error::LayoutError;
use crate::layout::LayoutDocument;
use crate::types::{LapSectorRecord, ProgressSnapshot, SectorComparison, SectorTime};

/// Track-fraction wrap thresholds for the crossing and in-sector checks.
const CROSSING_WRAP_HIGH: f64 = 0.9;
const CROSSING_WRAP_LOW: f64 = 0.1;
const IN_SECTOR_WRAP_HIGH: f64 = 0.95;
const IN_SECTOR_WRAP_LOW: f64 = 0.05;
/// Fraction past which a lap with every sector recorded is considered done.
const NEAR_LINE: f64 = 0.8;

const DEFAULT_LAP_HISTORY: usize = 500;
const DEFAULT_SECTOR_HISTORY: usize = 5_000;

/// Outcome of a clock-regressed crossing, surfaced to the owning worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockRegression {
    pub sector_index: usize,
    pub entry_clock: f64,
    pub session_clock: f64,
}

/// Per-lap sector timing state machine.
///
/// Not thread-safe; owned and driven by a single worker. Every mutation goes
/// through [`update_layout`](Self::update_layout) or
/// [`process_sample`](Self::process_sample).
#[derive(Debug)]
pub struct SectorTimingEngine {
    boundaries: Option<SectorBoundaries>,
    layout_hash: Option<u64>,

    anchored: bool,
    lap_number: i32,
    current_sector: usize,
    sector_entry_clock: f64,
    last_clock: f64,
    prev_fraction: f64,
    in_progress: Vec<f64>,

    best_sector_times: Vec<Option<f64>>,
    best_lap_time: Option<f64>,
    completed_laps: VecDeque<LapSectorRecord>,
    sector_history: VecDeque<SectorTime>,
    lap_history_limit: usize,
    sector_history_limit: usize,

    last_regression: Option<ClockRegression>,
}

impl Default for SectorTimingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SectorTimingEngine {
    /// Engine with no layout; samples are ignored until one is loaded.
    pub fn new() -> Self {
        Self {
            boundaries: None,
            layout_hash: None,
            anchored: false,
            lap_number: 0,
            current_sector: 0,
            sector_entry_clock: 0.0,
            last_clock: 0.0,
            prev_fraction: 0.0,
            in_progress: Vec::new(),
            best_sector_times: Vec::new(),
            best_lap_time: None,
            completed_laps: VecDeque::new(),
            sector_history: VecDeque::new(),
            lap_history_limit: DEFAULT_LAP_HISTORY,
            sector_history_limit: DEFAULT_SECTOR_HISTORY,
            last_regression: None,
        }
    }

    /// Engine with a layout already applied.
    pub fn with_boundaries(boundaries: SectorBoundaries) -> Self {
        let mut engine = Self::new();
        engine.install(boundaries);
        engine
    }

    /// Cap how many completed laps and sector crossings are kept.
    pub fn with_history_limits(mut self, laps: usize, sectors: usize) -> Self {
        self.lap_history_limit = laps.max(1);
        self.sector_history_limit = sectors.max(1);
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.boundaries.is_some()
    }

    pub fn boundaries(&self) -> Option<&SectorBoundaries> {
        self.boundaries.as_ref()
    }

    /// Load sector boundaries from a raw session document.
    ///
    /// Byte-identical structured content is a no-op. On error the previous
    /// layout and all timing state are left untouched.
    pub fn update_layout(&mut self, raw: &str) -> Result<(), LayoutError> {
        let document = LayoutDocument::parse(raw)?;
        self.apply_layout(&document).map(|_| ())
    }

    /// Apply an already parsed document. Returns whether timing state was reset.
    pub fn apply_layout(&mut self, document: &LayoutDocument) -> Result<bool, LayoutError> {
        if self.layout_hash == Some(document.hash) {
            trace!(hash = document.hash, "Session layout unchanged");
            return Ok(false);
        }

        let boundaries = SectorBoundaries::from_layout(&document.layout)?;
        self.layout_hash = Some(document.hash);

        if self.boundaries.as_ref() == Some(&boundaries) {
            debug!(sectors = boundaries.len(), "Session document changed, sectors unchanged");
            return Ok(false);
        }

        info!(sectors = boundaries.len(), starts = ?boundaries.starts(), "Sector layout loaded");
        self.install(boundaries);
        Ok(true)
    }

    fn install(&mut self, boundaries: SectorBoundaries) {
        self.best_sector_times = vec![None; boundaries.len()];
        self.best_lap_time = None;
        self.boundaries = Some(boundaries);
        self.reset();
    }

    /// Drop in-progress sector state; best times and history are kept.
    pub fn reset(&mut self) {
        self.anchored = false;
        self.current_sector = 0;
        self.sector_entry_clock = 0.0;
        self.last_clock = 0.0;
        self.prev_fraction = 0.0;
        self.in_progress.clear();
    }

    /// Forget laps, sector history and best times (new session).
    pub fn clear_history(&mut self) {
        self.completed_laps.clear();
        self.sector_history.clear();
        self.best_sector_times.iter_mut().for_each(|best| *best = None);
        self.best_lap_time = None;
        self.reset();
        debug!("Sector timing history cleared");
    }

    /// Advance the state machine by one sample.
    ///
    /// Returns a record when a lap completes (valid) or is interrupted by a
    /// lap counter increase (partial, `is_valid == false`).
    pub fn process_sample(
        &mut self,
        track_fraction: f64,
        session_clock: f64,
        lap_number: i32,
    ) -> Option<LapSectorRecord> {
        let boundaries = self.boundaries.as_ref()?;
        let expected = boundaries.sector_for(track_fraction);
        let total = boundaries.len();

        if !self.anchored {
            self.anchor(expected, track_fraction, session_clock, lap_number);
            return None;
        }

        if lap_number < self.lap_number {
            info!(from = self.lap_number, to = lap_number, "Lap counter went backwards, resetting");
            self.reset();
            self.anchor(expected, track_fraction, session_clock, lap_number);
            return None;
        }

        let completed = if expected != self.current_sector {
            let left = self.current_sector;
            let duration = session_clock - self.sector_entry_clock;
            if duration < 0.0 {
                warn!(
                    sector = left,
                    entry_clock = self.sector_entry_clock,
                    session_clock,
                    "Negative sector duration, skipping crossing"
                );
                self.last_regression = Some(ClockRegression {
                    sector_index: left,
                    entry_clock: self.sector_entry_clock,
                    session_clock,
                });
                return None;
            }

            self.push_sector(left, duration, session_clock);
            self.current_sector = expected;
            self.sector_entry_clock = session_clock;

            self.crossing_completes_lap(track_fraction, session_clock, total)
        } else {
            self.in_sector_wrap(track_fraction, session_clock)
        };

        self.prev_fraction = track_fraction;
        self.last_clock = session_clock;

        if completed {
            let record = self.complete_lap(session_clock);
            self.lap_number = lap_number;
            return Some(record);
        }

        if lap_number > self.lap_number {
            let previous = self.lap_number;
            self.lap_number = lap_number;
            if !self.in_progress.is_empty() {
                let partial =
                    self.finalize_partial(previous, expected, track_fraction, session_clock);
                return Some(partial);
            }
        }

        None
    }

    fn anchor(&mut self, sector: usize, fraction: f64, clock: f64, lap_number: i32) {
        self.anchored = true;
        self.lap_number = lap_number;
        self.current_sector = sector;
        self.sector_entry_clock = clock;
        self.last_clock = clock;
        self.prev_fraction = fraction;
        debug!(sector, fraction, clock, lap = lap_number, "Sector timing anchored");
    }

    /// Lap completion conditions after a sector change, checked in order.
    fn crossing_completes_lap(&mut self, fraction: f64, clock: f64, total: usize) -> bool {
        let recorded = self.in_progress.len();

        if self.current_sector == 0 && recorded == total {
            trace!("Lap complete: back in first sector with every sector recorded");
            return true;
        }

        if self.prev_fraction > CROSSING_WRAP_HIGH
            && fraction < CROSSING_WRAP_LOW
            && recorded + 1 >= total
        {
            if recorded + 1 == total {
                let final_sector = clock - self.sector_entry_clock;
                if final_sector > 0.0 {
                    self.push_sector(total - 1, final_sector, clock);
                }
            }
            trace!("Lap complete: track fraction wrapped");
            return true;
        }

        if recorded == total && fraction > NEAR_LINE {
            trace!("Lap complete: every sector recorded near the line");
            return true;
        }

        false
    }

    /// Wrap across the line without a sector change.
    ///
    /// Only a single-sector layout keeps the same sector across the line, so
    /// the sector entered at the anchor or the previous wrap is closed here.
    fn in_sector_wrap(&mut self, fraction: f64, clock: f64) -> bool {
        if !(self.prev_fraction > IN_SECTOR_WRAP_HIGH && fraction < IN_SECTOR_WRAP_LOW) {
            return false;
        }

        let final_sector = clock - self.sector_entry_clock;
        if final_sector > 0.0 {
            self.push_sector(self.current_sector, final_sector, clock);
        }
        self.sector_entry_clock = clock;

        if self.in_progress.is_empty() {
            trace!("Track fraction wrapped with no sector time, lap not completed");
            return false;
        }
        trace!("Lap complete: track fraction wrapped inside a sector");
        true
    }

    fn push_sector(&mut self, index: usize, duration: f64, clock: f64) {
        self.in_progress.push(duration);

        if let Some(best) = self.best_sector_times.get_mut(index) {
            if best.is_none_or(|b| duration < b) {
                *best = Some(duration);
                debug!(sector = index, duration, "New best sector");
            }
        }

        if self.sector_history.len() == self.sector_history_limit {
            self.sector_history.pop_front();
        }
        self.sector_history.push_back(SectorTime {
            sector_index: index,
            duration,
            lap_number: self.lap_number,
            session_clock: clock,
        });
    }

    fn complete_lap(&mut self, clock: f64) -> LapSectorRecord {
        let sector_times = std::mem::take(&mut self.in_progress);
        let record = LapSectorRecord::new(self.lap_number, sector_times, clock, true);

        if self.best_lap_time.is_none_or(|best| record.total_time < best) {
            self.best_lap_time = Some(record.total_time);
            info!(lap = record.lap_number, lap_time = record.total_time, "New best lap");
        }

        info!(
            lap = record.lap_number,
            lap_time = record.total_time,
            sectors = ?record.sector_times,
            "Lap complete"
        );
        self.remember(record.clone());
        record
    }

    fn finalize_partial(
        &mut self,
        lap_number: i32,
        sector: usize,
        fraction: f64,
        clock: f64,
    ) -> LapSectorRecord {
        let mut times = std::mem::take(&mut self.in_progress);
        let pending = clock - self.sector_entry_clock;
        if pending > 0.0 {
            times.push(pending);
        }

        let record = LapSectorRecord::new(lap_number, times, clock, false);
        warn!(
            lap = lap_number,
            partial_time = record.total_time,
            sectors = record.sector_times.len(),
            "Lap interrupted, keeping partial record"
        );

        self.current_sector = sector;
        self.sector_entry_clock = clock;
        self.prev_fraction = fraction;
        self.remember(record.clone());
        record
    }

    fn remember(&mut self, record: LapSectorRecord) {
        if self.completed_laps.len() == self.lap_history_limit {
            self.completed_laps.pop_front();
        }
        self.completed_laps.push_back(record);
    }

    /// Read-only view of the in-progress state.
    pub fn get_progress(&self) -> ProgressSnapshot {
        let Some(boundaries) = self.boundaries.as_ref() else {
            return ProgressSnapshot::default();
        };

        ProgressSnapshot {
            is_initialized: true,
            current_sector: self.current_sector,
            total_sectors: boundaries.len(),
            elapsed_in_sector: if self.anchored {
                (self.last_clock - self.sector_entry_clock).max(0.0)
            } else {
                0.0
            },
            completed_sectors: self.in_progress.len(),
            current_lap_splits: self.in_progress.clone(),
            best_sector_times: self.best_sector_times.clone(),
            best_lap_time: self.best_lap_time,
        }
    }

    /// Up to `count` most recent lap records, oldest first.
    pub fn get_recent_laps(&self, count: usize) -> Vec<LapSectorRecord> {
        let skip = self.completed_laps.len().saturating_sub(count);
        self.completed_laps.iter().skip(skip).cloned().collect()
    }

    pub fn sector_history(&self) -> impl Iterator<Item = &SectorTime> {
        self.sector_history.iter()
    }

    /// Deltas of `record` against the stored best times.
    pub fn compare_to_best(&self, record: &LapSectorRecord) -> SectorComparison {
        let mut comparison = SectorComparison::default();

        for (i, &time) in record.sector_times.iter().enumerate() {
            let delta = self.best_sector_times.get(i).copied().flatten().map(|best| time - best);
            if delta.is_some_and(|d| d < 0.0) {
                comparison.sectors_improved += 1;
            }
            comparison.sector_deltas.push(delta);
        }

        if let Some(best) = self.best_lap_time {
            comparison.lap_delta = Some(record.total_time - best);
            comparison.is_best_lap = record.is_valid && record.total_time <= best;
        }

        comparison
    }

    /// The most recent rejected crossing, cleared on read.
    pub fn take_clock_regression(&mut self) -> Option<ClockRegression> {
        self.last_regression.take()
    }
}
