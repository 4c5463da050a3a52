//! Coarse lap boundary detection from raw track position
//!
//! Used while no sector layout is loaded, so raw laps can still be written
//! before the session is known. Three heuristics, any one ends the lap:
//!
//! - threshold: position drops from above 0.85 to below 0.15
//! - pattern: recent history is high positions followed by low positions
//! - jump: a single-sample drop larger than 0.7
//!
//! Pattern and jump also require a minimum time since the last boundary.

use std::collections::VecDeque;

use serde::Serialize;

const HIGH: f64 = 0.85;
const LOW: f64 = 0.15;
const JUMP: f64 = 0.7;
const HISTORY: usize = 10;
/// Trailing samples that must all be low for the pattern heuristic.
const PATTERN_TAIL: usize = 3;

/// Which heuristic closed a lap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LapTrigger {
    Threshold,
    Pattern,
    Jump,
}

/// A detected lap boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RawLapBoundary {
    /// Lap that just ended, counted from 1 by the detector
    pub lap_number: i32,
    /// Session-clock seconds since the previous boundary
    pub duration: f64,
    pub trigger: LapTrigger,
}

#[derive(Debug, Clone)]
pub struct RawLapDetector {
    history: VecDeque<f64>,
    previous: Option<f64>,
    lap_started_at: Option<f64>,
    laps: i32,
    min_lap_secs: f64,
}

impl RawLapDetector {
    pub fn new(min_lap_secs: f64) -> Self {
        Self {
            history: VecDeque::with_capacity(HISTORY),
            previous: None,
            lap_started_at: None,
            laps: 0,
            min_lap_secs,
        }
    }

    /// Feed one sample. Returns the boundary when a lap ends on it.
    pub fn observe(&mut self, fraction: f64, session_clock: f64) -> Option<RawLapBoundary> {
        let started = *self.lap_started_at.get_or_insert(session_clock);
        let elapsed = session_clock - started;

        if self.history.len() == HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(fraction);

        let trigger = self.previous.and_then(|previous| {
            if previous > HIGH && fraction < LOW {
                Some(LapTrigger::Threshold)
            } else if elapsed < self.min_lap_secs {
                None
            } else if self.high_then_low() {
                Some(LapTrigger::Pattern)
            } else if previous - fraction > JUMP {
                Some(LapTrigger::Jump)
            } else {
                None
            }
        });
        self.previous = Some(fraction);

        let trigger = trigger?;
        self.laps += 1;
        self.lap_started_at = Some(session_clock);
        self.history.clear();
        self.history.push_back(fraction);

        Some(RawLapBoundary { lap_number: self.laps, duration: elapsed, trigger })
    }

    fn high_then_low(&self) -> bool {
        if self.history.len() <= PATTERN_TAIL {
            return false;
        }
        let split = self.history.len() - PATTERN_TAIL;
        let (head, tail) = (self.history.range(..split), self.history.range(split..));
        head.clone().any(|&f| f > HIGH) && tail.clone().all(|&f| f < LOW)
    }

    /// Laps detected so far.
    pub fn laps(&self) -> i32 {
        self.laps
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.min_lap_secs);
    }
}
