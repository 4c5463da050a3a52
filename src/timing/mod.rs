//! # Sector and Lap Timing
//!
//! Turns a stream of `(track_fraction, session_clock, lap_number)` samples
//! into per-lap sector splits.
//!
//! - [`SectorBoundaries`] holds the validated sector starts of one layout
//! - [`SectorTimingEngine`] detects sector and lap crossings, tracks best
//!   times and keeps a bounded lap history
//!
//! Sector durations are session-clock differences between consecutive
//! crossings, so time spent stationary inside a sector is counted. A lap's
//! total is the sum of its sector durations.
//!
//! ## Example
//!
//! ```rust
//! use laptrace::timing::{SectorBoundaries, SectorTimingEngine};
//!
//! let boundaries = SectorBoundaries::new(&[0.0, 0.33, 0.66]).unwrap();
//! let mut engine = SectorTimingEngine::with_boundaries(boundaries);
//!
//! assert!(engine.process_sample(0.00, 10.0, 1).is_none()); // anchors
//! assert!(engine.process_sample(0.40, 40.0, 1).is_none());
//! assert!(engine.process_sample(0.70, 70.0, 1).is_none());
//! let lap = engine.process_sample(0.01, 100.0, 2).unwrap();
//!
//! assert_eq!(lap.sector_times, vec![30.0, 30.0, 30.0]);
//! assert!(lap.is_valid);
//! ```

mod boundary;
mod engine;

pub use boundary::{SectorBoundaries, SectorBoundary};
pub use engine::{ClockRegression, SectorTimingEngine};
