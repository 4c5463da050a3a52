//! Core data types shared across the pipeline.
//!
//! - [`RawFrame`] is what a telemetry source hands the producer
//! - [`TelemetryFrame`] is the stamped, immutable sample that flows to the
//!   circular buffer and the work queue
//! - [`LapSectorRecord`] is the timing engine's per-lap output
//! - [`ProgressSnapshot`] is a read-only view of in-progress timing state
//! - [`UpdateRate`] controls how often observers see frames
//!
//! ## Usage Example
//!
//! ```rust
//! use laptrace::types::{Channels, RawFrame, TelemetryFrame};
//! use chrono::Utc;
//!
//! let raw = RawFrame::new(0.42, 118.5, 3).with_channels(Channels {
//!     speed: 61.0,
//!     throttle: 1.0,
//!     gear: 5,
//!     ..Channels::default()
//! });
//!
//! let frame = TelemetryFrame::from_raw(raw, 0, Utc::now()).unwrap();
//! assert_eq!(frame.lap_number, 3);
//! ```

mod frame;
mod lap;
mod update_rate;

pub use frame::{Channels, Corners, RawFrame, TelemetryFrame, normalize_track_fraction};
pub use lap::{LapSectorRecord, ProgressSnapshot, SectorComparison, SectorTime};
pub use update_rate::UpdateRate;
