//! Frame types flowing from the telemetry source through the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-corner channel values, ordered front-left, front-right, rear-left, rear-right.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Corners {
    pub fl: f32,
    pub fr: f32,
    pub rl: f32,
    pub rr: f32,
}

impl Corners {
    /// Build from an array in FL, FR, RL, RR order.
    pub const fn from_array(values: [f32; 4]) -> Self {
        Self { fl: values[0], fr: values[1], rl: values[2], rr: values[3] }
    }

    /// Values in FL, FR, RL, RR order.
    pub const fn to_array(self) -> [f32; 4] {
        [self.fl, self.fr, self.rl, self.rr]
    }
}

/// Named numeric channels sampled with every frame.
///
/// Missing channels default to zero; sources fill only what the simulator exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channels {
    /// Vehicle speed in m/s
    pub speed: f32,
    /// Throttle pedal, 0..1
    pub throttle: f32,
    /// Brake pedal, 0..1
    pub brake: f32,
    /// Clutch pedal, 0..1
    pub clutch: f32,
    /// Steering wheel angle in radians
    pub steering: f32,
    /// Engine speed in rev/min
    pub rpm: f32,
    /// -1 reverse, 0 neutral, 1.. forward gears
    pub gear: i32,
    /// Suspension deflection in metres
    pub suspension_travel: Corners,
    /// Tire carcass temperature in °C
    pub tire_temp: Corners,
    /// Tire pressure in kPa
    pub tire_pressure: Corners,
    /// Wheel rotation speed in rad/s
    pub wheel_speed: Corners,
}

/// One sample as delivered by a [`TelemetrySource`](crate::source::TelemetrySource).
///
/// This is the shape before the producer stamps capture time and sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawFrame {
    /// Position along the lap, 0.0 at start/finish
    pub track_fraction: f64,
    /// Monotonic seconds within the current session
    pub session_clock: f64,
    /// Lap counter reported by the simulator; may reset or jump
    pub lap_number: i32,
    /// Incremented by the simulator whenever the session document changes
    pub session_version: u32,
    /// Sampled channels
    pub channels: Channels,
}

impl RawFrame {
    /// Create a frame with only the timing fields set.
    pub fn new(track_fraction: f64, session_clock: f64, lap_number: i32) -> Self {
        Self { track_fraction, session_clock, lap_number, ..Self::default() }
    }

    /// Set the channels.
    pub fn with_channels(mut self, channels: Channels) -> Self {
        self.channels = channels;
        self
    }

    /// Set the session document version.
    pub fn with_session_version(mut self, version: u32) -> Self {
        self.session_version = version;
        self
    }
}

/// One sampled instant, immutable once created by the producer.
///
/// Frames are copied (not shared) into the circular buffer and the work queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// Producer-assigned sequence, strictly increasing in capture order
    pub sequence: u64,
    /// Wall-clock capture time
    pub captured_at: DateTime<Utc>,
    /// Position along the lap, normalized into [0, 1]
    pub track_fraction: f64,
    /// Monotonic seconds within the current session
    pub session_clock: f64,
    /// Lap counter reported by the simulator
    pub lap_number: i32,
    /// Session document version at capture time
    pub session_version: u32,
    /// Sampled channels
    pub channels: Channels,
}

impl TelemetryFrame {
    /// Stamp a raw frame.
    ///
    /// Returns `None` if the timing fields are not finite; the producer counts
    /// such samples as dropped adapter reads.
    pub fn from_raw(raw: RawFrame, sequence: u64, captured_at: DateTime<Utc>) -> Option<Self> {
        if !raw.session_clock.is_finite() {
            return None;
        }
        let track_fraction = normalize_track_fraction(raw.track_fraction)?;

        Some(Self {
            sequence,
            captured_at,
            track_fraction,
            session_clock: raw.session_clock,
            lap_number: raw.lap_number,
            session_version: raw.session_version,
            channels: raw.channels,
        })
    }

    /// Strip the producer stamps, e.g. to replay a recorded lap.
    pub fn to_raw(&self) -> RawFrame {
        RawFrame {
            track_fraction: self.track_fraction,
            session_clock: self.session_clock,
            lap_number: self.lap_number,
            session_version: self.session_version,
            channels: self.channels,
        }
    }
}

/// Bring a reported lap position into [0, 1].
///
/// Some sources report percent (0..100) rather than a fraction; values slightly
/// above 1.0 from float error wrap around. Negative positions (off-track,
/// in-garage) clamp to 0.0.
pub fn normalize_track_fraction(value: f64) -> Option<f64> {
    if !value.is_finite() {
        return None;
    }
    let normalized = if value < 0.0 {
        0.0
    } else if value <= 1.0 {
        value
    } else if value < 1.01 {
        value - 1.0
    } else if value <= 100.0 {
        value / 100.0
    } else {
        value % 1.0
    };
    Some(normalized)
}
