//! Synthetic session documents, laps and frames for tests and benches

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::pending;

use crate::error::StoreError;
use crate::layout::{CarRef, SessionDescriptor, TrackRef};
use crate::session::{
    CarId, LapId, NewLap, NewSession, SessionFilter, SessionId, SessionStore, TrackId,
};
use crate::types::{Channels, RawFrame, TelemetryFrame};

/// Session document for Laguna Seca in an MX-5, sectors starting at `starts`.
pub fn layout_document(starts: &[f64]) -> String {
    let mut doc = String::from(
        "WeekendInfo:
 TrackName: lagunaseca
 TrackID: 47
 TrackDisplayName: WeatherTech Raceway Laguna Seca
 TrackConfigName:
 SessionID: 0
 SubSessionID: 0

SessionInfo:
 CurrentSessionNum: 0
 Sessions:
 - SessionNum: 0
   SessionType: Offline Testing
   SessionName: TESTING

DriverInfo:
 DriverCarIdx: 0
 DriverUserID: 123456
 Drivers:
 - CarIdx: 0
   UserName: Test Driver
   CarID: 67
   CarScreenName: Mazda MX-5 Cup
   CarPath: mx5 mx52016

SplitTimeInfo:
 Sectors:
",
    );
    for (index, start) in starts.iter().enumerate() {
        let _ = writeln!(doc, " - SectorNum: {index}");
        let _ = writeln!(doc, "   SectorStartPct: {start:.6}");
    }
    doc
}

/// [`layout_document`] followed by a fixed-width live value dump.
pub fn noisy_layout_document(starts: &[f64]) -> String {
    let mut doc = layout_document(starts);
    doc.push_str("Speed                         42.718\n");
    doc.push_str("Throttle                      0.935\n");
    doc.push_str("CarIdxLapDistPct              0.412  0.388  -1.000\n");
    doc
}

/// `count` samples evenly spaced from `start` to `end` inclusive, with the
/// clock advancing by `step` per sample.
pub fn lap_samples(
    start: f64,
    end: f64,
    count: usize,
    clock_start: f64,
    step: f64,
    lap: i32,
) -> Vec<(f64, f64, i32)> {
    let span = (count.max(2) - 1) as f64;
    (0..count)
        .map(|i| {
            let fraction = start + (end - start) * i as f64 / span;
            (fraction, clock_start + step * i as f64, lap)
        })
        .collect()
}

/// `laps` consecutive laps of `points` raw frames each, lasting `lap_secs`.
///
/// Laps are numbered from 1; the counter increments on the first sample of
/// each lap, at fraction 0.0.
pub fn synthetic_laps(laps: usize, points: usize, lap_secs: f64) -> Vec<RawFrame> {
    let step = lap_secs / points as f64;
    (0..laps)
        .flat_map(|lap| {
            (0..points).map(move |i| {
                let fraction = i as f64 / points as f64;
                let clock = (lap * points + i) as f64 * step;
                RawFrame::new(fraction, clock, lap as i32 + 1).with_channels(channels_at(fraction))
            })
        })
        .collect()
}

/// Plausible driving inputs for a position on the lap.
fn channels_at(fraction: f64) -> Channels {
    let phase = (fraction * std::f64::consts::TAU * 4.0).sin() as f32;
    Channels {
        speed: 40.0 + 15.0 * phase,
        throttle: phase.max(0.0),
        brake: (-phase).max(0.0),
        rpm: 5_500.0 + 1_200.0 * phase,
        gear: if phase > 0.0 { 4 } else { 3 },
        ..Channels::default()
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap_or_default()
}

/// Frame `seq` of a 60 Hz capture starting at a fixed instant.
pub fn frame_at(seq: u64, fraction: f64) -> TelemetryFrame {
    let offset = chrono::Duration::nanoseconds((seq as i64) * 1_000_000_000 / 60);
    TelemetryFrame {
        sequence: seq,
        captured_at: epoch() + offset,
        track_fraction: fraction,
        session_clock: seq as f64 / 60.0,
        lap_number: 1,
        session_version: 0,
        channels: channels_at(fraction),
    }
}

/// Offline testing session at Laguna Seca in the given car.
pub fn descriptor(car_name: &str, car_native_id: i64) -> SessionDescriptor {
    SessionDescriptor {
        track: TrackRef {
            native_id: Some(47),
            name: "WeatherTech Raceway Laguna Seca".to_string(),
            config: None,
        },
        car: CarRef { native_id: Some(car_native_id), name: car_name.to_string() },
        session_type: "Offline Testing".to_string(),
        native_session_id: 0,
        native_sub_session_id: 0,
    }
}

/// A [`SessionStore`] whose calls never complete.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentStore;

#[async_trait::async_trait]
impl SessionStore for SilentStore {
    async fn find_session(
        &self,
        _filter: &SessionFilter,
        _window: Duration,
    ) -> Result<Option<SessionId>, StoreError> {
        pending().await
    }

    async fn create_session(&self, _session: &NewSession) -> Result<SessionId, StoreError> {
        pending().await
    }

    async fn create_lap(&self, _lap: &NewLap) -> Result<LapId, StoreError> {
        pending().await
    }

    async fn find_or_create_track(&self, _track: &TrackRef) -> Result<TrackId, StoreError> {
        pending().await
    }

    async fn find_or_create_car(&self, _car: &CarRef) -> Result<CarId, StoreError> {
        pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lap_samples_are_inclusive() {
        let samples = lap_samples(0.0, 0.99, 100, 10.0, 0.5, 2);
        assert_eq!(samples.len(), 100);
        assert_eq!(samples[0], (0.0, 10.0, 2));
        assert!((samples[99].0 - 0.99).abs() < 1e-12);
        assert!((samples[99].1 - 59.5).abs() < 1e-12);
    }

    #[test]
    fn synthetic_laps_increment_counter_at_line() {
        let frames = synthetic_laps(2, 10, 20.0);
        assert_eq!(frames.len(), 20);
        assert_eq!(frames[9].lap_number, 1);
        assert_eq!(frames[10].lap_number, 2);
        assert_eq!(frames[10].track_fraction, 0.0);
        assert!((frames[10].session_clock - 20.0).abs() < 1e-9);
    }
}
