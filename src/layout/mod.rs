//! # Session Layout Documents
//!
//! The simulator publishes a session document describing the track, the
//! driver's car, the session list and the split-time sectors. It is iRacing's
//! session-info YAML, which is not always valid YAML and, depending on the
//! capture path, is followed by a fixed-width dump of live telemetry values.
//!
//! ## Pipeline
//!
//! ```text
//! raw text ──► isolate structured prefix ──► hash ──► preprocess ──► parse
//!                                              │                       │
//!                                              ▼                       ▼
//!                                     idempotency check        SessionLayout
//!                                                                      │
//!                                              ┌───────────────────────┤
//!                                              ▼                       ▼
//!                                      SectorBoundaries       SessionDescriptor
//! ```
//!
//! Only the subset of the document this crate needs is modelled; unknown keys
//! are ignored.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LayoutError, Result, TelemetryError};

pub mod extract;

pub use extract::{content_hash, isolate_structured_prefix, preprocess_session_yaml};

/// The modelled subset of a session document.
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
#[serde(default)]
pub struct SessionLayout {
    pub weekend_info: WeekendInfo,
    pub session_info: SessionInfoData,
    pub driver_info: Option<DriverInfo>,
    pub split_time_info: Option<SplitTimeInfo>,
}

/// Track and event identifiers.
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
#[serde(default)]
pub struct WeekendInfo {
    pub track_name: String,
    #[serde(rename = "TrackID")]
    pub track_id: Option<i64>,
    pub track_display_name: String,
    /// Named layout of the track; empty or absent for the base track
    pub track_config_name: Option<String>,
    #[serde(rename = "SessionID")]
    pub session_id: Option<i64>,
    #[serde(rename = "SubSessionID")]
    pub sub_session_id: Option<i64>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
#[serde(default)]
pub struct SessionInfoData {
    pub current_session_num: i32,
    pub sessions: Vec<Session>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
#[serde(default)]
pub struct Session {
    pub session_num: i32,
    /// "Practice", "Lone Qualify", "Race", "Offline Testing", ...
    pub session_type: String,
    pub session_name: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
#[serde(default)]
pub struct DriverInfo {
    /// Index of the player's car in `drivers`
    pub driver_car_idx: Option<i32>,
    #[serde(rename = "DriverUserID")]
    pub driver_user_id: Option<i64>,
    pub drivers: Vec<Driver>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
#[serde(default)]
pub struct Driver {
    pub car_idx: i32,
    pub user_name: Option<String>,
    #[serde(rename = "CarID")]
    pub car_id: Option<i64>,
    pub car_screen_name: Option<String>,
    pub car_path: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
#[serde(default)]
pub struct SplitTimeInfo {
    pub sectors: Option<Vec<Sector>>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
#[serde(default)]
pub struct Sector {
    pub sector_num: Option<i32>,
    /// Start of the sector as a fraction of the lap
    pub sector_start_pct: Option<f64>,
}

impl SessionLayout {
    /// Deserialize already-isolated structured text.
    pub fn parse(structured: &str) -> std::result::Result<Self, LayoutError> {
        let cleaned = preprocess_session_yaml(structured);
        serde_yaml_ng::from_str(&cleaned)
            .map_err(|e| LayoutError::Malformed { details: e.to_string() })
    }

    /// The player's entry in the driver list.
    pub fn player(&self) -> Option<&Driver> {
        let info = self.driver_info.as_ref()?;
        let idx = info.driver_car_idx?;
        info.drivers.iter().find(|driver| driver.car_idx == idx)
    }

    /// The session currently being driven.
    ///
    /// Falls back to the first listed session if `CurrentSessionNum` matches none.
    pub fn current_session(&self) -> Option<&Session> {
        let info = &self.session_info;
        info.sessions
            .iter()
            .find(|session| session.session_num == info.current_session_num)
            .or_else(|| info.sessions.first())
    }
}

/// A raw session document reduced to its structured prefix and parsed.
#[derive(Debug, Clone)]
pub struct LayoutDocument {
    /// Hash of the isolated structured text
    pub hash: u64,
    pub layout: SessionLayout,
}

impl LayoutDocument {
    /// Isolate, hash and parse a raw session document.
    pub fn parse(raw: &str) -> std::result::Result<Self, LayoutError> {
        let structured = isolate_structured_prefix(raw);
        if structured.trim().is_empty() {
            return Err(LayoutError::Empty);
        }

        let hash = content_hash(structured);
        let layout = SessionLayout::parse(structured)?;

        debug!(
            hash,
            raw_len = raw.len(),
            structured_len = structured.len(),
            "Parsed session layout document"
        );

        Ok(Self { hash, layout })
    }
}

/// Track reference as identified by the simulator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackRef {
    pub native_id: Option<i64>,
    pub name: String,
    /// `None` for the base track
    pub config: Option<String>,
}

/// Car reference as identified by the simulator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CarRef {
    pub native_id: Option<i64>,
    pub name: String,
}

/// Native session id used when the simulator has no id (offline testing).
pub const NO_NATIVE_ID: i64 = 0;

/// Everything the session resolver needs, extracted from one layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub track: TrackRef,
    pub car: CarRef,
    pub session_type: String,
    pub native_session_id: i64,
    pub native_sub_session_id: i64,
}

impl SessionDescriptor {
    /// Extract the session identity fields from a parsed layout.
    ///
    /// Fails if the layout names no track or no player car.
    pub fn from_layout(layout: &SessionLayout) -> Result<Self> {
        let weekend = &layout.weekend_info;

        let track_name = if weekend.track_display_name.trim().is_empty() {
            weekend.track_name.trim()
        } else {
            weekend.track_display_name.trim()
        };
        if track_name.is_empty() {
            return Err(TelemetryError::parse("session descriptor", "layout names no track"));
        }

        let player = layout.player().ok_or_else(|| {
            TelemetryError::parse("session descriptor", "layout has no player car entry")
        })?;
        let car_name = player
            .car_screen_name
            .as_deref()
            .or(player.car_path.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| TelemetryError::parse("session descriptor", "player car has no name"))?;

        let config = weekend
            .track_config_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        let session_type = layout
            .current_session()
            .map(|session| session.session_type.trim())
            .filter(|kind| !kind.is_empty())
            .unwrap_or("Unknown")
            .to_string();

        Ok(Self {
            track: TrackRef { native_id: weekend.track_id, name: track_name.to_string(), config },
            car: CarRef { native_id: player.car_id, name: car_name.to_string() },
            session_type,
            native_session_id: weekend.session_id.unwrap_or(NO_NATIVE_ID),
            native_sub_session_id: weekend.sub_session_id.unwrap_or(NO_NATIVE_ID),
        })
    }

    /// Whether the simulator supplied no native session id.
    pub fn is_offline(&self) -> bool {
        self.native_session_id == NO_NATIVE_ID
    }
}
