//! Per-lap JSON artifacts on local disk
//!
//! ```text
//! <root>/<Track>_<Car>_<YYYYmmdd_HHMMSS>/lap_<NNN>_<secs>s.json
//! ```
//!
//! Files are created with `create_new`; an existing name gets a numeric
//! suffix rather than being overwritten.

use std::fs::{self, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TelemetryError};
use crate::types::TelemetryFrame;

/// Header written ahead of the frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapMetadata {
    pub lap_number: i32,
    /// Seconds
    pub lap_time: f64,
    pub point_count: usize,
    pub is_valid: bool,
    pub track_name: Option<String>,
    pub car_name: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub sector_times: Vec<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// One lap's full ordered frame list plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapArtifact {
    pub metadata: LapMetadata,
    pub frames: Vec<TelemetryFrame>,
}

impl LapArtifact {
    /// Deterministic file name from lap number and lap time.
    pub fn file_name(lap_number: i32, lap_time: f64) -> String {
        format!("lap_{lap_number:03}_{lap_time:.3}s.json")
    }

    /// Write into `dir` (created if missing) without overwriting anything.
    pub fn write_new(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| TelemetryError::file_error(dir.to_path_buf(), e))?;

        let base = Self::file_name(self.metadata.lap_number, self.metadata.lap_time);
        let stem = base.trim_end_matches(".json");

        let mut suffix = 0u32;
        loop {
            let name = if suffix == 0 { base.clone() } else { format!("{stem}_{suffix}.json") };
            let path = dir.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    let mut writer = BufWriter::new(file);
                    serde_json::to_writer(&mut writer, self)?;
                    writer.flush().map_err(|e| TelemetryError::file_error(path.clone(), e))?;
                    debug!(
                        path = %path.display(),
                        points = self.frames.len(),
                        "Lap artifact written"
                    );
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(TelemetryError::file_error(path, e)),
            }
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file =
            fs::File::open(path).map_err(|e| TelemetryError::file_error(path.to_path_buf(), e))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// Folder name for a recording session.
pub fn session_folder_name(track: &str, car: &str, started: DateTime<Utc>) -> String {
    format!("{}_{}_{}", sanitize(track), sanitize(car), started.format("%Y%m%d_%H%M%S"))
}

/// Spaces become underscores; path separators and reserved characters are dropped.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .filter(|c| {
            !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control()
        })
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();

    if cleaned.is_empty() { "Unknown".to_string() } else { cleaned }
}
