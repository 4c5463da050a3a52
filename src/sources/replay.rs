//! Replay source for recorded laps and scripted sessions

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, trace};

use crate::Result;
use crate::persistence::LapArtifact;
use crate::source::TelemetrySource;
use crate::types::RawFrame;

/// Replays a fixed list of frames, one per `fetch_frame` call.
///
/// Pacing comes from the producer's tick; the replay only hands out the next
/// frame. Once the list is exhausted (and looping is off) the source reports
/// itself disconnected.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    frames: Vec<RawFrame>,
    position: usize,
    /// Session documents keyed by the first version they apply to
    layouts: BTreeMap<u32, String>,
    tick_rate: f64,
    looping: bool,
    connected: bool,
    refuse_connects: u32,
    connect_attempts: u32,
}

impl ReplaySource {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self {
            frames,
            position: 0,
            layouts: BTreeMap::new(),
            tick_rate: 60.0,
            looping: false,
            connected: false,
            refuse_connects: 0,
            connect_attempts: 0,
        }
    }

    /// Replay the frames of a saved lap artifact.
    pub fn from_artifact(path: impl AsRef<Path>) -> Result<Self> {
        let artifact = LapArtifact::read(path.as_ref())?;
        info!(
            path = %path.as_ref().display(),
            lap = artifact.metadata.lap_number,
            frames = artifact.frames.len(),
            "Opened lap artifact for replay"
        );
        Ok(Self::new(artifact.frames.iter().map(|frame| frame.to_raw()).collect()))
    }

    /// Serve `text` for session versions at or above `version`.
    pub fn with_layout(mut self, version: u32, text: impl Into<String>) -> Self {
        self.layouts.insert(version, text.into());
        self
    }

    pub fn with_tick_rate(mut self, hz: f64) -> Self {
        self.tick_rate = hz;
        self
    }

    /// Restart from the first frame when exhausted.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Fail the first `count` connect attempts.
    pub fn refuse_connects(mut self, count: u32) -> Self {
        self.refuse_connects = count;
        self
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.frames.len().saturating_sub(self.position)
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    fn exhausted(&self) -> bool {
        !self.looping && self.position >= self.frames.len()
    }
}

#[async_trait::async_trait]
impl TelemetrySource for ReplaySource {
    async fn connect(&mut self) -> bool {
        self.connect_attempts += 1;
        if self.refuse_connects > 0 {
            self.refuse_connects -= 1;
            debug!(remaining = self.refuse_connects, "Replay refusing connect");
            return false;
        }
        self.connected = !self.exhausted() && !self.frames.is_empty();
        self.connected
    }

    async fn is_connected(&mut self) -> bool {
        self.connected
    }

    async fn fetch_frame(&mut self) -> Result<Option<RawFrame>> {
        if !self.connected {
            return Ok(None);
        }

        if self.position >= self.frames.len() {
            if self.looping && !self.frames.is_empty() {
                self.position = 0;
            } else {
                debug!(frames = self.frames.len(), "Reached end of replay");
                self.connected = false;
                return Ok(None);
            }
        }

        let frame = self.frames[self.position];
        self.position += 1;
        trace!(position = self.position, total = self.frames.len(), "Replay frame");
        Ok(Some(frame))
    }

    async fn session_layout(&mut self, version: u32) -> Result<Option<String>> {
        Ok(self.layouts.range(..=version).next_back().map(|(_, text)| text.clone()))
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn tick_rate(&self) -> f64 {
        self.tick_rate
    }
}
