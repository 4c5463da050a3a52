//! Telemetry source contract

use crate::Result;
use crate::types::RawFrame;

/// Adapter over a simulator's telemetry API.
///
/// The producer owns its source and calls it from a single task. Sources
/// should return promptly: `fetch_frame` is called once per producer tick and
/// must not wait for new data.
///
/// Errors are never fatal to the pipeline. A failed `fetch_frame` counts as a
/// skipped tick, a failed `session_layout` is retried on the next tick.
#[async_trait::async_trait]
pub trait TelemetrySource: Send + 'static {
    /// Try to attach to the simulator. Returns whether it succeeded.
    async fn connect(&mut self) -> bool;

    /// Probe whether the simulator is still available.
    ///
    /// Called at most once per connection cache TTL.
    async fn is_connected(&mut self) -> bool;

    /// Latest sample, if one arrived since the previous call.
    ///
    /// - `Ok(Some(frame))` - new sample
    /// - `Ok(None)` - no new data this tick
    /// - `Err(e)` - adapter error; the tick is skipped
    async fn fetch_frame(&mut self) -> Result<Option<RawFrame>>;

    /// Raw session document for a given session version.
    ///
    /// Returned text may carry live-value noise after the structured part;
    /// the layout parser isolates it.
    async fn session_layout(&mut self, version: u32) -> Result<Option<String>>;

    /// Release native resources. Called once when the producer stops.
    async fn disconnect(&mut self);

    /// Native sampling rate of the source in Hz.
    fn tick_rate(&self) -> f64;
}
