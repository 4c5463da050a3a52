//! Producer loop: one frame per tick from the source into buffer and queue
//!
//! The producer owns the [`TelemetrySource`]. Each tick it
//!
//! 1. asks the [`ConnectionManager`] whether the source is usable,
//! 2. fetches at most one frame and stamps it,
//! 3. pushes a copy into the circular buffer,
//! 4. offers the frame to the bounded work queue without waiting.
//!
//! A full queue drops the frame for the queue path only. Nothing on this
//! path waits for a consumer, and every source call is bounded by the
//! configured source timeout.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::buffer::BufferHandle;
use crate::config::PipelineConfig;
use crate::connection::{ConnectionManager, ConnectionState, ConnectionTransition};
use crate::diagnostics::{Diagnostic, PipelineEvent, PipelineStats};
use crate::error::{Result, TelemetryError};
use crate::source::TelemetrySource;
use crate::types::TelemetryFrame;

/// Items carried by the work queue, in capture order.
#[derive(Debug, Clone)]
pub enum WorkItem {
    Frame(TelemetryFrame),
    /// Raw session document for a new session version
    SessionInfo { version: u32, text: Arc<str> },
}

/// What one producer tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Source unavailable; the loop slows down
    Disconnected,
    /// Connected but no usable frame this tick
    Idle,
    /// Frame captured; `queued` is false when the queue path dropped it
    Captured { queued: bool },
}

/// Tokio's clock as a std instant, so paused test time applies.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn bounded<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    timeout(limit, call).await.unwrap_or(Err(TelemetryError::Timeout { duration: limit }))
}

pub struct Producer<S> {
    source: S,
    config: Arc<PipelineConfig>,
    connection: Arc<ConnectionManager>,
    buffer: BufferHandle,
    queue: mpsc::Sender<WorkItem>,
    events: broadcast::Sender<PipelineEvent>,
    stats: Arc<PipelineStats>,
    monitor: FrequencyMonitor,
    sequence: u64,
    last_version: Option<u32>,
}

impl<S: TelemetrySource> Producer<S> {
    pub fn new(
        source: S,
        config: Arc<PipelineConfig>,
        connection: Arc<ConnectionManager>,
        buffer: BufferHandle,
        queue: mpsc::Sender<WorkItem>,
        events: broadcast::Sender<PipelineEvent>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let monitor = FrequencyMonitor::new(Arc::clone(&config), now());
        Self {
            source,
            config,
            connection,
            buffer,
            queue,
            events,
            stats,
            monitor,
            sequence: 0,
            last_version: None,
        }
    }

    /// Tick until cancelled, then release the source and hand it back.
    pub async fn run(mut self, cancel: CancellationToken) -> S {
        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target_hz = self.config.target_hz, "Producer started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.tick().await == TickOutcome::Disconnected {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sleep(self.config.disconnected_poll()) => {}
                }
            }
        }

        let limit = self.config.source_timeout();
        if timeout(limit, self.source.disconnect()).await.is_err() {
            warn!(timeout = ?limit, "Telemetry source did not release in time");
        }
        info!(frames = self.sequence, dropped = self.stats.frames_dropped(), "Producer stopped");
        self.source
    }

    /// One producer iteration.
    pub async fn tick(&mut self) -> TickOutcome {
        let now = now();
        if !self.ensure_connected(now).await {
            return TickOutcome::Disconnected;
        }

        let limit = self.config.source_timeout();
        let outcome = match bounded(limit, self.source.fetch_frame()).await {
            Ok(Some(raw)) => match TelemetryFrame::from_raw(raw, self.sequence, Utc::now()) {
                Some(frame) => TickOutcome::Captured { queued: self.capture(frame, now).await },
                None => {
                    trace!("Discarding frame with non-finite timing fields");
                    self.stats.record_adapter_miss();
                    TickOutcome::Idle
                }
            },
            Ok(None) => {
                self.stats.record_adapter_miss();
                TickOutcome::Idle
            }
            Err(e) => {
                trace!(error = %e, "Adapter read failed, skipping tick");
                self.stats.record_adapter_miss();
                TickOutcome::Idle
            }
        };

        for diagnostic in self.monitor.poll(now, &self.buffer, self.stats.frames_dropped()) {
            self.publish(PipelineEvent::Diagnostic(diagnostic));
        }
        outcome
    }

    async fn capture(&mut self, frame: TelemetryFrame, now: Instant) -> bool {
        self.sequence += 1;
        self.stats.record_captured();
        self.monitor.record(now);

        // The document goes ahead of the first frame that carries its version
        self.offer_session_info(frame.session_version).await;

        self.buffer.push(frame.clone());
        match self.offer(WorkItem::Frame(frame)) {
            Ok(()) => {
                self.stats.record_queued();
                true
            }
            Err(TelemetryError::QueueFull { .. }) => {
                let total = self.stats.record_dropped();
                trace!(total, "Work queue full, frame dropped");
                false
            }
            Err(e) => {
                trace!(error = %e, "Frame not queued");
                false
            }
        }
    }

    /// Offer an item to the work queue without waiting.
    pub fn offer(&self, item: WorkItem) -> Result<()> {
        self.queue.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TelemetryError::QueueFull { queue: "work", capacity: self.queue.max_capacity() }
            }
            mpsc::error::TrySendError::Closed(_) => {
                TelemetryError::ChannelClosed { channel: "work" }
            }
        })
    }

    async fn offer_session_info(&mut self, version: u32) {
        if self.last_version == Some(version) {
            return;
        }

        let limit = self.config.source_timeout();
        match bounded(limit, self.source.session_layout(version)).await {
            Ok(Some(text)) => {
                let item = WorkItem::SessionInfo { version, text: Arc::from(text) };
                match self.offer(item) {
                    Ok(()) => {
                        debug!(previous = ?self.last_version, version, "Session version changed");
                        self.last_version = Some(version);
                    }
                    // Retried on the next tick
                    Err(TelemetryError::QueueFull { .. }) => {
                        debug!(version, "Work queue full, session document deferred");
                    }
                    Err(e) => {
                        trace!(version, error = %e, "Session document not queued");
                        self.last_version = Some(version);
                    }
                }
            }
            Ok(None) => {
                debug!(version, "No session document for version");
                self.last_version = Some(version);
            }
            Err(e) => debug!(version, error = %e, "Session document unavailable, will retry"),
        }
    }

    async fn ensure_connected(&mut self, now: Instant) -> bool {
        if let Some(connected) = self.connection.cached_state(now) {
            return connected;
        }

        let limit = self.config.source_timeout();
        if self.connection.state() == ConnectionState::Connected {
            let alive = timeout(limit, self.source.is_connected()).await.unwrap_or(false);
            let transition = self.connection.record_check(alive, now);
            self.publish_transition(transition);
            if !alive {
                warn!("Telemetry source lost");
            }
            return alive;
        }

        if !self.connection.should_attempt_at(now) {
            return false;
        }
        let transition = self.connection.begin_attempt(now);
        self.publish_transition(transition);

        let connected = match self.connect_source(limit).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Connect attempt failed");
                false
            }
        };
        let transition = self.connection.record_result_at(connected, now);
        self.publish_transition(transition);

        if connected {
            info!(tick_rate = self.source.tick_rate(), "Telemetry source connected");
            self.monitor.reset(now);
        }
        connected
    }

    async fn connect_source(&mut self, limit: Duration) -> Result<()> {
        match timeout(limit, self.source.connect()).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TelemetryError::connection_failed("source refused connection")),
            Err(_) => Err(TelemetryError::Timeout { duration: limit }),
        }
    }

    fn publish_transition(&self, transition: Option<ConnectionTransition>) {
        if let Some(transition) = transition {
            self.publish(PipelineEvent::Diagnostic(Diagnostic::ConnectionTransition(transition)));
        }
    }

    fn publish(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }
}

/// Achieved sampling rate over a rolling window, and buffer sizing from it.
#[derive(Debug)]
pub struct FrequencyMonitor {
    config: Arc<PipelineConfig>,
    samples: VecDeque<Instant>,
    started: Instant,
    last_report: Instant,
    last_resize: Instant,
    dropped_reported: u64,
}

impl FrequencyMonitor {
    pub fn new(config: Arc<PipelineConfig>, now: Instant) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
            started: now,
            last_report: now,
            last_resize: now,
            dropped_reported: 0,
        }
    }

    fn window(&self) -> Duration {
        self.config.frequency_report_interval()
    }

    /// Start a fresh window, e.g. after a reconnect.
    pub fn reset(&mut self, now: Instant) {
        self.samples.clear();
        self.started = now;
        self.last_report = now;
    }

    pub fn record(&mut self, now: Instant) {
        self.samples.push_back(now);
        let window = self.window();
        while self.samples.front().is_some_and(|&t| now.saturating_duration_since(t) > window) {
            self.samples.pop_front();
        }
    }

    /// Frames per second over the window, or since the start if shorter.
    pub fn achieved_hz(&self, now: Instant) -> Option<f64> {
        let span = now.saturating_duration_since(self.started).min(self.window()).as_secs_f64();
        (span > 0.0).then(|| self.samples.len() as f64 / span)
    }

    /// Periodic reports and buffer resizing. Returns the diagnostics to publish.
    pub fn poll(
        &mut self,
        now: Instant,
        buffer: &BufferHandle,
        dropped_total: u64,
    ) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        if now.saturating_duration_since(self.last_report) < self.window() {
            return diagnostics;
        }
        self.last_report = now;

        let Some(achieved_hz) = self.achieved_hz(now) else {
            return diagnostics;
        };
        let target_hz = self.config.target_hz;
        trace!(achieved_hz, target_hz, "Frequency report");
        diagnostics.push(Diagnostic::FrequencyReport { achieved_hz, target_hz });

        if achieved_hz < target_hz * self.config.low_frequency_ratio {
            debug!(achieved_hz, target_hz, "Sampling below target");
            diagnostics.push(Diagnostic::LowFrequency {
                achieved_hz,
                target_hz,
                ratio: achieved_hz / target_hz,
            });
        }

        let since_last = dropped_total.saturating_sub(self.dropped_reported);
        if since_last > 0 {
            self.dropped_reported = dropped_total;
            diagnostics.push(Diagnostic::FramesDropped { since_last, total: dropped_total });
        }

        if now.saturating_duration_since(self.last_resize) >= self.config.buffer_resize_interval() {
            self.last_resize = now;
            let from = buffer.capacity();
            let to = self.config.buffer_capacity_for(achieved_hz);
            let change = (to as f64 - from as f64).abs() / from.max(1) as f64;

            if change > self.config.buffer_resize_threshold {
                buffer.resize(to);
                info!(from, to, achieved_hz, "Telemetry buffer resized");
                diagnostics.push(Diagnostic::BufferResized { from, to, achieved_hz });
            }
        }

        diagnostics
    }
}
