//! Consumer workers
//!
//! Two long-lived tasks sit behind the producer:
//!
//! - [`TimingWorker`] pops the work queue and is the single owner of the
//!   [`SectorTimingEngine`]. It applies session documents, batches frames
//!   per lap and publishes observer events. Session resolution runs on a
//!   spawned task so a slow store never delays timing.
//! - [`PersistenceWorker`] receives finished laps and runs the [`LapWriter`].
//!
//! Both block on their queue with a timeout and check the shutdown token
//! each time the timeout expires.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::PipelineConfig;
use crate::diagnostics::{Diagnostic, PipelineEvent, PipelineStats};
use crate::error::Result;
use crate::layout::{LayoutDocument, SessionDescriptor};
use crate::persistence::{LapWriter, PersistJob, RawLapDetector};
use crate::producer::WorkItem;
use crate::session::{Resolution, SessionId, SessionIdentity, SessionResolver};
use crate::timing::SectorTimingEngine;
use crate::types::{ProgressSnapshot, TelemetryFrame};

/// Channels the timing worker publishes on.
#[derive(Clone)]
pub struct TimingOutputs {
    pub events: broadcast::Sender<PipelineEvent>,
    pub latest_frame: watch::Sender<Option<Arc<TelemetryFrame>>>,
    pub progress: watch::Sender<ProgressSnapshot>,
    pub persist: mpsc::Sender<PersistJob>,
}

type ResolveTask = JoinHandle<Result<(Resolution, Arc<SessionIdentity>)>>;

pub struct TimingWorker {
    config: Arc<PipelineConfig>,
    engine: SectorTimingEngine,
    detector: RawLapDetector,
    resolver: Arc<SessionResolver>,
    descriptor: Option<Arc<SessionDescriptor>>,
    resolution: Option<ResolveTask>,
    /// Session the engine's history belongs to
    session_id: Option<SessionId>,
    resolve_retry_at: Option<Instant>,
    lap_frames: VecDeque<TelemetryFrame>,
    outputs: TimingOutputs,
    stats: Arc<PipelineStats>,
}

impl TimingWorker {
    pub fn new(
        config: Arc<PipelineConfig>,
        resolver: Arc<SessionResolver>,
        outputs: TimingOutputs,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let detector = RawLapDetector::new(config.persistence.raw_lap_min_secs);
        Self {
            config,
            engine: SectorTimingEngine::new(),
            detector,
            resolver,
            descriptor: None,
            resolution: None,
            session_id: None,
            resolve_retry_at: None,
            lap_frames: VecDeque::new(),
            outputs,
            stats,
        }
    }

    /// Pop until the queue closes or shutdown is observed on an idle pop.
    pub async fn run(mut self, mut queue: mpsc::Receiver<WorkItem>, cancel: CancellationToken) {
        info!("Timing worker started");
        let pop_timeout = self.config.pop_timeout();

        loop {
            match timeout(pop_timeout, queue.recv()).await {
                Ok(Some(item)) => self.handle(item).await,
                Ok(None) => {
                    debug!("Work queue closed");
                    break;
                }
                Err(_) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                }
            }
            self.poll_resolution().await;
            self.retry_resolution_if_due();
        }

        if let Some(task) = self.resolution.take() {
            task.abort();
        }
        info!(
            laps = self.engine.get_recent_laps(usize::MAX).len(),
            unsent_frames = self.lap_frames.len(),
            "Timing worker stopped"
        );
        // Dropping `self` closes the persistence channel
    }

    pub async fn handle(&mut self, item: WorkItem) {
        match item {
            WorkItem::Frame(frame) => self.on_frame(frame).await,
            WorkItem::SessionInfo { version, text } => self.on_session_info(version, &text).await,
        }
    }

    async fn on_session_info(&mut self, version: u32, text: &str) {
        let document = match LayoutDocument::parse(text) {
            Ok(document) => document,
            Err(e) => {
                warn!(version, error = %e, "Session document rejected, keeping previous layout");
                self.publish(PipelineEvent::Diagnostic(Diagnostic::LayoutRejected {
                    reason: e.to_string(),
                }));
                return;
            }
        };

        match self.engine.apply_layout(&document) {
            Ok(true) => {
                let sectors = self.engine.boundaries().map_or(0, |b| b.len());
                self.detector.reset();
                self.publish(PipelineEvent::LayoutLoaded { sectors });
            }
            Ok(false) => trace!(version, "Sector layout unchanged"),
            Err(e) => {
                warn!(version, error = %e, "Sector layout rejected, keeping previous layout");
                self.publish(PipelineEvent::Diagnostic(Diagnostic::LayoutRejected {
                    reason: e.to_string(),
                }));
            }
        }

        match SessionDescriptor::from_layout(&document.layout) {
            Ok(descriptor) => {
                self.descriptor = Some(Arc::new(descriptor));
                self.start_resolution().await;
            }
            Err(e) => debug!(version, error = %e, "Session document carries no session identity"),
        }
    }

    async fn on_frame(&mut self, frame: TelemetryFrame) {
        if self.lap_frames.back().is_some_and(|last| last.lap_number > frame.lap_number) {
            debug!(
                discarded = self.lap_frames.len(),
                lap = frame.lap_number,
                "Lap counter went backwards, discarding lap frames"
            );
            self.lap_frames.clear();
        }

        if self.engine.is_initialized() {
            self.time_sectors(&frame).await;
        } else {
            self.detect_raw_lap(&frame).await;
        }

        if self.lap_frames.len() >= self.config.buffer_max_capacity {
            self.lap_frames.pop_front();
        }
        self.lap_frames.push_back(frame.clone());

        self.outputs.latest_frame.send_replace(Some(Arc::new(frame)));
    }

    async fn time_sectors(&mut self, frame: &TelemetryFrame) {
        let record =
            self.engine.process_sample(frame.track_fraction, frame.session_clock, frame.lap_number);

        if let Some(regression) = self.engine.take_clock_regression() {
            self.publish(PipelineEvent::Diagnostic(Diagnostic::ClockRegression {
                sector_index: regression.sector_index,
                entry_clock: regression.entry_clock,
                session_clock: regression.session_clock,
            }));
        }

        if let Some(record) = record {
            if record.is_valid {
                self.stats.record_lap();
            } else {
                self.stats.record_partial_lap();
            }
            let comparison = self.engine.compare_to_best(&record);
            debug!(
                lap = record.lap_number,
                total = record.total_time,
                valid = record.is_valid,
                best = comparison.is_best_lap,
                "Lap completed"
            );

            let frames = self.take_lap_frames();
            let job = PersistJob::from_record(&record, frames, self.descriptor.as_deref())
                .with_session(self.lap_session());
            self.publish(PipelineEvent::LapCompleted { record, comparison });
            self.send_job(job).await;
        }

        self.outputs.progress.send_replace(self.engine.get_progress());
    }

    async fn detect_raw_lap(&mut self, frame: &TelemetryFrame) {
        let Some(boundary) = self.detector.observe(frame.track_fraction, frame.session_clock) else {
            return;
        };

        let lap_number = self
            .lap_frames
            .back()
            .map(|last| last.lap_number)
            .filter(|&lap| lap > 0)
            .unwrap_or(boundary.lap_number);
        let frames = self.take_lap_frames();
        self.stats.record_lap();
        debug!(
            lap = lap_number,
            points = frames.len(),
            trigger = ?boundary.trigger,
            "Raw lap detected"
        );

        self.publish(PipelineEvent::RawLapDetected {
            lap_number,
            point_count: frames.len(),
            duration: boundary.duration,
        });
        let context = self.descriptor.as_deref();
        let job = PersistJob::from_raw(lap_number, boundary.duration, frames, context)
            .with_session(self.lap_session());
        self.send_job(job).await;
    }

    /// The active identity, if it belongs to the context the lap was driven in.
    fn lap_session(&self) -> Option<Arc<SessionIdentity>> {
        let descriptor = self.descriptor.as_deref();
        self.resolver
            .active()
            .filter(|identity| descriptor.is_none_or(|descriptor| identity.matches(descriptor)))
    }

    fn take_lap_frames(&mut self) -> Vec<TelemetryFrame> {
        std::mem::take(&mut self.lap_frames).into()
    }

    async fn send_job(&self, job: PersistJob) {
        let lap = job.lap_number;
        if self.outputs.persist.send(job).await.is_err() {
            warn!(lap, "Persistence worker gone, lap not persisted");
        }
    }

    /// Resolve the current descriptor on a spawned task, superseding any resolution in flight.
    async fn start_resolution(&mut self) {
        let Some(descriptor) = self.descriptor.clone() else {
            return;
        };
        if let Some(task) = self.resolution.take() {
            if task.is_finished() {
                self.complete_resolution(task).await;
            } else {
                debug!("Superseding session resolution in flight");
                task.abort();
            }
        }

        self.spawn_resolution(descriptor);
    }

    fn spawn_resolution(&mut self, descriptor: Arc<SessionDescriptor>) {
        self.resolve_retry_at = None;
        let resolver = Arc::clone(&self.resolver);
        self.resolution = Some(tokio::spawn(async move { resolver.resolve(&descriptor).await }));
    }

    async fn poll_resolution(&mut self) {
        if self.resolution.as_ref().is_some_and(|task| task.is_finished()) {
            self.finish_resolution().await;
        }
    }

    /// Wait for the resolution in flight, if any, and apply its outcome.
    async fn finish_resolution(&mut self) {
        if let Some(task) = self.resolution.take() {
            self.complete_resolution(task).await;
        }
    }

    async fn complete_resolution(&mut self, task: ResolveTask) {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                warn!(error = %e, "Session resolution task failed");
                self.schedule_resolve_retry(e.to_string());
                return;
            }
        };

        match outcome {
            Ok((resolution, identity)) => {
                let previous = self.session_id.replace(identity.session_id.clone());
                if resolution == Resolution::Unchanged {
                    return;
                }
                if previous.is_some_and(|previous| previous != identity.session_id) {
                    self.engine.clear_history();
                }
                self.publish(PipelineEvent::SessionChanged { resolution, identity });
            }
            Err(e) => {
                warn!(error = %e, "Session resolution failed, timing continues locally");
                self.schedule_resolve_retry(e.to_string());
            }
        }
    }

    fn schedule_resolve_retry(&mut self, reason: String) {
        let retry = self.config.session.resolve_retry();
        debug!(retry_in = ?retry, "Session resolution retry scheduled");
        self.resolve_retry_at = Some(Instant::now() + retry);
        self.publish(PipelineEvent::Diagnostic(Diagnostic::SessionResolveFailed { reason }));
    }

    fn retry_resolution_if_due(&mut self) {
        let due = self.resolve_retry_at.is_some_and(|at| Instant::now() >= at);
        if !due || self.resolution.is_some() {
            return;
        }
        if let Some(descriptor) = self.descriptor.clone() {
            self.spawn_resolution(descriptor);
        }
    }

    fn publish(&self, event: PipelineEvent) {
        let _ = self.outputs.events.send(event);
    }
}

/// Runs the [`LapWriter`] over the lap job channel.
pub struct PersistenceWorker {
    writer: LapWriter,
    pop_timeout: Duration,
}

impl PersistenceWorker {
    pub fn new(writer: LapWriter, pop_timeout: Duration) -> Self {
        Self { writer, pop_timeout }
    }

    /// Handle jobs until the timing worker drops its sender.
    ///
    /// Shutdown does not stop this loop early: jobs already queued are still
    /// written, bounded by the pipeline's shutdown timeout.
    pub async fn run(mut self, mut jobs: mpsc::Receiver<PersistJob>, cancel: CancellationToken) {
        info!("Persistence worker started");
        loop {
            match timeout(self.pop_timeout, jobs.recv()).await {
                Ok(Some(job)) => self.writer.handle(job).await,
                Ok(None) => break,
                Err(_) => {
                    if cancel.is_cancelled() {
                        trace!(queued = jobs.len(), "Waiting for remaining lap jobs");
                    }
                }
            }
        }

        self.writer.finish().await;
        info!("Persistence worker stopped");
    }
}
