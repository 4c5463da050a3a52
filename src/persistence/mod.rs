//! Lap persistence: local artifacts first, then the remote store
//!
//! [`LapWriter`] is owned by the persistence worker. Every lap is written to
//! disk before any remote call, so local history survives an unreachable
//! store. Remote writes are at-least-once: failed laps wait in a bounded
//! pending queue and are retried whenever the next lap arrives.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::PersistenceConfig;
use crate::diagnostics::{Diagnostic, PipelineEvent, PipelineStats};
use crate::error::TelemetryError;
use crate::layout::SessionDescriptor;
use crate::session::{NewLap, SessionId, SessionIdentity, SessionStore, with_deadline};
use crate::types::{LapSectorRecord, TelemetryFrame};

pub mod artifact;
pub mod lap_detector;

pub use artifact::{LapArtifact, LapMetadata, session_folder_name};
pub use lap_detector::{LapTrigger, RawLapBoundary, RawLapDetector};

/// A finished lap handed from the timing worker to the writer.
#[derive(Debug, Clone)]
pub struct PersistJob {
    pub lap_number: i32,
    pub lap_time: f64,
    pub is_valid: bool,
    pub sector_times: Vec<f64>,
    /// Frames captured during the lap, in capture order
    pub frames: Vec<TelemetryFrame>,
    pub track_name: Option<String>,
    pub car_name: Option<String>,
    /// Driving context the lap was recorded in
    pub context: Option<SessionDescriptor>,
    /// Remote session active for that context when the lap closed
    pub session: Option<Arc<SessionIdentity>>,
}

impl PersistJob {
    /// Job for a lap closed by the sector timing engine.
    pub fn from_record(
        record: &LapSectorRecord,
        frames: Vec<TelemetryFrame>,
        context: Option<&SessionDescriptor>,
    ) -> Self {
        Self {
            lap_number: record.lap_number,
            lap_time: record.total_time,
            is_valid: record.is_valid,
            sector_times: record.sector_times.clone(),
            frames,
            track_name: context.map(|c| c.track.name.clone()),
            car_name: context.map(|c| c.car.name.clone()),
            context: context.cloned(),
            session: None,
        }
    }

    /// Job for a lap closed by the raw position detector.
    pub fn from_raw(
        lap_number: i32,
        duration: f64,
        frames: Vec<TelemetryFrame>,
        context: Option<&SessionDescriptor>,
    ) -> Self {
        Self {
            lap_number,
            lap_time: duration,
            is_valid: true,
            sector_times: Vec::new(),
            frames,
            track_name: context.map(|c| c.track.name.clone()),
            car_name: context.map(|c| c.car.name.clone()),
            context: context.cloned(),
            session: None,
        }
    }

    /// Attribute the lap to `session`; later identity changes do not move it.
    pub fn with_session(mut self, session: Option<Arc<SessionIdentity>>) -> Self {
        self.session = session;
        self
    }
}

#[derive(Debug, Clone)]
struct PendingLap {
    /// Set from the job, or on the first attempt with an identity matching `context`
    session_id: Option<SessionId>,
    context: Option<SessionDescriptor>,
    lap_number: i32,
    lap_time: f64,
    is_valid: bool,
    sector_times: Vec<f64>,
    artifact: Option<PathBuf>,
    attempts: u32,
}

impl PendingLap {
    fn to_new_lap(&self, session_id: SessionId) -> NewLap {
        NewLap {
            session_id,
            lap_number: self.lap_number,
            lap_time: self.lap_time,
            is_valid: self.is_valid,
            sector_times: self.sector_times.clone(),
            artifact: self.artifact.as_ref().map(|path| path.display().to_string()),
        }
    }
}

#[derive(Debug)]
struct SessionFolder {
    track: String,
    car: String,
    path: PathBuf,
}

pub struct LapWriter {
    config: PersistenceConfig,
    store: Arc<dyn SessionStore>,
    identity: watch::Receiver<Option<Arc<SessionIdentity>>>,
    events: broadcast::Sender<PipelineEvent>,
    stats: Arc<PipelineStats>,
    folder: Option<SessionFolder>,
    pending: VecDeque<PendingLap>,
}

impl LapWriter {
    pub fn new(
        config: PersistenceConfig,
        store: Arc<dyn SessionStore>,
        identity: watch::Receiver<Option<Arc<SessionIdentity>>>,
        events: broadcast::Sender<PipelineEvent>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            config,
            store,
            identity,
            events,
            stats,
            folder: None,
            pending: VecDeque::new(),
        }
    }

    /// Laps still waiting for a remote write.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Persist one lap: artifact, then remote with earlier failures first.
    pub async fn handle(&mut self, mut job: PersistJob) {
        let session_id = match job.session.as_ref() {
            Some(session) => Some(session.session_id.clone()),
            None => self.session_for(job.context.as_ref()),
        };
        let artifact = self.write_artifact(&mut job, session_id.as_ref()).await;

        self.pending.push_back(PendingLap {
            session_id,
            context: job.context,
            lap_number: job.lap_number,
            lap_time: job.lap_time,
            is_valid: job.is_valid,
            sector_times: job.sector_times,
            artifact,
            attempts: 0,
        });
        while self.pending.len() > self.config.pending_cap {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(lap = dropped.lap_number, "Pending lap queue full, giving up oldest lap");
                self.give_up(&dropped, "pending lap queue full".to_string());
            }
        }

        self.flush_pending().await;
    }

    /// Last flush at shutdown; anything still pending is reported lost.
    pub async fn finish(&mut self) {
        self.flush_pending().await;
        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "Shutting down with unsent laps");
        }
        while let Some(lap) = self.pending.pop_front() {
            self.give_up(&lap, "shutdown before remote write".to_string());
        }
    }

    /// The active session, unless it belongs to a different driving context.
    fn session_for(&self, context: Option<&SessionDescriptor>) -> Option<SessionId> {
        self.identity
            .borrow()
            .as_ref()
            .filter(|identity| context.is_none_or(|context| identity.matches(context)))
            .map(|identity| identity.session_id.clone())
    }

    async fn write_artifact(
        &mut self,
        job: &mut PersistJob,
        session_id: Option<&SessionId>,
    ) -> Option<PathBuf> {
        if !self.config.write_artifacts {
            return None;
        }
        if job.frames.len() < self.config.min_lap_points {
            debug!(
                lap = job.lap_number,
                points = job.frames.len(),
                "Lap too short for an artifact"
            );
            return None;
        }

        let dir = self.session_folder(job);
        let artifact = LapArtifact {
            metadata: LapMetadata {
                lap_number: job.lap_number,
                lap_time: job.lap_time,
                point_count: job.frames.len(),
                is_valid: job.is_valid,
                track_name: job.track_name.clone(),
                car_name: job.car_name.clone(),
                session_id: session_id.map(SessionId::to_string),
                sector_times: job.sector_times.clone(),
                recorded_at: Utc::now(),
            },
            frames: std::mem::take(&mut job.frames),
        };

        let written = tokio::task::spawn_blocking(move || artifact.write_new(&dir))
            .await
            .map_err(|e| TelemetryError::file_error(PathBuf::new(), std::io::Error::other(e)))
            .and_then(|result| result);

        match written {
            Ok(path) => {
                self.stats.record_artifact();
                info!(lap = job.lap_number, path = %path.display(), "Lap artifact saved");
                self.publish(PipelineEvent::LapPersisted {
                    lap_number: job.lap_number,
                    artifact: Some(path.clone()),
                    remote_id: None,
                });
                Some(path)
            }
            Err(e) => {
                warn!(lap = job.lap_number, error = %e, "Lap artifact write failed");
                self.publish(PipelineEvent::Diagnostic(Diagnostic::ArtifactWriteFailed {
                    lap_number: job.lap_number,
                    reason: e.to_string(),
                }));
                None
            }
        }
    }

    /// Folder for the job's track and car, started on first use.
    fn session_folder(&mut self, job: &PersistJob) -> PathBuf {
        let track = job.track_name.as_deref().unwrap_or("Unknown");
        let car = job.car_name.as_deref().unwrap_or("Unknown");

        match &self.folder {
            Some(folder) if folder.track == track && folder.car == car => folder.path.clone(),
            _ => {
                let name = session_folder_name(track, car, Utc::now());
                let path = self.config.artifact_root.join(name);
                debug!(path = %path.display(), "New artifact session folder");
                self.folder = Some(SessionFolder {
                    track: track.to_string(),
                    car: car.to_string(),
                    path: path.clone(),
                });
                path
            }
        }
    }

    async fn flush_pending(&mut self) {
        let mut remaining = VecDeque::with_capacity(self.pending.len());

        while let Some(mut lap) = self.pending.pop_front() {
            let bound = lap.session_id.clone().or_else(|| self.session_for(lap.context.as_ref()));
            let Some(session_id) = bound else {
                // No session for this lap's context yet; nothing is attempted
                remaining.push_back(lap);
                continue;
            };
            lap.session_id = Some(session_id.clone());

            let new_lap = lap.to_new_lap(session_id);
            let written =
                with_deadline(self.config.remote_timeout(), self.store.create_lap(&new_lap)).await;
            match written {
                Ok(lap_id) => {
                    self.stats.record_persisted();
                    debug!(lap = lap.lap_number, %lap_id, "Lap stored remotely");
                    self.publish(PipelineEvent::LapPersisted {
                        lap_number: lap.lap_number,
                        artifact: lap.artifact.clone(),
                        remote_id: Some(lap_id),
                    });
                }
                Err(e) => {
                    lap.attempts += 1;
                    self.stats.record_remote_failure();
                    let retryable = e.is_retryable();

                    if !retryable || lap.attempts > self.config.remote_retries {
                        warn!(
                            lap = lap.lap_number,
                            attempts = lap.attempts,
                            error = %e,
                            "Giving up on remote lap write"
                        );
                        self.give_up(&lap, e.to_string());
                    } else {
                        debug!(
                            lap = lap.lap_number,
                            attempts = lap.attempts,
                            error = %e,
                            "Remote lap write failed, will retry"
                        );
                        remaining.push_back(lap);
                    }

                    if retryable {
                        // Store is down; leave the rest for the next lap
                        remaining.extend(self.pending.drain(..));
                        break;
                    }
                }
            }
        }

        self.pending = remaining;
    }

    fn give_up(&self, lap: &PendingLap, reason: String) {
        self.publish(PipelineEvent::Diagnostic(Diagnostic::LapPersistFailed {
            lap_number: lap.lap_number,
            attempts: lap.attempts,
            reason,
        }));
    }

    fn publish(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::{MemorySessionStore, SessionResolver};
    use crate::test_utils::{SilentStore, descriptor, frame_at};

    struct Harness {
        store: Arc<MemorySessionStore>,
        resolver: SessionResolver,
        writer: LapWriter,
        events: broadcast::Receiver<PipelineEvent>,
        stats: Arc<PipelineStats>,
        _dir: tempfile::TempDir,
    }

    fn harness(config: impl FnOnce(&mut PersistenceConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut persistence = PersistenceConfig {
            artifact_root: dir.path().to_path_buf(),
            ..PersistenceConfig::default()
        };
        config(&mut persistence);

        let store = Arc::new(MemorySessionStore::new());
        let resolver = SessionResolver::new(store.clone(), SessionConfig::default());
        let (tx, events) = broadcast::channel(64);
        let stats = Arc::new(PipelineStats::default());
        let writer =
            LapWriter::new(persistence, store.clone(), resolver.subscribe(), tx, stats.clone());

        Harness { store, resolver, writer, events, stats, _dir: dir }
    }

    fn job(lap_number: i32, points: u64) -> PersistJob {
        let frames = (0..points).map(|seq| frame_at(seq, seq as f64 / points as f64)).collect();
        let record = LapSectorRecord::new(lap_number, vec![30.0, 30.0, 30.5], 100.0, true);
        PersistJob::from_record(&record, frames, Some(&descriptor("Mazda MX-5 Cup", 67)))
    }

    fn drain(events: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    fn failures(events: &[PipelineEvent]) -> Vec<i32> {
        events
            .iter()
            .filter_map(|event| match event {
                PipelineEvent::Diagnostic(Diagnostic::LapPersistFailed { lap_number, .. }) => {
                    Some(*lap_number)
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn artifact_then_remote() {
        let mut h = harness(|_| {});
        h.resolver.resolve(&descriptor("Mazda MX-5 Cup", 67)).await.unwrap();

        h.writer.handle(job(1, 20)).await;

        let laps = h.store.laps();
        assert_eq!(laps.len(), 1);
        let path = PathBuf::from(laps[0].artifact.as_ref().unwrap());
        let saved = LapArtifact::read(&path).unwrap();
        assert_eq!(saved.metadata.point_count, 20);
        assert_eq!(saved.metadata.session_id.as_deref(), Some(laps[0].session_id.0.as_str()));
        let folder = path.parent().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert!(folder.contains("Mazda_MX-5_Cup"));

        let events = drain(&mut h.events);
        let remote = events.iter().any(|event| {
            matches!(
                event,
                PipelineEvent::LapPersisted { remote_id: Some(_), artifact: Some(_), .. }
            )
        });
        assert!(remote);
        assert_eq!(h.stats.snapshot().artifacts_written, 1);
        assert_eq!(h.stats.snapshot().laps_persisted, 1);
    }

    #[tokio::test]
    async fn laps_wait_for_session_identity() {
        let mut h = harness(|_| {});
        h.writer.handle(job(1, 20)).await;
        h.writer.handle(job(2, 20)).await;
        assert_eq!(h.writer.pending_len(), 2);
        assert_eq!(h.stats.snapshot().remote_failures, 0);

        h.resolver.resolve(&descriptor("Mazda MX-5 Cup", 67)).await.unwrap();
        h.writer.handle(job(3, 20)).await;

        let numbers: Vec<_> = h.store.laps().iter().map(|lap| lap.lap_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(h.writer.pending_len(), 0);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let mut h = harness(|config| config.remote_retries = 1);
        h.resolver.resolve(&descriptor("Mazda MX-5 Cup", 67)).await.unwrap();
        h.store.set_available(false);

        h.writer.handle(job(1, 20)).await;
        h.writer.handle(job(2, 20)).await;
        assert_eq!(failures(&drain(&mut h.events)), vec![1]);
        assert_eq!(h.writer.pending_len(), 1);

        h.store.set_available(true);
        h.writer.handle(job(3, 20)).await;
        let numbers: Vec<_> = h.store.laps().iter().map(|lap| lap.lap_number).collect();
        assert_eq!(numbers, vec![2, 3]);
        // Local artifacts were written regardless
        assert_eq!(h.stats.snapshot().artifacts_written, 3);
    }

    #[tokio::test]
    async fn pending_queue_is_capped() {
        let mut h = harness(|config| config.pending_cap = 2);
        for lap in 1..=3 {
            h.writer.handle(job(lap, 20)).await;
        }
        assert_eq!(h.writer.pending_len(), 2);
        assert_eq!(failures(&drain(&mut h.events)), vec![1]);
    }

    #[tokio::test]
    async fn short_laps_skip_artifact() {
        let mut h = harness(|_| {});
        h.resolver.resolve(&descriptor("Mazda MX-5 Cup", 67)).await.unwrap();
        h.writer.handle(job(1, 5)).await;

        let laps = h.store.laps();
        assert_eq!(laps.len(), 1);
        assert!(laps[0].artifact.is_none());
        assert_eq!(h.stats.snapshot().artifacts_written, 0);
    }

    #[tokio::test]
    async fn lap_keeps_session_it_was_driven_in() {
        let mut h = harness(|_| {});
        let (_, mx5) = h.resolver.resolve(&descriptor("Mazda MX-5 Cup", 67)).await.unwrap();
        let lap = job(7, 20).with_session(Some(Arc::clone(&mx5)));

        // The car changes before the writer gets to the lap.
        let (_, gr86) = h.resolver.resolve(&descriptor("Toyota GR86", 160)).await.unwrap();
        assert_ne!(gr86.session_id, mx5.session_id);
        h.writer.handle(lap).await;

        let laps = h.store.laps();
        assert_eq!(laps.len(), 1);
        assert_eq!(laps[0].session_id, mx5.session_id);
        let artifact = PathBuf::from(laps[0].artifact.as_ref().unwrap());
        let saved = LapArtifact::read(&artifact).unwrap();
        assert_eq!(saved.metadata.session_id, Some(mx5.session_id.to_string()));
    }

    #[tokio::test]
    async fn unbound_lap_waits_for_its_own_context() {
        let mut h = harness(|_| {});
        h.resolver.resolve(&descriptor("Toyota GR86", 160)).await.unwrap();

        // An MX-5 lap without a captured session is not attributed to the GR86 session.
        h.writer.handle(job(3, 20)).await;
        assert!(h.store.laps().is_empty());
        assert_eq!(h.writer.pending_len(), 1);

        let (_, mx5) = h.resolver.resolve(&descriptor("Mazda MX-5 Cup", 67)).await.unwrap();
        h.writer.handle(job(4, 20)).await;
        let laps = h.store.laps();
        assert_eq!(laps.len(), 2);
        assert!(laps.iter().all(|lap| lap.session_id == mx5.session_id));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_store_write_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = PersistenceConfig {
            artifact_root: dir.path().to_path_buf(),
            remote_timeout_ms: 1_000,
            ..PersistenceConfig::default()
        };
        let store = Arc::new(MemorySessionStore::new());
        let resolver = SessionResolver::new(store.clone(), SessionConfig::default());
        resolver.resolve(&descriptor("Mazda MX-5 Cup", 67)).await.unwrap();
        let (tx, _events) = broadcast::channel(64);
        let stats = Arc::new(PipelineStats::default());
        let mut writer = LapWriter::new(
            persistence,
            Arc::new(SilentStore),
            resolver.subscribe(),
            tx,
            stats.clone(),
        );

        writer.handle(job(1, 5)).await;
        writer.handle(job(2, 5)).await;

        assert_eq!(writer.pending_len(), 2);
        assert_eq!(stats.snapshot().remote_failures, 2);
    }

    #[tokio::test]
    async fn finish_reports_unsent_laps() {
        let mut h = harness(|_| {});
        h.writer.handle(job(4, 20)).await;
        h.writer.finish().await;

        assert_eq!(h.writer.pending_len(), 0);
        assert_eq!(failures(&drain(&mut h.events)), vec![4]);
    }
}
