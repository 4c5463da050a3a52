//! End-to-end pipeline tests
//!
//! A replayed three-lap session flows through the producer, the timing worker
//! and the persistence worker into a temporary artifact root and an in-memory
//! session store, or into stores that stop answering.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use laptrace::layout::{CarRef, TrackRef};
use laptrace::session::{
    CarId, LapId, NewLap, NewSession, SessionFilter, SessionId, SessionStore, TrackId,
};
use laptrace::{
    Diagnostic, MemorySessionStore, Pipeline, PipelineConfig, PipelineEvent, RawFrame, ReplaySource,
    StoreError, TelemetryError, UpdateRate,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;

const LAYOUT: &str = "WeekendInfo:
 TrackName: spa 2024 up
 TrackID: 525
 TrackDisplayName: Circuit de Spa-Francorchamps
 TrackConfigName: Grand Prix Pits
 SessionID: 0
 SubSessionID: 0

SessionInfo:
 CurrentSessionNum: 0
 Sessions:
 - SessionNum: 0
   SessionType: Offline Testing

DriverInfo:
 DriverCarIdx: 0
 Drivers:
 - CarIdx: 0
   UserName: Test Driver
   CarID: 156
   CarScreenName: Porsche 911 GT3 R (992)

SplitTimeInfo:
 Sectors:
 - SectorNum: 0
   SectorStartPct: 0.000000
 - SectorNum: 1
   SectorStartPct: 0.330000
 - SectorNum: 2
   SectorStartPct: 0.660000
";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `laps` laps of `points` frames, the counter ticking on each line crossing.
fn laps(laps: usize, points: usize, lap_secs: f64) -> Vec<RawFrame> {
    let step = lap_secs / points as f64;
    (0..laps * points)
        .map(|i| {
            let fraction = (i % points) as f64 / points as f64;
            RawFrame::new(fraction, i as f64 * step, (i / points) as i32 + 1)
        })
        .collect()
}

fn fast_config(artifact_root: &Path) -> PipelineConfig {
    let mut config =
        PipelineConfig { target_hz: 1_000.0, pop_timeout_ms: 20, ..PipelineConfig::default() };
    config.persistence.artifact_root = artifact_root.to_path_buf();
    config
}

/// Resolves sessions normally, but lap writes never complete.
/// With `sessions_answer` off, no call completes at all.
struct StalledStore {
    inner: MemorySessionStore,
    sessions_answer: bool,
}

impl StalledStore {
    fn new(sessions_answer: bool) -> Self {
        Self { inner: MemorySessionStore::new(), sessions_answer }
    }

    async fn stall_unless_answering(&self) {
        if !self.sessions_answer {
            futures::future::pending::<()>().await;
        }
    }
}

#[async_trait::async_trait]
impl SessionStore for StalledStore {
    async fn find_session(
        &self,
        filter: &SessionFilter,
        window: Duration,
    ) -> Result<Option<SessionId>, StoreError> {
        self.stall_unless_answering().await;
        self.inner.find_session(filter, window).await
    }

    async fn create_session(&self, session: &NewSession) -> Result<SessionId, StoreError> {
        self.stall_unless_answering().await;
        self.inner.create_session(session).await
    }

    async fn create_lap(&self, _lap: &NewLap) -> Result<LapId, StoreError> {
        futures::future::pending().await
    }

    async fn find_or_create_track(&self, track: &TrackRef) -> Result<TrackId, StoreError> {
        self.stall_unless_answering().await;
        self.inner.find_or_create_track(track).await
    }

    async fn find_or_create_car(&self, car: &CarRef) -> Result<CarId, StoreError> {
        self.stall_unless_answering().await;
        self.inner.find_or_create_car(car).await
    }
}

fn artifacts(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(folders) = std::fs::read_dir(root) else {
        return found;
    };
    for folder in folders.flatten() {
        if let Ok(files) = std::fs::read_dir(folder.path()) {
            found.extend(files.flatten().map(|file| file.path()));
        }
    }
    found.sort();
    found
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replayed_session_is_timed_and_persisted() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(MemorySessionStore::new());
    let source = ReplaySource::new(laps(3, 120, 90.0)).with_layout(0, LAYOUT);

    let pipeline = Pipeline::spawn(source, store.clone(), fast_config(dir.path()))?;
    let mut events = pipeline.events();

    let mut completed = Vec::new();
    let mut remote = 0;
    timeout(Duration::from_secs(10), async {
        while completed.len() < 2 || remote < 2 {
            match events.next().await {
                Some(PipelineEvent::LapCompleted { record, .. }) => completed.push(record),
                Some(PipelineEvent::LapPersisted { remote_id: Some(_), .. }) => remote += 1,
                Some(_) => {}
                None => break,
            }
        }
    })
    .await
    .context("laps were not timed and stored in time")?;

    assert_eq!(completed.iter().map(|r| r.lap_number).collect::<Vec<_>>(), vec![1, 2]);
    assert!(completed.iter().all(|r| r.is_valid && r.sector_times.len() == 3));
    assert!((completed[0].total_time - 90.0).abs() < 1e-6);

    let session = pipeline.current_session().context("session resolved")?;
    assert!(pipeline.latest_frame().is_some());
    assert_eq!(pipeline.progress().total_sectors, 3);

    pipeline.shutdown().await?;

    let stored = store.laps();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|lap| lap.session_id == session.session_id));
    assert_eq!(store.sessions_created(), 1);

    let files = artifacts(dir.path());
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|path| path.extension().is_some_and(|ext| ext == "json")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unavailable_store_keeps_artifacts_and_reports_lost_laps() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(MemorySessionStore::new());
    store.set_available(false);
    let source = ReplaySource::new(laps(3, 120, 90.0)).with_layout(0, LAYOUT);

    let pipeline = Pipeline::spawn(source, store.clone(), fast_config(dir.path()))?;
    let mut events = pipeline.subscribe_events();

    let mut written = 0;
    let mut resolve_failed = false;
    timeout(Duration::from_secs(10), async {
        while written < 2 || !resolve_failed {
            match events.recv().await {
                Ok(PipelineEvent::LapPersisted { artifact: Some(_), remote_id: None, .. }) => {
                    written += 1
                }
                Ok(PipelineEvent::Diagnostic(Diagnostic::SessionResolveFailed { .. })) => {
                    resolve_failed = true;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await
    .context("artifacts were not written in time")?;

    assert!(pipeline.current_session().is_none());
    pipeline.shutdown().await?;

    let mut lost = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::Diagnostic(Diagnostic::LapPersistFailed { lap_number, .. }) = event {
            lost.push(lap_number);
        }
    }
    assert_eq!(lost, vec![1, 2]);
    assert!(store.laps().is_empty());
    assert_eq!(artifacts(dir.path()).len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn throttled_frames_reach_observers() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let source = ReplaySource::new(laps(1, 500, 60.0)).with_layout(0, LAYOUT);
    let store = Arc::new(MemorySessionStore::new());
    let pipeline = Pipeline::spawn(source, store, fast_config(dir.path()))?;

    let frames: Vec<_> = timeout(
        Duration::from_secs(10),
        pipeline.frames(UpdateRate::Max(20)).take(3).collect::<Vec<_>>(),
    )
    .await
    .context("no frames observed")?;

    assert_eq!(frames.len(), 3);
    assert!(frames.windows(2).all(|pair| pair[0].sequence < pair[1].sequence));

    pipeline.shutdown().await?;
    Ok(())
}

async fn count_completed_laps(pipeline: &Pipeline, wanted: usize) -> Result<usize> {
    let mut events = pipeline.events();
    let mut completed = 0;
    timeout(Duration::from_secs(10), async {
        while completed < wanted {
            match events.next().await {
                Some(PipelineEvent::LapCompleted { .. }) => completed += 1,
                Some(_) => {}
                None => break,
            }
        }
    })
    .await
    .context("laps were not timed in time")?;
    Ok(completed)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_store_does_not_stall_timing() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let mut config = fast_config(dir.path());
    config.session.store_timeout_ms = 30_000;
    let source = ReplaySource::new(laps(3, 120, 90.0)).with_layout(0, LAYOUT);

    let pipeline = Pipeline::spawn(source, Arc::new(StalledStore::new(false)), config)?;
    assert_eq!(count_completed_laps(&pipeline, 2).await?, 2);
    assert!(pipeline.current_session().is_none());
    assert!(pipeline.stats().laps_completed >= 2);

    timeout(Duration::from_secs(5), pipeline.shutdown())
        .await
        .context("shutdown waited on the store")??;
    assert_eq!(artifacts(dir.path()).len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stuck_lap_write_is_abandoned_at_shutdown() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let mut config = fast_config(dir.path());
    config.shutdown_timeout_secs = 1;
    config.persistence.remote_timeout_ms = 30_000;
    let source = ReplaySource::new(laps(3, 120, 90.0)).with_layout(0, LAYOUT);

    let pipeline = Pipeline::spawn(source, Arc::new(StalledStore::new(true)), config)?;
    assert_eq!(count_completed_laps(&pipeline, 2).await?, 2);
    assert!(pipeline.current_session().is_some());

    let started = std::time::Instant::now();
    let stopped = timeout(Duration::from_secs(5), pipeline.shutdown())
        .await
        .context("shutdown was not bounded")?;
    assert!(matches!(stopped, Err(TelemetryError::Timeout { .. })));
    assert!(started.elapsed() < Duration::from_secs(3));
    Ok(())
}
