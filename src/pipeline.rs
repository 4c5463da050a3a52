//! Composition root
//!
//! [`Pipeline::spawn`] builds every component, wires the channels and starts
//! the producer and both consumer workers. The returned handle is the only
//! way in: observers subscribe to streams, read snapshots, and finally call
//! [`Pipeline::shutdown`].

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::BufferHandle;
use crate::config::PipelineConfig;
use crate::connection::{ConnectionManager, ConnectionSnapshot};
use crate::diagnostics::{PipelineEvent, PipelineStats, StatsSnapshot};
use crate::error::{Result, TelemetryError};
use crate::persistence::LapWriter;
use crate::producer::Producer;
use crate::session::{SessionIdentity, SessionResolver, SessionStore};
use crate::source::TelemetrySource;
use crate::stream::ThrottleExt;
use crate::types::{ProgressSnapshot, TelemetryFrame, UpdateRate};
use crate::worker::{PersistenceWorker, TimingOutputs, TimingWorker};

/// Finished laps waiting for the persistence worker.
const PERSIST_QUEUE_CAPACITY: usize = 32;

struct Tasks {
    producer: JoinHandle<()>,
    timing: JoinHandle<()>,
    persistence: JoinHandle<()>,
}

/// Handle to a running acquisition pipeline.
///
/// Dropping the handle signals shutdown without waiting; prefer
/// [`shutdown`](Self::shutdown) to let pending laps reach storage.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    cancel: CancellationToken,
    connection: Arc<ConnectionManager>,
    buffer: BufferHandle,
    resolver: Arc<SessionResolver>,
    events: broadcast::Sender<PipelineEvent>,
    latest_frame: watch::Receiver<Option<Arc<TelemetryFrame>>>,
    progress: watch::Receiver<ProgressSnapshot>,
    stats: Arc<PipelineStats>,
    tasks: Option<Tasks>,
}

impl Pipeline {
    /// Validate `config` and start the producer and consumers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S>(source: S, store: Arc<dyn SessionStore>, config: PipelineConfig) -> Result<Self>
    where
        S: TelemetrySource,
    {
        config.validate()?;
        let config = Arc::new(config);
        let cancel = CancellationToken::new();

        let stats = Arc::new(PipelineStats::default());
        let connection = Arc::new(ConnectionManager::new(config.connection.clone()));
        let buffer = BufferHandle::new(config.initial_buffer_capacity());
        let resolver = Arc::new(SessionResolver::new(Arc::clone(&store), config.session.clone()));

        let (work_tx, work_rx) = mpsc::channel(config.work_queue_capacity);
        let (persist_tx, persist_rx) = mpsc::channel(PERSIST_QUEUE_CAPACITY);
        let (events, _) = broadcast::channel(config.event_capacity);
        let (latest_tx, latest_frame) = watch::channel(None);
        let (progress_tx, progress) = watch::channel(ProgressSnapshot::default());

        let writer = LapWriter::new(
            config.persistence.clone(),
            store,
            resolver.subscribe(),
            events.clone(),
            Arc::clone(&stats),
        );
        let persistence = PersistenceWorker::new(writer, config.pop_timeout());

        let timing = TimingWorker::new(
            Arc::clone(&config),
            Arc::clone(&resolver),
            TimingOutputs {
                events: events.clone(),
                latest_frame: latest_tx,
                progress: progress_tx,
                persist: persist_tx,
            },
            Arc::clone(&stats),
        );

        let producer = Producer::new(
            source,
            Arc::clone(&config),
            Arc::clone(&connection),
            buffer.clone(),
            work_tx,
            events.clone(),
            Arc::clone(&stats),
        );

        let tasks = Tasks {
            persistence: tokio::spawn(persistence.run(persist_rx, cancel.clone())),
            timing: tokio::spawn(timing.run(work_rx, cancel.clone())),
            producer: {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    producer.run(cancel).await;
                })
            },
        };

        info!(
            target_hz = config.target_hz,
            work_queue = config.work_queue_capacity,
            buffer_capacity = buffer.capacity(),
            "Telemetry pipeline started"
        );

        Ok(Self {
            config,
            cancel,
            connection,
            buffer,
            resolver,
            events,
            latest_frame,
            progress,
            stats,
            tasks: Some(tasks),
        })
    }

    /// Latest processed frame at most at `rate`.
    ///
    /// Observers that fall behind skip frames; they never slow the pipeline.
    pub fn frames(&self, rate: UpdateRate) -> BoxStream<'static, Arc<TelemetryFrame>> {
        let frames =
            WatchStream::new(self.latest_frame.clone()).filter_map(|frame| async move { frame });

        match rate.throttle_interval(self.config.target_hz) {
            None => frames.boxed(),
            Some(period) => frames.throttle(period).boxed(),
        }
    }

    /// Every event published from now on.
    ///
    /// A subscriber that lags past the event capacity loses the oldest events.
    pub fn events(&self) -> BoxStream<'static, PipelineEvent> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move {
                match event {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!(missed, "Event subscriber lagging, events skipped");
                        None
                    }
                }
            })
            .boxed()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn current_session(&self) -> Option<Arc<SessionIdentity>> {
        self.resolver.active()
    }

    pub fn session_updates(&self) -> BoxStream<'static, Option<Arc<SessionIdentity>>> {
        WatchStream::new(self.resolver.subscribe()).boxed()
    }

    pub fn latest_frame(&self) -> Option<Arc<TelemetryFrame>> {
        self.latest_frame.borrow().clone()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.borrow().clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The producer's lookback buffer.
    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }

    pub fn connection(&self) -> ConnectionSnapshot {
        self.connection.snapshot(tokio::time::Instant::now().into_std())
    }

    /// Clear backoff so the next producer tick may reconnect immediately.
    pub fn request_reconnect(&self) {
        self.connection.reset_backoff();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop acquisition and wait for the workers.
    ///
    /// Laps already handed to the persistence worker are written. All joins
    /// share one deadline of the configured shutdown timeout; a task still
    /// running then is aborted along with every task after it, and the
    /// timeout is returned. Task failures are only logged.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down telemetry pipeline");
        self.cancel.cancel();

        let Some(tasks) = self.tasks.take() else {
            return Ok(());
        };

        let limit = self.config.shutdown_timeout();
        let deadline = Instant::now() + limit;
        let mut joins = [
            ("producer", tasks.producer),
            ("timing worker", tasks.timing),
            ("persistence worker", tasks.persistence),
        ]
        .into_iter();

        while let Some((name, handle)) = joins.next() {
            if !join_until(name, handle, deadline).await {
                warn!(task = name, timeout = ?limit, "Task still busy at shutdown, aborting");
                for (name, handle) in joins {
                    debug!(task = name, "Aborting task");
                    handle.abort();
                }
                return Err(TelemetryError::Timeout { duration: limit });
            }
        }

        info!(stats = ?self.stats.snapshot(), "Telemetry pipeline stopped");
        Ok(())
    }

    /// Shutdown timeout from the configuration.
    pub fn shutdown_timeout(&self) -> Duration {
        self.config.shutdown_timeout()
    }
}

/// Wait for `handle` until `deadline`. Aborts the task and returns false once the deadline passes.
async fn join_until(name: &'static str, mut handle: JoinHandle<()>, deadline: Instant) -> bool {
    match timeout_at(deadline, &mut handle).await {
        Ok(Ok(())) => {
            debug!(task = name, "Task stopped");
            true
        }
        Ok(Err(e)) => {
            warn!(task = name, error = %e, "Task failed");
            true
        }
        Err(_) => {
            handle.abort();
            false
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.tasks.is_some() {
            debug!("Pipeline dropped without shutdown, cancelling tasks");
            self.cancel.cancel();
        }
    }
}
