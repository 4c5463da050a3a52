//! Remote session and lap store seam

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::layout::{CarRef, TrackRef};

/// Store-assigned session id, opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

/// Store-assigned lap id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LapId(pub String);

/// Store id of a track (or track configuration) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(pub i64);

/// Store id of a car record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CarId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for LapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fields a resumable session must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFilter {
    pub user_id: String,
    pub track_id: TrackId,
    pub car_id: CarId,
    pub session_type: String,
    pub native_session_id: i64,
    pub native_sub_session_id: i64,
}

/// A session record to insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSession {
    pub user_id: String,
    pub track_id: TrackId,
    pub car_id: CarId,
    pub session_type: String,
    pub native_session_id: i64,
    pub native_sub_session_id: i64,
    pub started_at: DateTime<Utc>,
}

impl NewSession {
    fn matches(&self, filter: &SessionFilter) -> bool {
        self.user_id == filter.user_id
            && self.track_id == filter.track_id
            && self.car_id == filter.car_id
            && self.session_type == filter.session_type
            && self.native_session_id == filter.native_session_id
            && self.native_sub_session_id == filter.native_sub_session_id
    }
}

/// A completed lap to insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLap {
    pub session_id: SessionId,
    pub lap_number: i32,
    pub lap_time: f64,
    pub is_valid: bool,
    pub sector_times: Vec<f64>,
    /// Local artifact path, if one was written
    pub artifact: Option<String>,
}

/// Remote session history.
///
/// Every call may fail; the pipeline treats failures as "retry later".
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Most recent session matching `filter` created within `window` of now.
    async fn find_session(
        &self,
        filter: &SessionFilter,
        window: Duration,
    ) -> Result<Option<SessionId>, StoreError>;

    async fn create_session(&self, session: &NewSession) -> Result<SessionId, StoreError>;

    async fn create_lap(&self, lap: &NewLap) -> Result<LapId, StoreError>;

    /// Track record for a native track id and configuration.
    ///
    /// A base track and each named configuration are distinct records.
    async fn find_or_create_track(&self, track: &TrackRef) -> Result<TrackId, StoreError>;

    /// Car record by native id, falling back to name.
    async fn find_or_create_car(&self, car: &CarRef) -> Result<CarId, StoreError>;
}

/// Run a store call, reporting the store unavailable when it does not answer within `limit`.
pub async fn with_deadline<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::unavailable(format!("no response within {limit:?}"))),
    }
}

#[derive(Debug, Clone)]
struct StoredSession {
    id: SessionId,
    record: NewSession,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    sessions: Vec<StoredSession>,
    laps: Vec<(LapId, NewLap)>,
    tracks: Vec<(TrackId, TrackRef)>,
    cars: Vec<(CarId, CarRef)>,
    next_id: i64,
    unavailable: bool,
    sessions_created: usize,
}

impl MemoryInner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::unavailable("memory store switched offline"));
        }
        Ok(())
    }
}

/// In-process [`SessionStore`], for offline use and tests.
///
/// Can be switched unavailable to exercise failure paths.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: Mutex<MemoryInner>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`] until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.inner.lock().unavailable = !available;
    }

    /// Insert a session with an explicit creation time.
    pub fn insert_session_at(&self, session: NewSession, created_at: DateTime<Utc>) -> SessionId {
        let mut inner = self.inner.lock();
        let id = SessionId(format!("session-{}", inner.next_id()));
        inner.sessions.push(StoredSession { id: id.clone(), record: session, created_at });
        id
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Sessions created through [`SessionStore::create_session`].
    pub fn sessions_created(&self) -> usize {
        self.inner.lock().sessions_created
    }

    pub fn laps(&self) -> Vec<NewLap> {
        self.inner.lock().laps.iter().map(|(_, lap)| lap.clone()).collect()
    }

    pub fn track_count(&self) -> usize {
        self.inner.lock().tracks.len()
    }

    pub fn car_count(&self) -> usize {
        self.inner.lock().cars.len()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn find_session(
        &self,
        filter: &SessionFilter,
        window: Duration,
    ) -> Result<Option<SessionId>, StoreError> {
        let inner = self.inner.lock();
        inner.check()?;

        let window = chrono::Duration::from_std(window)
            .map_err(|e| StoreError::rejected("find_session", e.to_string()))?;
        let cutoff = Utc::now() - window;

        Ok(inner
            .sessions
            .iter()
            .filter(|stored| stored.created_at >= cutoff && stored.record.matches(filter))
            .max_by_key(|stored| stored.created_at)
            .map(|stored| stored.id.clone()))
    }

    async fn create_session(&self, session: &NewSession) -> Result<SessionId, StoreError> {
        let mut inner = self.inner.lock();
        inner.check()?;

        let id = SessionId(format!("session-{}", inner.next_id()));
        inner.sessions.push(StoredSession {
            id: id.clone(),
            record: session.clone(),
            created_at: Utc::now(),
        });
        inner.sessions_created += 1;
        debug!(session_id = %id, "Memory store created session");
        Ok(id)
    }

    async fn create_lap(&self, lap: &NewLap) -> Result<LapId, StoreError> {
        let mut inner = self.inner.lock();
        inner.check()?;

        if !inner.sessions.iter().any(|stored| stored.id == lap.session_id) {
            return Err(StoreError::NotFound { entity: format!("session {}", lap.session_id) });
        }
        let id = LapId(format!("lap-{}", inner.next_id()));
        inner.laps.push((id.clone(), lap.clone()));
        Ok(id)
    }

    async fn find_or_create_track(&self, track: &TrackRef) -> Result<TrackId, StoreError> {
        let mut inner = self.inner.lock();
        inner.check()?;

        let existing = inner.tracks.iter().find(|(_, known)| {
            let same_track = match (known.native_id, track.native_id) {
                (Some(a), Some(b)) => a == b,
                _ => known.name == track.name,
            };
            same_track && known.config == track.config
        });
        if let Some((id, _)) = existing {
            return Ok(*id);
        }

        let id = TrackId(inner.next_id());
        inner.tracks.push((id, track.clone()));
        Ok(id)
    }

    async fn find_or_create_car(&self, car: &CarRef) -> Result<CarId, StoreError> {
        let mut inner = self.inner.lock();
        inner.check()?;

        let by_native = car.native_id.and_then(|native| {
            inner.cars.iter().find(|(_, known)| known.native_id == Some(native))
        });
        let existing =
            by_native.or_else(|| inner.cars.iter().find(|(_, known)| known.name == car.name));
        if let Some((id, _)) = existing {
            return Ok(*id);
        }

        let id = CarId(inner.next_id());
        inner.cars.push((id, car.clone()));
        Ok(id)
    }
}
