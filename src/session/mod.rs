//! # Session Identity Resolution
//!
//! Decides, for each parsed session document, whether laps belong to an
//! existing remote session record or to a new one.
//!
//! - No active identity: look for a matching session created within a
//!   lookback window (1 h offline, 4 h with a native session id) and resume
//!   it, otherwise create one.
//! - Active identity with a different track, configuration, car or session
//!   type: always create a new record.
//! - Only the native session ids changed: keep the active identity.
//!
//! The active identity is published on a `watch` channel as an
//! `Arc<SessionIdentity>`; readers clone the `Arc` and never mutate it.
//! Every failure is returned to the caller and is non-fatal: timing and
//! local capture continue without remote persistence.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, StoreError, TelemetryError};
use crate::layout::{CarRef, SessionDescriptor, TrackRef};

pub mod store;

pub use store::{
    CarId, LapId, MemorySessionStore, NewLap, NewSession, SessionFilter, SessionId, SessionStore,
    TrackId, with_deadline,
};

/// The remote session laps are currently attributed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub session_id: SessionId,
    pub track_id: TrackId,
    pub car_id: CarId,
    pub track: TrackRef,
    pub car: CarRef,
    pub session_type: String,
    pub native_session_id: i64,
    pub native_sub_session_id: i64,
    pub resolved_at: DateTime<Utc>,
}

impl SessionIdentity {
    /// Same driving context as `descriptor`, ignoring native session ids.
    pub fn matches(&self, descriptor: &SessionDescriptor) -> bool {
        self.track == descriptor.track
            && self.car == descriptor.car
            && self.session_type == descriptor.session_type
    }

    fn same_records(
        &self,
        track_id: TrackId,
        car_id: CarId,
        descriptor: &SessionDescriptor,
    ) -> bool {
        self.track_id == track_id
            && self.car_id == car_id
            && self.track.config == descriptor.track.config
            && self.session_type == descriptor.session_type
    }
}

/// How a resolution settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// The active identity still applies
    Unchanged,
    /// An existing remote session was adopted
    Resumed,
    /// A new remote session was inserted
    Created,
}

/// Owner of the active [`SessionIdentity`].
pub struct SessionResolver {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
    active: watch::Sender<Option<Arc<SessionIdentity>>>,
}

impl SessionResolver {
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        let (active, _) = watch::channel(None);
        Self { store, config, active }
    }

    /// Follow the active identity.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<SessionIdentity>>> {
        self.active.subscribe()
    }

    pub fn active(&self) -> Option<Arc<SessionIdentity>> {
        self.active.borrow().clone()
    }

    /// Drop the active identity, e.g. when the simulator goes away.
    pub fn clear(&self) {
        if self.active.send_replace(None).is_some() {
            debug!("Active session cleared");
        }
    }

    /// Resolve a parsed session descriptor against the store.
    pub async fn resolve(
        &self,
        descriptor: &SessionDescriptor,
    ) -> Result<(Resolution, Arc<SessionIdentity>)> {
        let current = self.active();

        if let Some(active) = current.as_ref().filter(|active| active.matches(descriptor)) {
            if active.native_session_id != descriptor.native_session_id
                || active.native_sub_session_id != descriptor.native_sub_session_id
            {
                debug!(
                    session_id = %active.session_id,
                    native_session = descriptor.native_session_id,
                    "Native session ids changed, keeping active session"
                );
            }
            return Ok((Resolution::Unchanged, Arc::clone(active)));
        }

        let outcome = self.resolve_with_store(descriptor, current.as_deref()).await;
        match outcome {
            Ok((resolution, identity)) => {
                let identity = Arc::new(identity);
                if resolution != Resolution::Unchanged {
                    info!(
                        session_id = %identity.session_id,
                        ?resolution,
                        track = %identity.track.name,
                        car = %identity.car.name,
                        session_type = %identity.session_type,
                        "Session resolved"
                    );
                }
                self.active.send_replace(Some(Arc::clone(&identity)));
                Ok((resolution, identity))
            }
            Err(e) => {
                // The previous identity stays active; its context no longer matches, so the
                // next attempt takes the create path and the lap writer only binds laps of
                // that earlier context to it.
                if let Some(active) = current {
                    warn!(
                        error = %e,
                        session_id = %active.session_id,
                        "Session context changed and could not be resolved"
                    );
                }
                Err(e)
            }
        }
    }

    async fn resolve_with_store(
        &self,
        descriptor: &SessionDescriptor,
        current: Option<&SessionIdentity>,
    ) -> Result<(Resolution, SessionIdentity)> {
        let track_id = self
            .call("find_or_create_track", self.store.find_or_create_track(&descriptor.track))
            .await?;
        let car_id = self
            .call("find_or_create_car", self.store.find_or_create_car(&descriptor.car))
            .await?;

        if let Some(active) = current {
            if active.same_records(track_id, car_id, descriptor) {
                let mut identity = active.clone();
                identity.track = descriptor.track.clone();
                identity.car = descriptor.car.clone();
                return Ok((Resolution::Unchanged, identity));
            }
            // A changed context is never resumed.
            let session_id = self.create(descriptor, track_id, car_id).await?;
            let identity = self.identity(descriptor, session_id, track_id, car_id);
            return Ok((Resolution::Created, identity));
        }

        let filter = SessionFilter {
            user_id: self.config.user_id.clone(),
            track_id,
            car_id,
            session_type: descriptor.session_type.clone(),
            native_session_id: descriptor.native_session_id,
            native_sub_session_id: descriptor.native_sub_session_id,
        };
        let window = self.config.lookback(descriptor.is_offline());

        let found = self.call("find_session", self.store.find_session(&filter, window)).await?;

        if let Some(session_id) = found {
            let identity = self.identity(descriptor, session_id, track_id, car_id);
            return Ok((Resolution::Resumed, identity));
        }

        let session_id = self.create(descriptor, track_id, car_id).await?;
        Ok((Resolution::Created, self.identity(descriptor, session_id, track_id, car_id)))
    }

    async fn create(
        &self,
        descriptor: &SessionDescriptor,
        track_id: TrackId,
        car_id: CarId,
    ) -> Result<SessionId> {
        let session = NewSession {
            user_id: self.config.user_id.clone(),
            track_id,
            car_id,
            session_type: descriptor.session_type.clone(),
            native_session_id: descriptor.native_session_id,
            native_sub_session_id: descriptor.native_sub_session_id,
            started_at: Utc::now(),
        };
        self.call("create_session", self.store.create_session(&session)).await
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = std::result::Result<T, StoreError>>,
    ) -> Result<T> {
        with_deadline(self.config.store_timeout(), call)
            .await
            .map_err(|e| TelemetryError::store(operation, e))
    }

    fn identity(
        &self,
        descriptor: &SessionDescriptor,
        session_id: SessionId,
        track_id: TrackId,
        car_id: CarId,
    ) -> SessionIdentity {
        SessionIdentity {
            session_id,
            track_id,
            car_id,
            track: descriptor.track.clone(),
            car: descriptor.car.clone(),
            session_type: descriptor.session_type.clone(),
            native_session_id: descriptor.native_session_id,
            native_sub_session_id: descriptor.native_sub_session_id,
            resolved_at: Utc::now(),
        }
    }
}
