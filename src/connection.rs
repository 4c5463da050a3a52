//! Connection state manager
//!
//! Gates how often the producer talks to the telemetry source while it is
//! unavailable. State is a small machine,
//!
//! ```text
//! Disconnected ──begin_attempt──► Connecting ──record_result(true)──► Connected
//!       ▲                              │                                  │
//!       └──────record_result(false)────┘◄────record_check(false)──────────┘
//! ```
//!
//! guarded by a single mutex. Callers read plain values out of it and never
//! hold the lock across source I/O.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ConnectionConfig;

const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A state change, returned so the caller can publish it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Consecutive failed attempts after this transition
    pub failure_count: u32,
    /// Wait required before the next attempt
    pub backoff: Duration,
}

/// Point-in-time connection statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub failure_count: u32,
    pub current_backoff: Duration,
    pub attempts_last_minute: usize,
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    last_attempt: Option<Instant>,
    last_check: Option<Instant>,
    failure_count: u32,
    attempts: VecDeque<Instant>,
}

impl Inner {
    fn cached(&self, now: Instant, ttl: Duration) -> Option<bool> {
        let checked = self.last_check?;
        (now.saturating_duration_since(checked) < ttl)
            .then_some(self.state == ConnectionState::Connected)
    }

    fn prune(&mut self, now: Instant) {
        while self
            .attempts
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= RATE_WINDOW)
        {
            self.attempts.pop_front();
        }
    }
}

/// Backoff- and rate-limited connection bookkeeping.
#[derive(Debug)]
pub struct ConnectionManager {
    config: ConnectionConfig,
    inner: Mutex<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                last_attempt: None,
                last_check: None,
                failure_count: 0,
                attempts: VecDeque::new(),
            }),
        }
    }

    /// Wait required after `failures` consecutive failures.
    ///
    /// Starts at the floor and doubles per further failure up to the cap.
    fn backoff_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
        self.config.backoff_floor().saturating_mul(factor).min(self.config.backoff_cap())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Cached connectivity if checked within the TTL.
    pub fn cached_state(&self, now: Instant) -> Option<bool> {
        self.inner.lock().cached(now, self.config.cache_ttl())
    }

    pub fn should_attempt(&self) -> bool {
        self.should_attempt_at(Instant::now())
    }

    /// Whether a connect attempt is allowed right now.
    ///
    /// False while a cached result is still valid, once the per-minute cap is
    /// reached, or before the backoff since the last attempt has elapsed.
    pub fn should_attempt_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();

        if inner.cached(now, self.config.cache_ttl()).is_some() {
            return false;
        }

        inner.prune(now);
        if inner.attempts.len() >= self.config.max_attempts_per_minute as usize {
            return false;
        }

        match inner.last_attempt {
            Some(last) => {
                now.saturating_duration_since(last) >= self.backoff_for(inner.failure_count)
            }
            None => true,
        }
    }

    /// Mark the start of a connect attempt.
    pub fn begin_attempt(&self, now: Instant) -> Option<ConnectionTransition> {
        let mut inner = self.inner.lock();
        inner.last_attempt = Some(now);
        inner.attempts.push_back(now);
        self.transition(&mut inner, ConnectionState::Connecting)
    }

    pub fn record_result(&self, connected: bool) -> Option<ConnectionTransition> {
        self.record_result_at(connected, Instant::now())
    }

    /// Outcome of a connect attempt; success resets backoff, failure doubles it.
    pub fn record_result_at(&self, connected: bool, now: Instant) -> Option<ConnectionTransition> {
        let mut inner = self.inner.lock();
        inner.last_check = Some(now);

        if connected {
            inner.failure_count = 0;
            self.transition(&mut inner, ConnectionState::Connected)
        } else {
            inner.failure_count = inner.failure_count.saturating_add(1);
            debug!(
                failures = inner.failure_count,
                backoff = ?self.backoff_for(inner.failure_count),
                "Connection attempt failed"
            );
            self.transition(&mut inner, ConnectionState::Disconnected)
        }
    }

    /// Outcome of a connectivity probe while connected; refreshes the cache.
    pub fn record_check(&self, connected: bool, now: Instant) -> Option<ConnectionTransition> {
        let mut inner = self.inner.lock();
        inner.last_check = Some(now);
        let target =
            if connected { ConnectionState::Connected } else { ConnectionState::Disconnected };
        self.transition(&mut inner, target)
    }

    /// Mark the source as lost without a probe.
    pub fn force_disconnect(&self, now: Instant) -> Option<ConnectionTransition> {
        let mut inner = self.inner.lock();
        inner.last_check = Some(now);
        info!("Connection marked disconnected");
        self.transition(&mut inner, ConnectionState::Disconnected)
    }

    /// Allow an immediate attempt: clears backoff, rate history and the cache.
    pub fn reset_backoff(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.last_attempt = None;
        inner.last_check = None;
        inner.attempts.clear();
        info!("Connection backoff reset");
    }

    pub fn snapshot(&self, now: Instant) -> ConnectionSnapshot {
        let mut inner = self.inner.lock();
        inner.prune(now);
        ConnectionSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            current_backoff: self.backoff_for(inner.failure_count),
            attempts_last_minute: inner.attempts.len(),
        }
    }

    fn transition(&self, inner: &mut Inner, to: ConnectionState) -> Option<ConnectionTransition> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        let transition = ConnectionTransition {
            from,
            to,
            failure_count: inner.failure_count,
            backoff: self.backoff_for(inner.failure_count),
        };
        debug!(?from, ?to, failures = inner.failure_count, "Connection state changed");
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(ConnectionConfig::default())
    }

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn fail(manager: &ConnectionManager, at: Instant) {
        manager.begin_attempt(at);
        manager.record_result_at(false, at);
    }

    #[test]
    fn first_attempt_is_allowed() {
        let m = manager();
        assert!(m.should_attempt_at(Instant::now()));
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn transitions_follow_state_machine() {
        let m = manager();
        let t0 = Instant::now();

        let connecting = m.begin_attempt(t0).unwrap();
        assert_eq!(
            (connecting.from, connecting.to),
            (ConnectionState::Disconnected, ConnectionState::Connecting)
        );

        let connected = m.record_result_at(true, t0).unwrap();
        assert_eq!(connected.to, ConnectionState::Connected);
        assert!(m.record_check(true, t0 + secs(3.0)).is_none());

        let lost = m.record_check(false, t0 + secs(6.0)).unwrap();
        assert_eq!(
            (lost.from, lost.to),
            (ConnectionState::Connected, ConnectionState::Disconnected)
        );
    }

    #[test]
    fn cached_state_blocks_probing_within_ttl() {
        let m = manager();
        let t0 = Instant::now();
        m.begin_attempt(t0);
        m.record_result_at(true, t0);

        assert_eq!(m.cached_state(t0 + secs(1.0)), Some(true));
        assert!(!m.should_attempt_at(t0 + secs(1.0)));
        assert_eq!(m.cached_state(t0 + secs(2.5)), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let m = manager();
        let mut t = Instant::now();
        let expected = [5.0, 10.0, 20.0, 30.0, 30.0];

        for wait in expected {
            fail(&m, t);
            assert_eq!(m.snapshot(t).current_backoff, secs(wait));
            assert!(!m.should_attempt_at(t + secs(wait - 0.5)));
            t += secs(wait) + RATE_WINDOW;
            assert!(m.should_attempt_at(t));
        }
    }

    #[test]
    fn success_resets_backoff() {
        let m = manager();
        let t0 = Instant::now();
        fail(&m, t0);
        fail(&m, t0 + secs(10.0));
        assert_eq!(m.snapshot(t0 + secs(10.0)).failure_count, 2);

        m.begin_attempt(t0 + secs(30.0));
        m.record_result_at(true, t0 + secs(30.0));
        let snapshot = m.snapshot(t0 + secs(30.0));
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.current_backoff, Duration::ZERO);
    }

    #[test]
    fn attempts_are_rate_limited_per_minute() {
        let config = ConnectionConfig {
            backoff_floor_secs: 0.001,
            backoff_cap_secs: 0.001,
            ..ConnectionConfig::default()
        };
        let m = ConnectionManager::new(config);
        let t0 = Instant::now();

        for i in 0..3 {
            let at = t0 + secs(3.0 * i as f64);
            assert!(m.should_attempt_at(at));
            fail(&m, at);
        }
        assert!(!m.should_attempt_at(t0 + secs(9.0)));
        assert_eq!(m.snapshot(t0 + secs(9.0)).attempts_last_minute, 3);
        assert!(m.should_attempt_at(t0 + secs(60.5)));
    }

    #[test]
    fn reset_allows_immediate_attempt() {
        let m = manager();
        let t0 = Instant::now();
        fail(&m, t0);
        assert!(!m.should_attempt_at(t0 + secs(3.0)));

        m.reset_backoff();
        assert!(m.should_attempt_at(t0 + secs(3.0)));
    }

    #[test]
    fn force_disconnect_marks_state() {
        let m = manager();
        let t0 = Instant::now();
        m.begin_attempt(t0);
        m.record_result_at(true, t0);

        let transition = m.force_disconnect(t0 + secs(5.0)).unwrap();
        assert_eq!(transition.to, ConnectionState::Disconnected);
        assert_eq!(m.cached_state(t0 + secs(5.5)), Some(false));
    }
}
