//! # breaker
//!
//! Per-upstream circuit breakers.
//!
//! Each named upstream (one per collector) gets a three-state breaker:
//! CLOSED lets traffic through, OPEN rejects it, HALF_OPEN admits a single
//! trial request after `recovery_timeout` has elapsed. Collectors call
//! `can_send()` before fetching and report the outcome back; the registry
//! creates breakers lazily by name and snapshots every state for
//! `/api/status`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::util::now_ts;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<i64>,
    total_successes: u64,
    total_failures: u64,
    total_rejected: u64,
    last_failure_time: Option<i64>,
    last_state_change_time: Option<i64>,
}

/// Point-in-time view of one breaker, as reported by `/api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_state_change_time: Option<i64>,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: i64,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: i64) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                total_successes: 0,
                total_failures: 0,
                total_rejected: 0,
                last_failure_time: None,
                last_state_change_time: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a request may be attempted right now. An OPEN breaker whose
    /// recovery timeout has elapsed transitions to HALF_OPEN and admits the
    /// trial request.
    pub fn can_send(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let now = now_ts();
                let elapsed = inner.opened_at.map(|t| now - t).unwrap_or(0);
                if elapsed >= self.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.last_state_change_time = Some(now);
                    tracing::info!("breaker {}: OPEN -> HALF_OPEN (trial request)", self.name);
                    true
                } else {
                    inner.total_rejected += 1;
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_successes += 1;
        if inner.state != BreakerState::Closed {
            tracing::info!("breaker {}: {:?} -> CLOSED", self.name, inner.state);
            inner.state = BreakerState::Closed;
            inner.last_state_change_time = Some(now_ts());
        }
        inner.failure_count = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ts();
        inner.total_failures += 1;
        inner.last_failure_time = Some(now);
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.last_state_change_time = Some(now);
                    tracing::warn!(
                        "breaker {}: CLOSED -> OPEN after {} consecutive failures",
                        self.name,
                        inner.failure_count
                    );
                }
            }
            BreakerState::HalfOpen => {
                // Trial request failed, back to OPEN with a fresh stamp
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.last_state_change_time = Some(now);
                tracing::warn!("breaker {}: HALF_OPEN -> OPEN (trial failed)", self.name);
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.last_state_change_time = Some(now_ts());
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejected: inner.total_rejected,
            last_failure_time: inner.last_failure_time,
            last_state_change_time: inner.last_state_change_time,
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Lazily creates one breaker per upstream name. Owned by the server for its
/// whole lifetime; shared by collectors and the status handler.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap();
        map.entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    name,
                    DEFAULT_FAILURE_THRESHOLD,
                    DEFAULT_RECOVERY_TIMEOUT_SECS,
                ))
            })
            .clone()
    }

    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let map = self.breakers.lock().unwrap();
        let mut out: Vec<BreakerSnapshot> = map.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.lock().unwrap().values() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let b = CircuitBreaker::new("test", 5, 60);
        for _ in 0..4 {
            b.record_failure();
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_send());
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = CircuitBreaker::new("test", 3, 60);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_trial_resolves_both_ways() {
        // Zero recovery timeout: first can_send after opening is the trial
        let b = CircuitBreaker::new("test", 1, 0);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.can_send());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        assert!(b.can_send());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().failure_count, 0);
    }

    #[test]
    fn open_rejections_are_counted() {
        let b = CircuitBreaker::new("test", 1, 3600);
        b.record_failure();
        assert!(!b.can_send());
        assert!(!b.can_send());
        assert_eq!(b.snapshot().total_rejected, 2);
    }

    #[test]
    fn registry_reset_all_closes_every_breaker() {
        let reg = BreakerRegistry::new();
        let a = reg.breaker("aredn");
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            a.record_failure();
        }
        assert_eq!(a.state(), BreakerState::Open);

        reg.reset_all();
        reg.breaker("aredn").record_success();
        for snap in reg.snapshot_all() {
            assert_eq!(snap.state, BreakerState::Closed);
        }
    }
}
