//! # collectors
//!
//! The collector framework and its four sources.
//!
//! A source implements one thing: `fetch()`, returning a feature sequence
//! or an error. Everything around it (result cache, bounded retry with
//! backoff, circuit breaking, stale fallback) lives in [`Collector`],
//! which wraps a boxed source and exposes the uniform `collect()` the
//! aggregator calls. A collector never returns an error: after the retry
//! budget it serves the stale cache, and with no cache it serves nothing.

pub mod aredn;
pub mod hamclock;
pub mod meshtastic;
pub mod reticulum;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use mesh_model::{Feature, Network};

use crate::backoff::ReconnectStrategy;
use crate::breaker::CircuitBreaker;
use crate::lifecycle::Shutdown;
use crate::util::now_ts;

// ── Fetch errors ──────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network-level failure; worth retrying.
    #[error("transport: {0}")]
    Transport(String),
    /// Malformed response; the same request would fail again.
    #[error("parse: {0}")]
    Parse(String),
    /// The upstream is reachable but has nothing usable yet.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Parse(_))
    }
}

// ── Source hook ───────────────────────────────────────────────────────────────

/// The single polymorphism point of the framework.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;
    fn network(&self) -> Network;
    async fn fetch(&self) -> Result<Vec<Feature>, FetchError>;
}

// ── Harness ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CollectorHealth {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_time: Option<i64>,
    pub total_collections: u64,
    pub total_errors: u64,
    pub cache_hits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_seconds: Option<i64>,
}

#[derive(Default)]
struct HarnessState {
    cache: Option<Vec<Feature>>,
    cached_at: Option<i64>,
    last_error: Option<String>,
    last_error_time: Option<i64>,
    last_success_time: Option<i64>,
    total_collections: u64,
    total_errors: u64,
    cache_hits: u64,
}

pub struct Collector {
    source: Box<dyn Source>,
    breaker: Arc<CircuitBreaker>,
    reconnect: ReconnectStrategy,
    shutdown: Shutdown,
    state: Mutex<HarnessState>,
}

impl Collector {
    pub fn new(source: Box<dyn Source>, breaker: Arc<CircuitBreaker>, shutdown: Shutdown) -> Self {
        Self {
            source,
            breaker,
            reconnect: ReconnectStrategy::collector(),
            shutdown,
            state: Mutex::new(HarnessState::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.source.name()
    }

    pub fn network(&self) -> Network {
        self.source.network()
    }

    fn serve_cache(&self, reason: &str) -> Vec<Feature> {
        let mut state = self.state.lock().unwrap();
        state.total_collections += 1;
        match &state.cache {
            Some(cached) => {
                let features = cached.clone();
                state.cache_hits += 1;
                debug!("{}: serving {} cached features ({reason})", self.name(), features.len());
                features
            }
            None => Vec::new(),
        }
    }

    /// The template: breaker gate, bounded retry with backoff, cache
    /// refresh on success, stale fallback on exhaustion.
    pub async fn collect(&self) -> Vec<Feature> {
        if !self.breaker.can_send() {
            return self.serve_cache("circuit open");
        }

        self.reconnect.reset();
        loop {
            match self.source.fetch().await {
                Ok(features) => {
                    self.breaker.record_success();
                    let mut state = self.state.lock().unwrap();
                    state.cache = Some(features.clone());
                    state.cached_at = Some(now_ts());
                    state.last_success_time = Some(now_ts());
                    state.total_collections += 1;
                    return features;
                }
                Err(e) => {
                    {
                        let mut state = self.state.lock().unwrap();
                        state.last_error = Some(e.to_string());
                        state.last_error_time = Some(now_ts());
                        state.total_errors += 1;
                    }
                    if e.is_retryable() && self.reconnect.should_retry() {
                        let delay = self.reconnect.next_delay();
                        debug!("{}: fetch failed ({e}), retrying in {delay:?}", self.name());
                        if !self.shutdown.sleep(delay).await {
                            break;
                        }
                        continue;
                    }
                    warn!("{}: fetch failed: {e}", self.name());
                    break;
                }
            }
        }

        self.breaker.record_failure();
        self.serve_cache("stale fallback")
    }

    pub fn health_info(&self) -> CollectorHealth {
        let state = self.state.lock().unwrap();
        CollectorHealth {
            name: self.name().to_string(),
            last_error: state.last_error.clone(),
            last_error_time: state.last_error_time,
            last_success_time: state.last_success_time,
            total_collections: state.total_collections,
            total_errors: state.total_errors,
            cache_hits: state.cache_hits,
            cache_age_seconds: state.cached_at.map(|t| now_ts() - t),
        }
    }

    pub fn cache_hit_ratio(&self) -> f64 {
        let state = self.state.lock().unwrap();
        if state.total_collections == 0 {
            0.0
        } else {
            state.cache_hits as f64 / state.total_collections as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::shutdown_pair;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted source: a queue of canned fetch outcomes.
    struct Scripted {
        outcomes: Mutex<Vec<Result<Vec<Feature>, FetchError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<Vec<Feature>, FetchError>>) -> Self {
            Self { outcomes: Mutex::new(outcomes), calls: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl Source for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn network(&self) -> Network {
            Network::Aredn
        }
        async fn fetch(&self) -> Result<Vec<Feature>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                Err(FetchError::Transport("script exhausted".into()))
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn feature() -> Feature {
        Feature::new("deadbeef").with_geometry(1.0, 2.0)
    }

    fn collector(outcomes: Vec<Result<Vec<Feature>, FetchError>>, breaker: Arc<CircuitBreaker>) -> Collector {
        let (_ctl, shutdown) = shutdown_pair();
        std::mem::forget(_ctl);
        Collector::new(Box::new(Scripted::new(outcomes)), breaker, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn success_refreshes_cache() {
        let breaker = Arc::new(CircuitBreaker::new("t", 5, 60));
        let c = collector(vec![Ok(vec![feature()])], breaker);
        let out = c.collect().await;
        assert_eq!(out.len(), 1);
        let health = c.health_info();
        assert_eq!(health.total_collections, 1);
        assert!(health.last_success_time.is_some());
        assert_eq!(health.cache_age_seconds, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_stale_fallback() {
        let breaker = Arc::new(CircuitBreaker::new("t", 5, 60));
        let c = collector(
            vec![
                Ok(vec![feature()]),
                Err(FetchError::Transport("down".into())),
                Err(FetchError::Transport("down".into())),
                Err(FetchError::Transport("down".into())),
                Err(FetchError::Transport("down".into())),
            ],
            breaker.clone(),
        );
        assert_eq!(c.collect().await.len(), 1);
        // 1 attempt + 3 retries, all failing → stale cache served
        let out = c.collect().await;
        assert_eq!(out.len(), 1);
        assert_eq!(c.health_info().cache_hits, 1);
        assert_eq!(breaker.snapshot().total_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parse_error_is_not_retried() {
        let breaker = Arc::new(CircuitBreaker::new("t", 5, 60));
        let c = collector(vec![Err(FetchError::Parse("bad json".into()))], breaker);
        let out = c.collect().await;
        assert!(out.is_empty());
        // A second scripted outcome was never consumed
        assert_eq!(c.health_info().total_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_skips_fetch_and_serves_cache() {
        let breaker = Arc::new(CircuitBreaker::new("t", 1, 3600));
        let c = collector(vec![Ok(vec![feature()])], breaker.clone());
        c.collect().await;
        breaker.record_failure(); // trips at threshold 1

        let out = c.collect().await;
        assert_eq!(out.len(), 1);
        let health = c.health_info();
        assert_eq!(health.cache_hits, 1);
        // No fetch error recorded; the source was never called
        assert_eq!(health.total_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_cache_no_data() {
        let breaker = Arc::new(CircuitBreaker::new("t", 5, 60));
        let c = collector(
            vec![
                Err(FetchError::Transport("down".into())),
                Err(FetchError::Transport("down".into())),
                Err(FetchError::Transport("down".into())),
                Err(FetchError::Transport("down".into())),
            ],
            breaker,
        );
        assert!(c.collect().await.is_empty());
        assert_eq!(c.health_info().total_errors, 4);
    }
}
