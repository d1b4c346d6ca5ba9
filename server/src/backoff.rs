//! Exponential reconnect backoff with uniform jitter.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

struct BackoffInner {
    attempt: u32,
    total_attempts: u64,
}

pub struct ReconnectStrategy {
    base: f64,
    max_delay: f64,
    multiplier: f64,
    jitter_factor: f64,
    /// 0 means unbounded.
    max_retries: u32,
    inner: Mutex<BackoffInner>,
}

impl ReconnectStrategy {
    pub fn new(base: f64, max_delay: f64, multiplier: f64, jitter_factor: f64, max_retries: u32) -> Self {
        Self {
            base,
            max_delay,
            multiplier,
            jitter_factor,
            max_retries,
            inner: Mutex::new(BackoffInner { attempt: 0, total_attempts: 0 }),
        }
    }

    /// Broker subscriber preset: 2 s → 120 s, retry forever.
    pub fn broker() -> Self {
        Self::new(2.0, 120.0, 2.0, 0.25, 0)
    }

    /// Collector preset: 1 s → 10 s, three retries.
    pub fn collector() -> Self {
        Self::new(1.0, 10.0, 2.0, 0.25, 3)
    }

    /// Delay before the next attempt: `base * multiplier^attempt` capped at
    /// `max_delay`, plus `uniform(0, delay * jitter_factor)`. Increments the
    /// attempt counter.
    pub fn next_delay(&self) -> Duration {
        let mut inner = self.inner.lock().unwrap();
        let raw = self.base * self.multiplier.powi(inner.attempt as i32);
        let delay = raw.min(self.max_delay);
        let jitter = if self.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(0.0..delay * self.jitter_factor)
        } else {
            0.0
        };
        inner.attempt = inner.attempt.saturating_add(1);
        inner.total_attempts += 1;
        Duration::from_secs_f64(delay + jitter)
    }

    pub fn should_retry(&self) -> bool {
        if self.max_retries == 0 {
            return true;
        }
        self.inner.lock().unwrap().attempt < self.max_retries
    }

    pub fn reset(&self) {
        self.inner.lock().unwrap().attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.inner.lock().unwrap().attempt
    }

    /// Lifetime attempt counter, kept across resets for diagnostics.
    pub fn total_attempts(&self) -> u64 {
        self.inner.lock().unwrap().total_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let s = ReconnectStrategy::new(1.0, 10.0, 2.0, 0.0, 0);
        assert_eq!(s.next_delay(), Duration::from_secs_f64(1.0));
        assert_eq!(s.next_delay(), Duration::from_secs_f64(2.0));
        assert_eq!(s.next_delay(), Duration::from_secs_f64(4.0));
        assert_eq!(s.next_delay(), Duration::from_secs_f64(8.0));
        assert_eq!(s.next_delay(), Duration::from_secs_f64(10.0));
        assert_eq!(s.next_delay(), Duration::from_secs_f64(10.0));
    }

    #[test]
    fn jitter_stays_in_band() {
        let s = ReconnectStrategy::new(4.0, 120.0, 2.0, 0.25, 0);
        for _ in 0..50 {
            s.reset();
            let d = s.next_delay().as_secs_f64();
            assert!((4.0..5.0).contains(&d), "delay {d} outside [4, 5)");
        }
    }

    #[test]
    fn retry_budget() {
        let s = ReconnectStrategy::collector();
        assert!(s.should_retry());
        s.next_delay();
        s.next_delay();
        s.next_delay();
        assert!(!s.should_retry());

        s.reset();
        assert!(s.should_retry());
        assert_eq!(s.total_attempts(), 3);
    }

    #[test]
    fn unbounded_preset_always_retries() {
        let s = ReconnectStrategy::broker();
        for _ in 0..200 {
            s.next_delay();
        }
        assert!(s.should_retry());
    }
}
