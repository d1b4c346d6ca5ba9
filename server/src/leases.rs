//! # leases
//!
//! Named single-holder leases for process-external resources, keyed
//! `host:port`. The Meshtastic collector takes a lease around calls to the
//! local node HTTP API so only one task talks to the radio at a time.
//!
//! A lease is an owned semaphore permit wrapped in an RAII guard: release
//! happens on every exit path, including panic unwinding and timeout
//! cancellation, and is safe across threads. Each `LeaseManager` instance
//! owns its own lock table, so independent managers can never collide on a
//! name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Default, Serialize)]
pub struct LeaseStats {
    pub acquisitions: u64,
    pub timeouts: u64,
    pub releases: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currently_held_by: Option<String>,
    /// Seconds the current holder has held the lease, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_duration: Option<f64>,
}

struct LeaseEntry {
    semaphore: Arc<Semaphore>,
    acquisitions: u64,
    timeouts: u64,
    releases: u64,
    holder: Option<(String, Instant)>,
}

impl LeaseEntry {
    fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            acquisitions: 0,
            timeouts: 0,
            releases: 0,
            holder: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("lease {0:?} not acquired within {1:?}")]
pub struct LeaseTimeout(pub String, pub Duration);

#[derive(Default)]
pub struct LeaseManager {
    entries: Mutex<HashMap<String, LeaseEntry>>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the named lease, waiting up to `timeout`. The returned guard
    /// releases on drop.
    pub async fn acquire(
        self: &Arc<Self>,
        name: &str,
        holder: &str,
        timeout: Duration,
    ) -> Result<LeaseGuard, LeaseTimeout> {
        let semaphore = {
            let mut entries = self.entries.lock().unwrap();
            entries
                .entry(name.to_string())
                .or_insert_with(LeaseEntry::new)
                .semaphore
                .clone()
        };

        let permit = match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            // acquire_owned only errs if the semaphore is closed, which we never do
            Ok(Err(_)) | Err(_) => {
                let mut entries = self.entries.lock().unwrap();
                if let Some(entry) = entries.get_mut(name) {
                    entry.timeouts += 1;
                }
                return Err(LeaseTimeout(name.to_string(), timeout));
            }
        };

        {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.get_mut(name).expect("lease entry exists");
            entry.acquisitions += 1;
            entry.holder = Some((holder.to_string(), Instant::now()));
        }

        Ok(LeaseGuard {
            manager: self.clone(),
            name: name.to_string(),
            _permit: permit,
        })
    }

    fn released(&self, name: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(name) {
            entry.releases += 1;
            entry.holder = None;
        }
    }

    pub fn stats(&self) -> HashMap<String, LeaseStats> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|(name, e)| {
                (
                    name.clone(),
                    LeaseStats {
                        acquisitions: e.acquisitions,
                        timeouts: e.timeouts,
                        releases: e.releases,
                        currently_held_by: e.holder.as_ref().map(|(h, _)| h.clone()),
                        held_duration: e.holder.as_ref().map(|(_, t)| t.elapsed().as_secs_f64()),
                    },
                )
            })
            .collect()
    }
}

/// Scoped lease handle. Dropping it releases the underlying permit on any
/// exit path.
pub struct LeaseGuard {
    manager: Arc<LeaseManager>,
    name: String,
    _permit: OwnedSemaphorePermit,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.manager.released(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let mgr = Arc::new(LeaseManager::new());
        let guard = mgr
            .acquire("radio:8080", "collector", Duration::from_millis(50))
            .await
            .unwrap();

        let err = mgr
            .acquire("radio:8080", "other", Duration::from_millis(20))
            .await;
        assert!(err.is_err());

        drop(guard);
        let again = mgr
            .acquire("radio:8080", "other", Duration::from_millis(50))
            .await;
        assert!(again.is_ok());

        let stats = mgr.stats();
        let s = &stats["radio:8080"];
        assert_eq!(s.acquisitions, 2);
        assert_eq!(s.timeouts, 1);
        assert_eq!(s.releases, 1);
        assert_eq!(s.currently_held_by.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn distinct_names_do_not_contend() {
        let mgr = Arc::new(LeaseManager::new());
        let _a = mgr.acquire("a:1", "x", Duration::from_millis(20)).await.unwrap();
        let b = mgr.acquire("b:1", "y", Duration::from_millis(20)).await;
        assert!(b.is_ok());
    }
}
