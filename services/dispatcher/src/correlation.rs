//! Echo-id correlation for in-flight API calls.
//!
//! Every forwarded api_call is recorded under its echo id together with the
//! side that originated it.  When the matching api_response arrives the
//! entry is taken (at-most-once delivery) and the response is routed back to
//! the origin.  Entries older than the TTL are evicted by a periodic
//! sweeper; the contract is best-effort, so evicted callers simply see no
//! reply.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Where an in-flight call came from, and therefore where its response goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A frontend session; the response is delivered to that session.
    Frontend(String),
    /// An upstream connection; the response is delivered to that upstream.
    Upstream(String),
    /// A call the dispatcher synthesized itself (reply injection); the
    /// response is swallowed.
    Synthetic,
}

struct Entry {
    origin: Origin,
    inserted_at: Instant,
    caller_gone: bool,
}

pub struct CorrelationTable {
    inner: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl CorrelationTable {
    pub fn new(ttl: Duration) -> Self {
        CorrelationTable {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn insert(&self, echo: &str, origin: Origin) {
        let mut map = self.inner.lock().await;
        map.insert(
            echo.to_owned(),
            Entry {
                origin,
                inserted_at: Instant::now(),
                caller_gone: false,
            },
        );
    }

    /// Remove and return the origin for `echo`.
    ///
    /// Returns `None` when the echo is unknown, expired, or its caller is
    /// gone — in every case the response must not be delivered.
    pub async fn take(&self, echo: &str) -> Option<Origin> {
        let mut map = self.inner.lock().await;
        let entry = map.remove(echo)?;
        if entry.caller_gone {
            return None;
        }
        if entry.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.origin)
    }

    /// Mark every entry originated by `session_id` as dead.  Future
    /// responses for those echoes are dropped; the sweeper reclaims them.
    pub async fn mark_frontend_gone(&self, session_id: &str) {
        let mut map = self.inner.lock().await;
        for entry in map.values_mut() {
            if matches!(&entry.origin, Origin::Frontend(sid) if sid == session_id) {
                entry.caller_gone = true;
            }
        }
    }

    /// Evict expired entries; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        before - map.len()
    }

    pub async fn in_flight(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Background sweeper; runs until shutdown.
pub async fn run_sweeper(table: Arc<CorrelationTable>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tick.tick() => {
                let evicted = table.sweep().await;
                if evicted > 0 {
                    debug!(evicted, "correlation entries expired");
                }
            }
        }
    }
}
