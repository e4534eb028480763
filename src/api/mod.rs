// Veritas Trust Engine: External Collaborator Interfaces
// The behavior persistence API is an external service (POST /behavior/session,
// POST /behavior/update, GET /behavior/baseline/{userId}); the engine only
// depends on the trait. When the remote store fails, writes divert to a local
// fallback and reads degrade to whatever the fallback holds.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;
use thiserror::Error;

use crate::behavior::BehaviorBaseline;
use crate::telemetry::{BehaviorMetrics, TelemetrySession};
use crate::utils::metrics::record_degraded_lookup;
use crate::utils::sanitize_for_log;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Behavior API unreachable: {0}")]
    Unreachable(String),

    #[error("Behavior API rejected the request: {0}")]
    Rejected(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait BehaviorPersistence: Send + Sync {
    /// POST /behavior/session
    async fn store_session(&self, session: &TelemetrySession) -> Result<(), PersistenceError>;

    /// POST /behavior/update
    async fn store_metrics(&self, metrics: &BehaviorMetrics) -> Result<(), PersistenceError>;

    /// GET /behavior/baseline/{userId}
    async fn fetch_baseline(
        &self,
        user_id: &str,
    ) -> Result<Option<BehaviorBaseline>, PersistenceError>;

    async fn store_baseline(&self, baseline: &BehaviorBaseline) -> Result<(), PersistenceError>;
}

///////////////////////////////////////////////////////////////////////////////
// In-memory store (local fallback and test double)
///////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
pub struct InMemoryBehaviorStore {
    sessions: Mutex<Vec<TelemetrySession>>,
    metrics: Mutex<Vec<BehaviorMetrics>>,
    baselines: Mutex<HashMap<String, BehaviorBaseline>>,
    // Number of upcoming writes that should fail, for failure-path tests
    failures_remaining: Mutex<u32>,
}

impl InMemoryBehaviorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_writes(&self, count: u32) {
        *self.failures_remaining.lock() = count;
    }

    fn take_failure(&self) -> bool {
        let mut remaining = self.failures_remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }

    pub fn sessions(&self) -> Vec<TelemetrySession> {
        self.sessions.lock().clone()
    }

    pub fn metrics(&self) -> Vec<BehaviorMetrics> {
        self.metrics.lock().clone()
    }

    pub fn baseline(&self, user_id: &str) -> Option<BehaviorBaseline> {
        self.baselines.lock().get(user_id).cloned()
    }

    pub fn seed_baseline(&self, baseline: BehaviorBaseline) {
        self.baselines
            .lock()
            .insert(baseline.user_id.clone(), baseline);
    }
}

#[async_trait]
impl BehaviorPersistence for InMemoryBehaviorStore {
    async fn store_session(&self, session: &TelemetrySession) -> Result<(), PersistenceError> {
        if self.take_failure() {
            return Err(PersistenceError::Unreachable("injected failure".into()));
        }
        self.sessions.lock().push(session.clone());
        Ok(())
    }

    async fn store_metrics(&self, metrics: &BehaviorMetrics) -> Result<(), PersistenceError> {
        if self.take_failure() {
            return Err(PersistenceError::Unreachable("injected failure".into()));
        }
        self.metrics.lock().push(metrics.clone());
        Ok(())
    }

    async fn fetch_baseline(
        &self,
        user_id: &str,
    ) -> Result<Option<BehaviorBaseline>, PersistenceError> {
        if self.take_failure() {
            return Err(PersistenceError::Unreachable("injected failure".into()));
        }
        Ok(self.baselines.lock().get(user_id).cloned())
    }

    async fn store_baseline(&self, baseline: &BehaviorBaseline) -> Result<(), PersistenceError> {
        if self.take_failure() {
            return Err(PersistenceError::Unreachable("injected failure".into()));
        }
        self.baselines
            .lock()
            .insert(baseline.user_id.clone(), baseline.clone());
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////
// Failover wrapper
///////////////////////////////////////////////////////////////////////////////

// Routes to the remote store and falls back to the local one on failure.
// Failed remote writes are additionally queued so a later drain can replay
// them against the remote.
pub struct FailoverBehaviorStore {
    remote: Arc<dyn BehaviorPersistence>,
    fallback: Arc<InMemoryBehaviorStore>,
    pending_baselines: Mutex<VecDeque<BehaviorBaseline>>,
}

impl FailoverBehaviorStore {
    pub fn new(remote: Arc<dyn BehaviorPersistence>, fallback: Arc<InMemoryBehaviorStore>) -> Self {
        FailoverBehaviorStore {
            remote,
            fallback,
            pending_baselines: Mutex::new(VecDeque::new()),
        }
    }

    /// Replay baseline writes that previously failed against the remote
    pub async fn drain_pending(&self) {
        loop {
            let pending = self.pending_baselines.lock().pop_front();
            let Some(baseline) = pending else { break };
            if self.remote.store_baseline(&baseline).await.is_err() {
                self.pending_baselines.lock().push_front(baseline);
                break;
            }
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.pending_baselines.lock().len()
    }
}

#[async_trait]
impl BehaviorPersistence for FailoverBehaviorStore {
    async fn store_session(&self, session: &TelemetrySession) -> Result<(), PersistenceError> {
        match self.remote.store_session(session).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "behavior API session write failed, using fallback: session={} reason={}",
                    session.id,
                    sanitize_for_log(&e.to_string())
                );
                record_degraded_lookup("behavior_api");
                self.fallback.store_session(session).await
            }
        }
    }

    async fn store_metrics(&self, metrics: &BehaviorMetrics) -> Result<(), PersistenceError> {
        match self.remote.store_metrics(metrics).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "behavior API metrics write failed, using fallback: session={} reason={}",
                    metrics.session_id,
                    sanitize_for_log(&e.to_string())
                );
                record_degraded_lookup("behavior_api");
                self.fallback.store_metrics(metrics).await
            }
        }
    }

    async fn fetch_baseline(
        &self,
        user_id: &str,
    ) -> Result<Option<BehaviorBaseline>, PersistenceError> {
        match self.remote.fetch_baseline(user_id).await {
            Ok(baseline) => Ok(baseline),
            Err(e) => {
                warn!(
                    "behavior API baseline read failed, using fallback: user={} reason={}",
                    user_id,
                    sanitize_for_log(&e.to_string())
                );
                record_degraded_lookup("behavior_api");
                Ok(self.fallback.baseline(user_id))
            }
        }
    }

    async fn store_baseline(&self, baseline: &BehaviorBaseline) -> Result<(), PersistenceError> {
        match self.remote.store_baseline(baseline).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    "behavior API baseline write failed, queuing: user={} reason={}",
                    baseline.user_id,
                    sanitize_for_log(&e.to_string())
                );
                record_degraded_lookup("behavior_api");
                self.pending_baselines.lock().push_back(baseline.clone());
                self.fallback.store_baseline(baseline).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::BehaviorBaseline;
    use chrono::Utc;

    fn baseline(user: &str) -> BehaviorBaseline {
        BehaviorBaseline::empty(user, Utc::now())
    }

    #[tokio::test]
    async fn test_failover_diverts_writes_to_fallback() {
        let remote = Arc::new(InMemoryBehaviorStore::new());
        let fallback = Arc::new(InMemoryBehaviorStore::new());
        let store = FailoverBehaviorStore::new(remote.clone(), fallback.clone());

        remote.fail_next_writes(1);
        store.store_baseline(&baseline("u1")).await.unwrap();

        assert!(remote.baseline("u1").is_none());
        assert!(fallback.baseline("u1").is_some());
        assert_eq!(store.pending_writes(), 1);
    }

    #[tokio::test]
    async fn test_failover_read_degrades_to_fallback() {
        let remote = Arc::new(InMemoryBehaviorStore::new());
        let fallback = Arc::new(InMemoryBehaviorStore::new());
        fallback.seed_baseline(baseline("u1"));
        let store = FailoverBehaviorStore::new(remote.clone(), fallback);

        remote.fail_next_writes(1);
        let fetched = store.fetch_baseline("u1").await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn test_drain_replays_pending_writes() {
        let remote = Arc::new(InMemoryBehaviorStore::new());
        let fallback = Arc::new(InMemoryBehaviorStore::new());
        let store = FailoverBehaviorStore::new(remote.clone(), fallback);

        remote.fail_next_writes(1);
        store.store_baseline(&baseline("u1")).await.unwrap();
        assert_eq!(store.pending_writes(), 1);

        store.drain_pending().await;
        assert_eq!(store.pending_writes(), 0);
        assert!(remote.baseline("u1").is_some());
    }
}
