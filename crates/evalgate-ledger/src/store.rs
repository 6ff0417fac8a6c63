//! Single-writer state store.
//!
//! `StateStore` owns the committed [`LedgerState`]. Every mutation happens
//! inside one async critical section: the change is applied to a private copy,
//! persisted through the backend, and only then published. Readers always get
//! the last fully committed snapshot.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::aggregate::{apply_commit, CommitMeta};
use crate::backend::{FsLedgerBackend, LedgerBackend};
use crate::error::StoreResult;
use crate::schema::{Iteration, LedgerState, PipelineKind, ScoredResult};

pub struct StateStore {
    backend: Arc<dyn LedgerBackend>,
    writer: Mutex<()>,
    committed: RwLock<Arc<LedgerState>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Load the committed state from `backend`, or start empty.
    pub async fn open(backend: Arc<dyn LedgerBackend>) -> StoreResult<Self> {
        let state = match backend.load().await? {
            Some(state) => state,
            None => LedgerState::empty(Utc::now()),
        };
        info!(
            iterations = state.iterations.len(),
            last_iteration = state.meta.last_iteration,
            "ledger opened"
        );
        Ok(Self {
            backend,
            writer: Mutex::new(()),
            committed: RwLock::new(Arc::new(state)),
        })
    }

    /// Open a JSON artifact on local disk.
    pub async fn open_path(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open(Arc::new(FsLedgerBackend::new(path))).await
    }

    /// Commit `results` as a new iteration labelled `label`.
    pub async fn commit(
        &self,
        label: impl Into<String>,
        results: Vec<ScoredResult>,
    ) -> StoreResult<Iteration> {
        self.commit_with_meta(CommitMeta::new(label), results).await
    }

    pub async fn commit_with_meta(
        &self,
        meta: CommitMeta,
        results: Vec<ScoredResult>,
    ) -> StoreResult<Iteration> {
        let _writer = self.writer.lock().await;

        let current = Arc::clone(&*self.committed.read().await);
        let mut next = (*current).clone();
        let iteration = apply_commit(&mut next, meta, results, Utc::now());

        if let Err(e) = self.backend.persist(&next).await {
            warn!(
                event = "iteration.persist_failed",
                number = iteration.number,
                error = %e,
                "commit aborted, previous state kept"
            );
            return Err(e);
        }

        *self.committed.write().await = Arc::new(next);

        info!(
            event = "iteration.committed",
            number = iteration.number,
            id = %iteration.id,
            label = %iteration.label,
            results = iteration.results.len(),
            accuracy_pct = iteration.overall.accuracy_pct,
        );
        Ok(iteration)
    }

    /// The last committed snapshot.
    pub async fn read(&self) -> Arc<LedgerState> {
        Arc::clone(&*self.committed.read().await)
    }

    /// Archive the current artifact and start an empty history.
    ///
    /// Returns where the old artifact went, if there was one.
    pub async fn reset(&self) -> StoreResult<Option<String>> {
        let _writer = self.writer.lock().await;

        let archived = self.backend.archive().await?;
        let fresh = LedgerState::empty(Utc::now());
        let persisted = self.backend.persist(&fresh).await;
        // The artifact is archived either way, and a missing artifact loads
        // as empty, so the empty snapshot matches disk even if persist failed.
        *self.committed.write().await = Arc::new(fresh);
        if let Err(e) = persisted {
            warn!(event = "ledger.reset", archived = ?archived, error = %e, "fresh ledger not persisted");
            return Err(e);
        }

        info!(event = "ledger.reset", archived = ?archived);
        Ok(archived)
    }
}

// ---------------------------------------------------------------------------
// CommitBuffer
// ---------------------------------------------------------------------------

/// Staging area for results produced by concurrent workers.
///
/// Keyed by `(question_id, pipeline)`; a later push for the same key replaces
/// the earlier one. Draining hands the results to [`StateStore::commit`].
#[derive(Debug, Default)]
pub struct CommitBuffer {
    pending: Mutex<BTreeMap<(String, PipelineKind), ScoredResult>>,
}

impl CommitBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a result. Returns `true` if it replaced an earlier one.
    pub async fn push(&self, result: ScoredResult) -> bool {
        let key = (result.question_id().to_string(), result.pipeline());
        self.pending.lock().await.insert(key, result).is_some()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Take every staged result in canonical order.
    pub async fn drain(&self) -> Vec<ScoredResult> {
        let taken = std::mem::take(&mut *self.pending.lock().await);
        taken.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryLedgerBackend;
    use crate::schema::{ExecutionAttempt, MatchMethod};

    fn scored(qid: &str, correct: bool) -> ScoredResult {
        ScoredResult {
            attempt: ExecutionAttempt {
                question_id: qid.to_string(),
                pipeline: PipelineKind::Standard,
                iteration_id: "run".to_string(),
                attempt: 1,
                started_at: Utc::now(),
                latency_ms: 5,
                raw_response: Some("x".to_string()),
                error_kind: None,
                error_message: None,
                http_status: Some(200),
                execution_id: None,
                sources: Vec::new(),
                confidence: None,
            },
            correct,
            score: if correct { 1.0 } else { 0.0 },
            match_method: MatchMethod::F1Threshold,
            trace: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_commit_publishes_after_persist() {
        let backend = Arc::new(MemoryLedgerBackend::new());
        let store = StateStore::open(backend.clone()).await.unwrap();

        let it = store.commit("first", vec![scored("q1", true)]).await.unwrap();
        assert_eq!(it.number, 1);

        let snapshot = store.read().await;
        assert_eq!(snapshot.iterations.len(), 1);
        assert_eq!(backend.stored().unwrap().unwrap(), *snapshot);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_last_good_state() {
        let backend = Arc::new(MemoryLedgerBackend::new());
        let store = StateStore::open(backend.clone()).await.unwrap();
        store.commit("ok", vec![scored("q1", true)]).await.unwrap();

        backend.set_fail_persist(true);
        assert!(store.commit("lost", vec![scored("q2", true)]).await.is_err());

        let snapshot = store.read().await;
        assert_eq!(snapshot.meta.last_iteration, 1);
        assert!(!snapshot.question_registry.contains_key("q2"));

        // Numbering does not skip after a failed write.
        backend.set_fail_persist(false);
        let it = store.commit("retry", vec![scored("q2", true)]).await.unwrap();
        assert_eq!(it.number, 2);
    }

    #[tokio::test]
    async fn test_reset_archives_and_empties() {
        let backend = Arc::new(MemoryLedgerBackend::new());
        let store = StateStore::open(backend.clone()).await.unwrap();
        store.commit("a", vec![scored("q1", true)]).await.unwrap();

        let archived = store.reset().await.unwrap();
        assert!(archived.is_some());
        assert_eq!(backend.archived_count(), 1);
        assert!(store.read().await.iterations.is_empty());

        let it = store.commit("after reset", Vec::new()).await.unwrap();
        assert_eq!(it.number, 1);
    }

    #[tokio::test]
    async fn test_reset_with_failed_persist_matches_disk() {
        let backend = Arc::new(MemoryLedgerBackend::new());
        let store = StateStore::open(backend.clone()).await.unwrap();
        store.commit("a", vec![scored("q1", true)]).await.unwrap();

        backend.set_fail_persist(true);
        assert!(store.reset().await.is_err());
        assert_eq!(backend.archived_count(), 1);
        assert!(backend.stored().unwrap().is_none());
        assert!(store.read().await.iterations.is_empty());

        let reopened = StateStore::open(backend.clone()).await.unwrap();
        assert!(reopened.read().await.iterations.is_empty());

        backend.set_fail_persist(false);
        let it = store.commit("after failed reset", Vec::new()).await.unwrap();
        assert_eq!(it.number, 1);
    }

    #[tokio::test]
    async fn test_buffer_replaces_same_key() {
        let buffer = CommitBuffer::new();
        assert!(!buffer.push(scored("q2", false)).await);
        assert!(!buffer.push(scored("q1", false)).await);
        assert!(buffer.push(scored("q1", true)).await);
        assert_eq!(buffer.len().await, 2);

        let drained = buffer.drain().await;
        assert_eq!(
            drained.iter().map(|r| r.question_id()).collect::<Vec<_>>(),
            vec!["q1", "q2"]
        );
        assert!(drained[0].correct);
        assert!(buffer.is_empty().await);
    }
}
