//! In-memory fakes for the ledger backend (testing only)
//!
//! `MemoryLedgerBackend` keeps the encoded artifact in memory so tests go
//! through the same encode/decode path as the filesystem backend, and can
//! inject persistence failures.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::backend::{decode_artifact, encode_artifact, LedgerBackend};
use crate::error::{StoreError, StoreResult};
use crate::schema::LedgerState;

// ---------------------------------------------------------------------------
// MemoryLedgerBackend
// ---------------------------------------------------------------------------

/// In-memory backend holding the current artifact bytes plus archived copies.
#[derive(Debug, Default)]
pub struct MemoryLedgerBackend {
    current: Mutex<Option<Vec<u8>>>,
    archived: Mutex<Vec<Vec<u8>>>,
    fail_persist: AtomicBool,
    persists: AtomicU64,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("memory backend lock poisoned".to_string())
}

impl MemoryLedgerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from raw artifact bytes, as if a file already existed.
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            current: Mutex::new(Some(bytes)),
            ..Self::default()
        }
    }

    /// Make every subsequent `persist` fail until cleared.
    pub fn set_fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    /// Number of successful persists.
    pub fn persist_count(&self) -> u64 {
        self.persists.load(Ordering::SeqCst)
    }

    /// Decode whatever is currently stored.
    pub fn stored(&self) -> StoreResult<Option<LedgerState>> {
        let current = self.current.lock().map_err(poisoned)?;
        current.as_deref().map(decode_artifact).transpose()
    }

    pub fn archived_count(&self) -> usize {
        self.archived.lock().map(|a| a.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LedgerBackend for MemoryLedgerBackend {
    async fn load(&self) -> StoreResult<Option<LedgerState>> {
        self.stored()
    }

    async fn persist(&self, state: &LedgerState) -> StoreResult<()> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected persist failure".to_string()));
        }
        let bytes = encode_artifact(state)?;
        *self.current.lock().map_err(poisoned)? = Some(bytes);
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn archive(&self) -> StoreResult<Option<String>> {
        let taken = self.current.lock().map_err(poisoned)?.take();
        match taken {
            Some(bytes) => {
                let mut archived = self.archived.lock().map_err(poisoned)?;
                archived.push(bytes);
                Ok(Some(format!("memory://archive/{}", archived.len())))
            }
            None => Ok(None),
        }
    }
}
