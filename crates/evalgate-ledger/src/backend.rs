//! Storage backends for the ledger artifact.
//!
//! The store never writes files itself; it hands a fully merged
//! [`LedgerState`] to a [`LedgerBackend`]. The filesystem backend writes the
//! artifact atomically (temp file in the same directory, then rename) so a
//! crash mid-write leaves the previous artifact intact.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::schema::{LedgerState, SCHEMA_VERSION};

/// Persistence interface for the ledger artifact.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Load the last committed artifact, `None` when nothing was persisted yet.
    async fn load(&self) -> StoreResult<Option<LedgerState>>;

    /// Replace the committed artifact with `state`. Must be all-or-nothing.
    async fn persist(&self, state: &LedgerState) -> StoreResult<()>;

    /// Move the current artifact out of the way. Returns where it went.
    async fn archive(&self) -> StoreResult<Option<String>>;
}

/// Serialize a state into the on-disk representation.
pub fn encode_artifact(state: &LedgerState) -> StoreResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(state)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse an artifact, checking `meta.schema_version` before anything else.
pub fn decode_artifact(bytes: &[u8]) -> StoreResult<LedgerState> {
    let raw: serde_json::Value = serde_json::from_slice(bytes)?;

    let found = raw
        .get("meta")
        .and_then(|m| m.get("schema_version"))
        .and_then(|v| v.as_u64())
        .ok_or_else(|| StoreError::Corrupt("missing meta.schema_version".to_string()))?;
    if found != u64::from(SCHEMA_VERSION) {
        return Err(StoreError::SchemaVersion {
            found: u32::try_from(found).unwrap_or(u32::MAX),
            expected: SCHEMA_VERSION,
        });
    }

    let state: LedgerState = serde_json::from_value(raw)?;
    state.validate().map_err(StoreError::Corrupt)?;
    Ok(state)
}

// ---------------------------------------------------------------------------
// FsLedgerBackend
// ---------------------------------------------------------------------------

/// Single JSON file on local disk.
#[derive(Debug, Clone)]
pub struct FsLedgerBackend {
    path: PathBuf,
}

impl FsLedgerBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

fn write_atomically(path: &Path, dir: &Path, bytes: &[u8]) -> StoreResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

#[async_trait]
impl LedgerBackend for FsLedgerBackend {
    async fn load(&self) -> StoreResult<Option<LedgerState>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let state = decode_artifact(&bytes)?;
                debug!(path = %self.path.display(), iterations = state.iterations.len(), "ledger loaded");
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    async fn persist(&self, state: &LedgerState) -> StoreResult<()> {
        let bytes = encode_artifact(state)?;
        let path = self.path.clone();
        let dir = self.parent_dir();

        tokio::task::spawn_blocking(move || write_atomically(&path, &dir, &bytes))
            .await
            .map_err(|e| StoreError::Backend(format!("persist task failed: {e}")))??;

        debug!(path = %self.path.display(), "ledger persisted");
        Ok(())
    }

    async fn archive(&self) -> StoreResult<Option<String>> {
        if tokio::fs::metadata(&self.path).await.is_err() {
            return Ok(None);
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "ledger.json".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let target = self
            .parent_dir()
            .join(format!("{file_name}.{stamp}.bak"));

        tokio::fs::rename(&self.path, &target)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        info!(from = %self.path.display(), to = %target.display(), "ledger archived");
        Ok(Some(target.display().to_string()))
    }
}
