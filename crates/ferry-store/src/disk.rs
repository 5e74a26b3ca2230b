//! Disk-backed chunk store with a byte budget.
//!
//! Chunks live flat under the root directory as `{chunk_id:08}.chunk`.
//! Space accounting is an atomic counter of bytes persisted plus bytes
//! reserved by in-flight writers, so concurrent receivers cannot
//! collectively overcommit the budget.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::store::{ChunkMetadata, ChunkState, ChunkStore};

const CHUNK_EXT: &str = "chunk";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create store root {0}: {1}")]
    CreateRoot(PathBuf, std::io::Error),
    #[error("failed to scan store root {0}: {1}")]
    Scan(PathBuf, std::io::Error),
    #[error("failed to remove chunk {0}: {1}")]
    Remove(PathBuf, std::io::Error),
}

/// Space-bounded chunk store.
#[derive(Clone)]
pub struct DiskChunkStore {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    /// 0 = unlimited.
    capacity: u64,
    /// Persisted + reserved bytes.
    used: AtomicU64,
    /// Size of the file currently on disk per chunk.
    persisted: DashMap<u64, u64>,
    states: DashMap<u64, ChunkState>,
    metadata: DashMap<u64, ChunkMetadata>,
}

impl DiskChunkStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    ///
    /// Chunk files already present count against `capacity`.
    pub fn open(root: impl Into<PathBuf>, capacity: u64) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::CreateRoot(root.clone(), e))?;

        let persisted = DashMap::new();
        let mut used = 0u64;
        let entries = fs::read_dir(&root).map_err(|e| StoreError::Scan(root.clone(), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(chunk_id) = parse_chunk_id(&path) else {
                continue;
            };
            if let Ok(meta) = entry.metadata() {
                used += meta.len();
                persisted.insert(chunk_id, meta.len());
            }
        }

        tracing::debug!(root = %root.display(), capacity, used, "chunk store opened");

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                capacity,
                used: AtomicU64::new(used),
                persisted,
                states: DashMap::new(),
                metadata: DashMap::new(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Bytes persisted or reserved.
    pub fn used(&self) -> u64 {
        self.inner.used.load(Ordering::Acquire)
    }

    pub fn state(&self, chunk_id: u64) -> Option<ChunkState> {
        self.inner.states.get(&chunk_id).map(|s| *s)
    }

    /// Attach routing metadata for a chunk ahead of its arrival.
    pub fn set_metadata(&self, chunk_id: u64, metadata: ChunkMetadata) {
        self.inner.metadata.insert(chunk_id, metadata);
    }

    /// Delete a persisted chunk and return its space to the budget.
    ///
    /// Returns false if the chunk was not on disk.
    pub fn remove(&self, chunk_id: u64) -> Result<bool, StoreError> {
        let Some((_, bytes)) = self.inner.persisted.remove(&chunk_id) else {
            return Ok(false);
        };
        let path = self.resolve_path(chunk_id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                self.inner.persisted.insert(chunk_id, bytes);
                return Err(StoreError::Remove(path, e));
            }
        }
        self.release(bytes);
        self.inner.states.remove(&chunk_id);
        tracing::trace!(chunk_id, bytes, "chunk removed from store");
        Ok(true)
    }

    /// Number of chunks on disk.
    pub fn count(&self) -> usize {
        self.inner.persisted.len()
    }
}

impl ChunkStore for DiskChunkStore {
    fn resolve_path(&self, chunk_id: u64) -> PathBuf {
        self.inner.root.join(format!("{chunk_id:08}.{CHUNK_EXT}"))
    }

    fn remaining_capacity(&self) -> u64 {
        if self.inner.capacity == 0 {
            return u64::MAX;
        }
        self.inner.capacity.saturating_sub(self.used())
    }

    fn try_reserve(&self, bytes: u64, required_free: u64) -> bool {
        let capacity = self.inner.capacity;
        self.inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                if capacity != 0 && capacity.saturating_sub(used) < required_free.max(bytes) {
                    return None;
                }
                Some(used.saturating_add(bytes))
            })
            .is_ok()
    }

    fn release(&self, bytes: u64) {
        let _ = self
            .inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    fn lookup_metadata(&self, chunk_id: u64) -> Option<ChunkMetadata> {
        self.inner.metadata.get(&chunk_id).map(|m| m.clone())
    }

    fn on_receive_started(&self, chunk_id: u64, worker_id: u32) {
        self.inner
            .states
            .insert(chunk_id, ChunkState::Downloading { worker_id });
    }

    fn on_receive_finished(&self, chunk_id: u64, bytes: u64, is_compressed: bool) {
        // The reservation for `bytes` is now backed by the file; a file it
        // replaced no longer occupies space.
        if let Some(previous) = self.inner.persisted.insert(chunk_id, bytes) {
            self.release(previous);
        }
        self.inner.states.insert(
            chunk_id,
            ChunkState::Downloaded {
                bytes,
                is_compressed,
            },
        );
        tracing::trace!(chunk_id, bytes, "chunk persisted");
    }

    fn discard(&self, chunk_id: u64) {
        if let Some((_, bytes)) = self.inner.persisted.remove(&chunk_id) {
            self.release(bytes);
            tracing::trace!(chunk_id, bytes, "stale chunk dropped from accounting");
        }
        self.inner.states.remove(&chunk_id);
    }
}

fn parse_chunk_id(path: &Path) -> Option<u64> {
    if path.extension()? != CHUNK_EXT {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}
