//! The chunk store contract consumed by the receiver.
//!
//! The store owns on-disk chunk files and the space budget they live in.
//! The receiver only writes into locations the store resolves for it and
//! asks the store for room before every write.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Routing metadata the planner attaches to a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Region the chunk is finally delivered to, e.g. "gcp:us-central1".
    pub destination_region: String,
}

/// Lifecycle of a chunk as seen by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    /// A receiver worker is pulling the payload off its socket.
    Downloading { worker_id: u32 },
    /// The payload is durable at the resolved path.
    Downloaded { bytes: u64, is_compressed: bool },
}

/// Space-bounded durable storage keyed by chunk id.
///
/// Implementations must make `try_reserve` atomic with respect to concurrent
/// callers; several socket workers share one store.
pub trait ChunkStore: Send + Sync + 'static {
    /// Where the payload for `chunk_id` is written. Deterministic and idempotent.
    fn resolve_path(&self, chunk_id: u64) -> PathBuf;

    /// Snapshot of the bytes still available.
    fn remaining_capacity(&self) -> u64;

    /// Claim `bytes` of space provided at least `required_free` is available.
    ///
    /// The default only consults `remaining_capacity` and claims nothing.
    fn try_reserve(&self, bytes: u64, required_free: u64) -> bool {
        let _ = bytes;
        self.remaining_capacity() >= required_free
    }

    /// Return space claimed by `try_reserve` that was never written.
    fn release(&self, _bytes: u64) {}

    fn lookup_metadata(&self, _chunk_id: u64) -> Option<ChunkMetadata> {
        None
    }

    fn on_receive_started(&self, _chunk_id: u64, _worker_id: u32) {}

    fn on_receive_finished(&self, _chunk_id: u64, _bytes: u64, _is_compressed: bool) {}

    /// The file at `resolve_path(chunk_id)` was deleted after a failed receive.
    ///
    /// Whatever the store recorded for that chunk is no longer on disk.
    fn discard(&self, _chunk_id: u64) {}
}
