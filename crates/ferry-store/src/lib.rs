//! ferry-store: the chunk store contract and a disk-backed implementation.

pub mod disk;
pub mod store;

pub use disk::{DiskChunkStore, StoreError};
pub use store::{ChunkMetadata, ChunkState, ChunkStore};
