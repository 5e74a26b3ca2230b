//! ferry-core: wire format and configuration shared by all Ferry crates.

pub mod config;
pub mod wire;

pub use config::FerryConfig;
pub use wire::{ChunkHeader, WireError, HEADER_LEN};
