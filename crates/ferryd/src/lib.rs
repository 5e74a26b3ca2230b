//! Receiving side of a cross-cloud transfer gateway.
//!
//! A `GatewayReceiver` runs one socket worker per port. Each worker accepts a
//! single sender connection (TLS by default), reads `[header][payload]`
//! batches off it and persists every chunk into a shared `ChunkStore`.
//! Any fatal error on any worker raises a shared fault signal that stops
//! the whole pool.

pub mod chunk;
pub mod error;
pub mod receiver;
pub mod telemetry;
pub mod tls;
mod worker;

pub use chunk::{BatchOutcome, ReceiveSettings};
pub use error::{ReceiveError, ReceiverError};
pub use receiver::GatewayReceiver;
pub use telemetry::{
    ErrorReport, FaultSignal, ProfilingSample, TelemetryDrain, TelemetryEvent, TelemetrySink,
};
pub use tls::{pinned_client_config, ServerTls, TlsError};
