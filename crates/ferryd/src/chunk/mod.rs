//! Chunk reception, the data plane.
//!
//! A connection carries batches of `[header][payload]` frames. The receive
//! loop pulls each payload off the socket in bounded reads, waits for room
//! in the chunk store, persists the chunk and validates its length before
//! moving on to the next header.

pub mod receive;

use std::time::Duration;

use ferry_core::config::FerryConfig;
use tokio_util::sync::CancellationToken;

use crate::error::ReceiveError;
use crate::telemetry::{ErrorReport, TelemetrySink};

pub use receive::{read_header, receive_batch, BatchOutcome};

/// Tunables for the receive loop, resolved once from config.
#[derive(Debug, Clone)]
pub struct ReceiveSettings {
    pub recv_block_size: usize,
    pub max_pending_chunks: u64,
    pub max_chunk_bytes: u64,
    pub read_timeout: Option<Duration>,
    pub capacity_poll_interval: Duration,
    pub capacity_wait_timeout: Duration,
    pub write_retries: u32,
    /// Region this receiver runs in. Empty if unknown.
    pub region: String,
}

impl ReceiveSettings {
    pub fn from_config(config: &FerryConfig) -> Self {
        Self {
            recv_block_size: config.receiver.recv_block_size.max(1),
            max_pending_chunks: config.receiver.max_pending_chunks,
            max_chunk_bytes: config.receiver.max_chunk_bytes,
            read_timeout: config.receiver.read_timeout(),
            capacity_poll_interval: config.store.capacity_poll_interval(),
            capacity_wait_timeout: config.store.capacity_wait_timeout(),
            write_retries: config.store.write_retries,
            region: config.receiver.region.clone(),
        }
    }
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self::from_config(&FerryConfig::default())
    }
}

/// Identity and shared handles of the worker running a receive loop.
///
/// Attached to every error report and profiling sample the loop emits.
#[derive(Clone)]
pub struct WorkerContext {
    pub worker_id: u32,
    pub port: u16,
    pub telemetry: TelemetrySink,
    /// Cancelled when the pool asks this worker to stop.
    pub stop: CancellationToken,
}

impl WorkerContext {
    /// True once this worker should stop taking new headers.
    pub fn should_exit(&self) -> bool {
        self.stop.is_cancelled() || self.telemetry.fault().is_raised()
    }

    pub fn report(&self, err: &ReceiveError) {
        let report = self.error_report(err);
        if err.is_fatal() {
            self.telemetry.fail(report);
        } else {
            self.telemetry.report(report);
        }
    }

    /// Report a failure outside the receive loop (accept, handshake) as fatal.
    pub fn fail(&self, description: String) {
        self.telemetry.fail(ErrorReport {
            worker_id: self.worker_id,
            port: self.port,
            chunk_id: None,
            description,
        });
    }

    fn error_report(&self, err: &ReceiveError) -> ErrorReport {
        ErrorReport {
            worker_id: self.worker_id,
            port: self.port,
            chunk_id: err.chunk_id(),
            description: err.to_string(),
        }
    }
}
