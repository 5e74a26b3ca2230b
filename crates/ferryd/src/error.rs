//! Receiver error taxonomy.

use std::io;
use std::time::Duration;

use ferry_core::wire::{WireError, HEADER_LEN};

use crate::tls::TlsError;

/// Why a connection's receive loop stopped abnormally.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("malformed chunk header: {source}")]
    MalformedHeader {
        #[source]
        source: WireError,
        mid_batch: bool,
    },

    #[error("short read on header: connection closed after {received} of {} bytes", HEADER_LEN)]
    ShortHeader { received: usize, mid_batch: bool },

    #[error("connection closed mid-batch with {remaining} chunks still announced")]
    ClosedMidBatch { remaining: u32 },

    #[error("chunk {chunk_id} declares {data_len} bytes, limit is {limit}")]
    ChunkTooLarge {
        chunk_id: u64,
        data_len: u64,
        limit: u64,
    },

    #[error("short read on chunk {chunk_id}: connection closed after {received} of {expected} bytes")]
    ShortRead {
        chunk_id: u64,
        expected: u64,
        received: u64,
    },

    #[error("no read progress on chunk {chunk_id} for {}s ({received} bytes so far)", .after.as_secs())]
    Timeout {
        chunk_id: u64,
        received: u64,
        after: Duration,
    },

    #[error("chunk store cannot hold chunk {chunk_id}: need {required} bytes free, {remaining} remaining after waiting {}s", .waited.as_secs())]
    CapacityExhausted {
        chunk_id: u64,
        required: u64,
        remaining: u64,
        waited: Duration,
    },

    #[error("size mismatch on chunk {chunk_id}: persisted {actual} bytes, header declared {expected}")]
    SizeMismatch {
        chunk_id: u64,
        expected: u64,
        actual: u64,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        chunk_id: Option<u64>,
        #[source]
        source: io::Error,
    },
}

impl ReceiveError {
    /// Fatal errors raise the fault signal and drain the whole receiver.
    ///
    /// A bad header at a clean batch boundary only ends its own connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ReceiveError::MalformedHeader { mid_batch: false, .. }
                | ReceiveError::ShortHeader { mid_batch: false, .. }
        )
    }

    pub fn chunk_id(&self) -> Option<u64> {
        match self {
            ReceiveError::ChunkTooLarge { chunk_id, .. }
            | ReceiveError::ShortRead { chunk_id, .. }
            | ReceiveError::Timeout { chunk_id, .. }
            | ReceiveError::CapacityExhausted { chunk_id, .. }
            | ReceiveError::SizeMismatch { chunk_id, .. } => Some(*chunk_id),
            ReceiveError::Io { chunk_id, .. } => *chunk_id,
            _ => None,
        }
    }

    pub(crate) fn io(context: impl Into<String>, chunk_id: Option<u64>, source: io::Error) -> Self {
        ReceiveError::Io {
            context: context.into(),
            chunk_id,
            source,
        }
    }
}

/// Errors surfaced by the worker pool to its caller.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("no worker registered on port {0}")]
    NotFound(u16),

    #[error("port {0} is still held by a running worker")]
    PortInUse(u16),

    #[error("invalid bind address {0:?}")]
    BindAddr(String),

    #[error("failed to bind listening socket: {0}")]
    Bind(#[source] io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),
}
