//! Ferry wire format: the header that precedes every chunk payload.
//!
//! This type IS the protocol between a sending gateway and a receiver.
//! Every field, every size and the byte order are part of the wire format;
//! sender and receiver must agree on `PROTOCOL_VERSION` out of band.
//!
//! The on-wire layout is a `#[repr(C)]` struct of big-endian zerocopy
//! integers, so there is no padding and no unsafe code in this module.
//!
//! ```text
//!  0        8    12       20       28 29   33
//!  | magic  |ver | chunk  | length |c | left |
//! ```

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Magic value opening every header: ASCII `FERRYHDR`.
pub const MAGIC: u64 = u64::from_be_bytes(*b"FERRYHDR");

/// Current header format version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Encoded header size in bytes.
pub const HEADER_LEN: usize = 33;

/// Default upper bound on a single bounded socket read (4 MiB).
pub const DEFAULT_RECV_BLOCK_SIZE: usize = 4 * 1024 * 1024;

// ── On-wire layout ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct RawChunkHeader {
    magic: U64<BigEndian>,
    version: U32<BigEndian>,
    chunk_id: U64<BigEndian>,
    data_len: U64<BigEndian>,
    /// 0 = raw payload, 1 = compressed. Any other value is rejected.
    is_compressed: u8,
    n_chunks_left_on_socket: U32<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(RawChunkHeader, [u8; HEADER_LEN]);

// ── Chunk Header ─────────────────────────────────────────────────────────────

/// Decoded chunk header.
///
/// One of these precedes every payload on a receiver connection. A header
/// whose `n_chunks_left_on_socket` is zero closes the current batch; the
/// connection may then carry another batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Identifies the chunk within the transfer job.
    pub chunk_id: u64,
    /// Exact byte length of the payload that follows the header.
    pub data_len: u64,
    /// Whether the payload was compressed upstream. Carried through untouched.
    pub is_compressed: bool,
    /// Chunks still to come on this connection after this one.
    pub n_chunks_left_on_socket: u32,
}

impl ChunkHeader {
    /// True when this header closes the current batch.
    pub fn ends_batch(&self) -> bool {
        self.n_chunks_left_on_socket == 0
    }

    /// Serialize to the fixed wire layout.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let raw = RawChunkHeader {
            magic: U64::new(MAGIC),
            version: U32::new(PROTOCOL_VERSION),
            chunk_id: U64::new(self.chunk_id),
            data_len: U64::new(self.data_len),
            is_compressed: u8::from(self.is_compressed),
            n_chunks_left_on_socket: U32::new(self.n_chunks_left_on_socket),
        };
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    /// Parse a header from the first `HEADER_LEN` bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let raw = RawChunkHeader::read_from_prefix(bytes).ok_or(WireError::Truncated(bytes.len()))?;

        let magic = raw.magic.get();
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let version = raw.version.get();
        if version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let is_compressed = match raw.is_compressed {
            0 => false,
            1 => true,
            other => return Err(WireError::InvalidCompressionFlag(other)),
        };

        Ok(Self {
            chunk_id: raw.chunk_id.get(),
            data_len: raw.data_len.get(),
            is_compressed,
            n_chunks_left_on_socket: raw.n_chunks_left_on_socket.get(),
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("header truncated: got {0} bytes, need {}", HEADER_LEN)]
    Truncated(usize),

    #[error("bad header magic: 0x{0:016x}")]
    BadMagic(u64),

    #[error("unsupported protocol version {0} (expected {})", PROTOCOL_VERSION)]
    UnsupportedVersion(u32),

    #[error("invalid compression flag: 0x{0:02x}")]
    InvalidCompressionFlag(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
