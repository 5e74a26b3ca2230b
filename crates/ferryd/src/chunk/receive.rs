//! Per-connection receive loop.
//!
//! Strictly sequential: header, payload, persist, validate, repeat. A batch
//! ends on the header whose `n_chunks_left_on_socket` is zero; a clean close
//! is only legal before the first header of a batch.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use ferry_core::wire::{ChunkHeader, HEADER_LEN};
use ferry_store::ChunkStore;

use super::{ReceiveSettings, WorkerContext};
use crate::error::ReceiveError;
use crate::telemetry::ProfilingSample;

/// How a call to `receive_batch` ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The sentinel header's payload was persisted. The connection can carry another batch.
    Complete { chunks: u64, bytes: u64 },
    /// The peer closed the connection before the first header of a batch.
    Closed,
    /// A stop request or the fault signal was observed.
    Interrupted,
}

enum ReadOutcome {
    Data(usize),
    Eof,
    TimedOut,
}

/// Read one header, blocking until all `HEADER_LEN` bytes arrive.
///
/// `Ok(None)` means the stream ended before its first byte.
pub async fn read_header<S>(
    stream: &mut S,
    mid_batch: bool,
) -> Result<Option<ChunkHeader>, ReceiveError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // rustls reports a peer that hung up without close_notify this way
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(ReceiveError::io("header read failed", None, e)),
        }
    }

    match filled {
        0 => Ok(None),
        HEADER_LEN => ChunkHeader::decode(&buf)
            .map(Some)
            .map_err(|source| ReceiveError::MalformedHeader { source, mid_batch }),
        received => Err(ReceiveError::ShortHeader {
            received,
            mid_batch,
        }),
    }
}

/// Receive one batch from `stream` into `store`.
pub async fn receive_batch<S>(
    stream: &mut S,
    store: &Arc<dyn ChunkStore>,
    ctx: &WorkerContext,
    settings: &ReceiveSettings,
) -> Result<BatchOutcome, ReceiveError>
where
    S: AsyncRead + Unpin,
{
    let mut chunks = 0u64;
    let mut bytes = 0u64;
    // Chunks the previous header said were still coming.
    let mut announced: Option<u32> = None;

    loop {
        tracing::trace!(port = ctx.port, "blocking for next header");
        let header = tokio::select! {
            biased;
            _ = ctx.telemetry.fault().raised() => return Ok(BatchOutcome::Interrupted),
            _ = ctx.stop.cancelled() => return Ok(BatchOutcome::Interrupted),
            header = read_header(stream, announced.is_some()) => header?,
        };

        let Some(header) = header else {
            return match announced {
                None => Ok(BatchOutcome::Closed),
                Some(remaining) => Err(ReceiveError::ClosedMidBatch { remaining }),
            };
        };

        tracing::debug!(
            port = ctx.port,
            chunk_id = header.chunk_id,
            data_len = header.data_len,
            is_compressed = header.is_compressed,
            n_chunks_left = header.n_chunks_left_on_socket,
            "got chunk header"
        );

        if !receive_chunk(stream, store, ctx, settings, &header).await? {
            return Ok(BatchOutcome::Interrupted);
        }
        chunks += 1;
        bytes += header.data_len;

        if header.ends_batch() {
            tracing::debug!(port = ctx.port, chunks, bytes, "end of batch");
            return Ok(BatchOutcome::Complete { chunks, bytes });
        }
        announced = Some(header.n_chunks_left_on_socket);
    }
}

/// Pull one payload off the socket and persist it. `false` if abandoned on fault.
async fn receive_chunk<S>(
    stream: &mut S,
    store: &Arc<dyn ChunkStore>,
    ctx: &WorkerContext,
    settings: &ReceiveSettings,
    header: &ChunkHeader,
) -> Result<bool, ReceiveError>
where
    S: AsyncRead + Unpin,
{
    let chunk_id = header.chunk_id;
    if header.data_len > settings.max_chunk_bytes {
        return Err(ReceiveError::ChunkTooLarge {
            chunk_id,
            data_len: header.data_len,
            limit: settings.max_chunk_bytes,
        });
    }

    let path = store.resolve_path(chunk_id);
    if let Some(meta) = store.lookup_metadata(chunk_id) {
        // Decrypt/decompress happens downstream; only note where the chunk terminates.
        tracing::trace!(
            chunk_id,
            destination = %meta.destination_region,
            terminal = meta.destination_region == settings.region,
            "chunk routing"
        );
    }
    store.on_receive_started(chunk_id, ctx.worker_id);

    let started = Instant::now();
    let Some(payload) = read_payload(stream, header, ctx, settings).await? else {
        return Ok(false);
    };
    if !persist(store, header, &path, payload, ctx, settings).await? {
        return Ok(false);
    }
    store.on_receive_finished(chunk_id, header.data_len, header.is_compressed);

    tracing::debug!(
        port = ctx.port,
        chunk_id,
        bytes = header.data_len,
        elapsed_ms = started.elapsed().as_millis() as u64,
        path = %path.display(),
        "chunk received"
    );
    Ok(true)
}

async fn read_payload<S>(
    stream: &mut S,
    header: &ChunkHeader,
    ctx: &WorkerContext,
    settings: &ReceiveSettings,
) -> Result<Option<Bytes>, ReceiveError>
where
    S: AsyncRead + Unpin,
{
    let chunk_id = header.chunk_id;
    let len = usize::try_from(header.data_len).map_err(|_| ReceiveError::ChunkTooLarge {
        chunk_id,
        data_len: header.data_len,
        limit: usize::MAX as u64,
    })?;

    let mut buf = BytesMut::zeroed(len);
    let mut received = 0usize;
    let started = Instant::now();

    while received < len {
        let end = received + (len - received).min(settings.recv_block_size);
        let outcome = tokio::select! {
            biased;
            _ = ctx.telemetry.fault().raised() => {
                tracing::warn!(
                    port = ctx.port,
                    chunk_id,
                    received,
                    "fault signal raised, abandoning chunk"
                );
                return Ok(None);
            }
            outcome = bounded_read(stream, &mut buf[received..end], settings.read_timeout) => {
                outcome
            }
        };

        match outcome {
            Ok(ReadOutcome::Data(n)) => received += n,
            Ok(ReadOutcome::Eof) => {
                return Err(ReceiveError::ShortRead {
                    chunk_id,
                    expected: header.data_len,
                    received: received as u64,
                })
            }
            Ok(ReadOutcome::TimedOut) => {
                return Err(ReceiveError::Timeout {
                    chunk_id,
                    received: received as u64,
                    after: settings.read_timeout.unwrap_or_default(),
                })
            }
            Err(e) => return Err(ReceiveError::io("payload read failed", Some(chunk_id), e)),
        }

        ctx.telemetry.sample(ProfilingSample {
            worker_id: ctx.worker_id,
            chunk_id,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
            cumulative_bytes: received as u64,
        });
    }

    Ok(Some(buf.freeze()))
}

async fn bounded_read<S>(
    stream: &mut S,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> io::Result<ReadOutcome>
where
    S: AsyncRead + Unpin,
{
    let read = stream.read(buf);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, read).await {
            Ok(result) => result,
            Err(_) => return Ok(ReadOutcome::TimedOut),
        },
        None => read.await,
    };
    match result {
        Ok(0) => Ok(ReadOutcome::Eof),
        Ok(n) => Ok(ReadOutcome::Data(n)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(ReadOutcome::Eof),
        Err(e) => Err(e),
    }
}

/// Wait for store capacity, then write and validate the chunk file.
///
/// `false` if the fault signal was raised while waiting for space.
async fn persist(
    store: &Arc<dyn ChunkStore>,
    header: &ChunkHeader,
    path: &Path,
    payload: Bytes,
    ctx: &WorkerContext,
    settings: &ReceiveSettings,
) -> Result<bool, ReceiveError> {
    let chunk_id = header.chunk_id;
    let data_len = header.data_len;
    let started = Instant::now();

    if !wait_for_capacity(store, header, ctx, settings).await? {
        return Ok(false);
    }

    let mut attempt = 0u32;
    let written = loop {
        match write_chunk_file(path, payload.clone(), ctx.worker_id).await {
            Ok(written) => break written,
            Err(e) if attempt < settings.write_retries => {
                attempt += 1;
                tracing::warn!(
                    port = ctx.port,
                    chunk_id,
                    attempt,
                    error = %e,
                    remaining = store.remaining_capacity(),
                    data_len,
                    max_pending = settings.max_pending_chunks,
                    "chunk write failed, retrying"
                );
                tokio::time::sleep(settings.capacity_poll_interval).await;
            }
            Err(e) => {
                store.release(data_len);
                return Err(write_failure(store, header, path, e, started.elapsed()));
            }
        }
    };

    if written != data_len {
        return Err(reject_size_mismatch(store, header, path, written).await);
    }
    Ok(true)
}

/// Map the last failed write attempt. A full disk is reported like a store that never freed up.
fn write_failure(
    store: &Arc<dyn ChunkStore>,
    header: &ChunkHeader,
    path: &Path,
    err: io::Error,
    waited: Duration,
) -> ReceiveError {
    let chunk_id = header.chunk_id;
    if err.kind() == io::ErrorKind::StorageFull {
        return ReceiveError::CapacityExhausted {
            chunk_id,
            required: header.data_len,
            remaining: store.remaining_capacity(),
            waited,
        };
    }
    ReceiveError::io(
        format!("failed to write chunk file {}", path.display()),
        Some(chunk_id),
        err,
    )
}

/// Delete a chunk file whose size disagrees with its header and give back its space.
async fn reject_size_mismatch(
    store: &Arc<dyn ChunkStore>,
    header: &ChunkHeader,
    path: &Path,
    written: u64,
) -> ReceiveError {
    store.release(header.data_len);
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!(
            chunk_id = header.chunk_id,
            path = %path.display(),
            error = %e,
            "failed to remove mismatched chunk file"
        );
    }
    // The rename already replaced any earlier copy of this chunk.
    store.discard(header.chunk_id);
    ReceiveError::SizeMismatch {
        chunk_id: header.chunk_id,
        expected: header.data_len,
        actual: written,
    }
}

/// Reserve room for the chunk, polling while the store is too full.
async fn wait_for_capacity(
    store: &Arc<dyn ChunkStore>,
    header: &ChunkHeader,
    ctx: &WorkerContext,
    settings: &ReceiveSettings,
) -> Result<bool, ReceiveError> {
    let chunk_id = header.chunk_id;
    let required = header
        .data_len
        .saturating_mul(settings.max_pending_chunks)
        .max(header.data_len);
    let started = Instant::now();
    let mut polls = 0u64;

    while !store.try_reserve(header.data_len, required) {
        let waited = started.elapsed();
        if waited >= settings.capacity_wait_timeout {
            return Err(ReceiveError::CapacityExhausted {
                chunk_id,
                required,
                remaining: store.remaining_capacity(),
                waited,
            });
        }
        if polls == 0 {
            tracing::debug!(
                port = ctx.port,
                chunk_id,
                required,
                "chunk store full, waiting before persisting chunk"
            );
        }
        polls += 1;

        tokio::select! {
            biased;
            _ = ctx.telemetry.fault().raised() => return Ok(false),
            _ = tokio::time::sleep(settings.capacity_poll_interval) => {}
        }
    }

    if polls > 0 {
        tracing::debug!(
            port = ctx.port,
            chunk_id,
            polls,
            waited_ms = started.elapsed().as_millis() as u64,
            "chunk store has room again"
        );
    }
    Ok(true)
}

async fn write_chunk_file(path: &Path, payload: Bytes, worker_id: u32) -> io::Result<u64> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&path, &payload, worker_id))
        .await
        .map_err(io::Error::other)?
}

/// Atomic write: tmp file → fsync → rename. Returns the size on disk.
fn write_atomic(path: &Path, data: &[u8], worker_id: u32) -> io::Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension(format!("{worker_id}.tmp"));
    let written = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    Ok(fs::metadata(path)?.len())
}
