//! Ferry integration test harness.
//!
//! Every test runs a real `GatewayReceiver` on loopback with a throwaway
//! chunk store under the system temp directory. No privileges needed:
//!
//!   cargo test --test integration
//!
//! Senders here speak the wire protocol directly: TLS with the receiver's
//! certificate pinned, or plain TCP when the receiver has TLS off.

mod delivery;
mod lifecycle;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use ferry_core::config::FerryConfig;
use ferry_core::wire::ChunkHeader;
use ferry_store::{ChunkStore, DiskChunkStore};
use ferryd::{pinned_client_config, GatewayReceiver, TelemetryDrain};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const LOOPBACK: &str = "127.0.0.1";

/// Generous bound for anything the receiver should do "soon".
pub const SETTLE: Duration = Duration::from_secs(10);

static STORE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Fresh, empty store directory unique to this test run.
pub fn temp_store(name: &str, capacity: u64) -> DiskChunkStore {
    let seq = STORE_SEQ.fetch_add(1, Ordering::Relaxed);
    let dir: PathBuf = std::env::temp_dir().join(format!(
        "ferry-it-{name}-{}-{seq}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    DiskChunkStore::open(dir, capacity).expect("temp store should open")
}

/// Loopback receiver config with small reads so payloads span many of them.
pub fn test_config(use_tls: bool) -> FerryConfig {
    let mut config = FerryConfig::default();
    config.receiver.bind_addr = LOOPBACK.into();
    config.receiver.use_tls = use_tls;
    config.receiver.recv_block_size = 16 * 1024;
    config.store.capacity_poll_ms = 5;
    config
}

pub fn start_receiver(
    config: &FerryConfig,
    store: &DiskChunkStore,
) -> Result<(GatewayReceiver, TelemetryDrain)> {
    GatewayReceiver::new(config, Arc::new(store.clone())).context("failed to build receiver")
}

pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Connect the way a sending gateway would.
pub async fn connect(receiver: &GatewayReceiver, port: u16) -> Result<Box<dyn Stream>> {
    let tcp = TcpStream::connect((LOOPBACK, port))
        .await
        .with_context(|| format!("connect to port {port}"))?;
    let Some(certificate) = receiver.certificate() else {
        return Ok(Box::new(tcp));
    };

    let connector = TlsConnector::from(Arc::new(pinned_client_config(certificate)?));
    let name = ServerName::try_from("localhost")?;
    let tls = connector
        .connect(name, tcp)
        .await
        .context("TLS handshake with receiver")?;
    Ok(Box::new(tls))
}

pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed))
        .collect()
}

pub fn frame(chunk_id: u64, data: &[u8], n_chunks_left_on_socket: u32) -> Vec<u8> {
    let header = ChunkHeader {
        chunk_id,
        data_len: data.len() as u64,
        is_compressed: false,
        n_chunks_left_on_socket,
    };
    let mut out = header.encode().to_vec();
    out.extend_from_slice(data);
    out
}

/// Send `chunks` as one batch, counting `n_chunks_left_on_socket` down to zero.
pub async fn send_batch(stream: &mut Box<dyn Stream>, chunks: &[(u64, Vec<u8>)]) -> Result<()> {
    for (i, (chunk_id, data)) in chunks.iter().enumerate() {
        let left = (chunks.len() - 1 - i) as u32;
        stream
            .write_all(&frame(*chunk_id, data, left))
            .await
            .with_context(|| format!("send chunk {chunk_id}"))?;
    }
    stream.flush().await?;
    Ok(())
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_exit(receiver: &GatewayReceiver, port: u16) -> bool {
    wait_until(SETTLE, || receiver.is_worker_running(port) == Some(false)).await
}
