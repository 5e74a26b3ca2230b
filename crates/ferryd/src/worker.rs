//! Socket worker: one listening port, one sender connection.
//!
//! The listener is bound before the worker task starts so the caller learns
//! the port synchronously. After the first accept the listener is dropped:
//! the port serves exactly one connection for the worker's lifetime.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use ferry_store::ChunkStore;

use crate::chunk::{receive_batch, BatchOutcome, ReceiveSettings, WorkerContext};
use crate::tls::ServerTls;

/// How long a worker waits for its TLS close_notify to go out on exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Bind a TCP listener on an ephemeral port of `addr`.
pub(crate) fn bind_listener(
    addr: IpAddr,
    recv_buffer: usize,
) -> io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if recv_buffer > 0 {
        socket.set_recv_buffer_size(recv_buffer)?;
    }
    socket.bind(&SocketAddr::new(addr, 0).into())?;
    socket.listen(1)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

pub(crate) struct SocketWorker {
    pub listener: TcpListener,
    pub ctx: WorkerContext,
    pub store: Arc<dyn ChunkStore>,
    pub settings: Arc<ReceiveSettings>,
    pub tls: Option<ServerTls>,
}

impl SocketWorker {
    pub(crate) async fn run(self) {
        let Self {
            listener,
            ctx,
            store,
            settings,
            tls,
        } = self;
        tracing::info!(
            worker_id = ctx.worker_id,
            port = ctx.port,
            tls = tls.is_some(),
            "socket worker listening"
        );

        let accepted = tokio::select! {
            biased;
            _ = ctx.telemetry.fault().raised() => {
                tracing::debug!(port = ctx.port, "fault raised before a sender connected");
                return;
            }
            _ = ctx.stop.cancelled() => {
                tracing::debug!(port = ctx.port, "stopped before a sender connected");
                return;
            }
            accepted = listener.accept() => accepted,
        };
        drop(listener);

        let (tcp, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(port = ctx.port, error = %e, "accept failed");
                ctx.fail(format!("accept failed: {e}"));
                return;
            }
        };
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!(port = ctx.port, error = %e, "TCP_NODELAY not set");
        }
        tracing::info!(port = ctx.port, peer = %peer, "sender connected");

        match tls {
            Some(tls) => {
                let handshake = tokio::select! {
                    biased;
                    _ = ctx.telemetry.fault().raised() => return,
                    _ = ctx.stop.cancelled() => return,
                    handshake = tls.acceptor().accept(tcp) => handshake,
                };
                match handshake {
                    Ok(stream) => serve(stream, &ctx, &store, &settings).await,
                    Err(e) => {
                        tracing::error!(
                            port = ctx.port,
                            peer = %peer,
                            error = %e,
                            "TLS handshake failed"
                        );
                        ctx.fail(format!("TLS handshake with {peer} failed: {e}"));
                    }
                }
            }
            None => serve(tcp, &ctx, &store, &settings).await,
        }

        tracing::info!(worker_id = ctx.worker_id, port = ctx.port, "socket worker exiting");
    }
}

/// Receive batches until the sender hangs up, an error occurs or the worker is told to stop.
async fn serve<S>(
    mut stream: S,
    ctx: &WorkerContext,
    store: &Arc<dyn ChunkStore>,
    settings: &ReceiveSettings,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut batches = 0u64;
    while !ctx.should_exit() {
        match receive_batch(&mut stream, store, ctx, settings).await {
            Ok(BatchOutcome::Complete { chunks, bytes }) => {
                batches += 1;
                tracing::debug!(port = ctx.port, batches, chunks, bytes, "batch complete");
            }
            Ok(BatchOutcome::Closed) => {
                tracing::info!(port = ctx.port, batches, "sender closed connection");
                break;
            }
            Ok(BatchOutcome::Interrupted) => {
                tracing::info!(
                    port = ctx.port,
                    fault = ctx.telemetry.fault().is_raised(),
                    "receive loop interrupted"
                );
                break;
            }
            Err(e) => {
                if e.is_fatal() {
                    tracing::error!(
                        port = ctx.port,
                        chunk_id = ?e.chunk_id(),
                        error = %e,
                        "receive failed, raising fault signal"
                    );
                } else {
                    tracing::warn!(
                        port = ctx.port,
                        error = %e,
                        "dropping connection after bad header"
                    );
                }
                ctx.report(&e);
                break;
            }
        }
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, stream.shutdown()).await.is_err() {
        tracing::debug!(port = ctx.port, "connection shutdown timed out");
    }
}
