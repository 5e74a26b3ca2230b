//! Gateway receiver: a pool of socket workers sharing one chunk store.
//!
//! Workers are keyed by the port they were bound to. Once a worker accepts
//! its sender the listener is gone, so a registered port is not necessarily
//! still listening. A worker that exits on its own (sender hung up, fault)
//! stays registered until `stop_worker` reaps it, so callers can still
//! observe it through `is_worker_running`.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustls::pki_types::CertificateDer;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ferry_core::config::FerryConfig;
use ferry_store::ChunkStore;

use crate::chunk::{ReceiveSettings, WorkerContext};
use crate::error::ReceiverError;
use crate::telemetry::{self, FaultSignal, TelemetryDrain, TelemetrySink};
use crate::tls::ServerTls;
use crate::worker::{bind_listener, SocketWorker};

struct WorkerRecord {
    worker_id: u32,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct GatewayReceiver {
    bind_addr: IpAddr,
    socket_recv_buffer: usize,
    stop_timeout: Duration,
    store: Arc<dyn ChunkStore>,
    settings: Arc<ReceiveSettings>,
    telemetry: TelemetrySink,
    tls: Option<ServerTls>,
    workers: DashMap<u16, WorkerRecord>,
    next_worker_id: AtomicU32,
}

impl GatewayReceiver {
    /// Build a receiver with no workers running.
    ///
    /// Returns the drain for error reports and profiling samples alongside it.
    pub fn new(
        config: &FerryConfig,
        store: Arc<dyn ChunkStore>,
    ) -> Result<(Self, TelemetryDrain), ReceiverError> {
        let receiver = &config.receiver;
        let bind_addr: IpAddr = receiver
            .bind_addr
            .parse()
            .map_err(|_| ReceiverError::BindAddr(receiver.bind_addr.clone()))?;
        let tls = if receiver.use_tls {
            Some(ServerTls::self_signed()?)
        } else {
            tracing::warn!("TLS disabled, chunks will cross the network in plaintext");
            None
        };
        let (sink, drain) = telemetry::channel(FaultSignal::new(), receiver.profile_queue_capacity);

        Ok((
            Self {
                bind_addr,
                socket_recv_buffer: receiver.socket_recv_buffer,
                stop_timeout: receiver.stop_timeout(),
                store,
                settings: Arc::new(ReceiveSettings::from_config(config)),
                telemetry: sink,
                tls,
                workers: DashMap::new(),
                next_worker_id: AtomicU32::new(0),
            },
            drain,
        ))
    }

    /// Bind a fresh port and spawn a worker on it. Returns the port.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_worker(&self) -> Result<u16, ReceiverError> {
        let listener = bind_listener(self.bind_addr, self.socket_recv_buffer)
            .and_then(TcpListener::from_std)
            .map_err(ReceiverError::Bind)?;
        let port = listener.local_addr().map_err(ReceiverError::Bind)?.port();

        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        self.register(port, || {
            let stop = CancellationToken::new();
            let worker = SocketWorker {
                listener,
                ctx: WorkerContext {
                    worker_id,
                    port,
                    telemetry: self.telemetry.clone(),
                    stop: stop.clone(),
                },
                store: self.store.clone(),
                settings: self.settings.clone(),
                tls: self.tls.clone(),
            };
            WorkerRecord {
                worker_id,
                stop,
                handle: tokio::spawn(worker.run()),
            }
        })?;
        tracing::info!(worker_id, port, "worker started");
        Ok(port)
    }

    /// Insert the record built by `spawn` under `port`.
    ///
    /// The OS may hand out a port again once an earlier worker's listener is
    /// gone. A finished worker still registered there is replaced; a running
    /// one is never orphaned, and `spawn` is not called.
    fn register(
        &self,
        port: u16,
        spawn: impl FnOnce() -> WorkerRecord,
    ) -> Result<(), ReceiverError> {
        match self.workers.entry(port) {
            Entry::Occupied(mut slot) => {
                if !slot.get().handle.is_finished() {
                    tracing::error!(
                        port,
                        worker_id = slot.get().worker_id,
                        "port reissued while its worker is still running"
                    );
                    return Err(ReceiverError::PortInUse(port));
                }
                tracing::debug!(
                    port,
                    stale_worker_id = slot.get().worker_id,
                    "replacing finished worker on reused port"
                );
                slot.insert(spawn());
            }
            Entry::Vacant(slot) => {
                slot.insert(spawn());
            }
        }
        Ok(())
    }

    /// Start `n` workers, returning their ports in start order.
    pub fn start_workers(&self, n: usize) -> Result<Vec<u16>, ReceiverError> {
        (0..n).map(|_| self.start_worker()).collect()
    }

    /// Ask the worker on `port` to stop and wait for it, aborting it after the stop timeout.
    ///
    /// Returns the port that was freed.
    pub async fn stop_worker(&self, port: u16) -> Result<u16, ReceiverError> {
        let Some((_, record)) = self.workers.remove(&port) else {
            return Err(ReceiverError::NotFound(port));
        };
        let WorkerRecord {
            worker_id,
            stop,
            mut handle,
        } = record;

        stop.cancel();
        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(())) => tracing::info!(worker_id, port, "worker stopped"),
            Ok(Err(e)) => tracing::warn!(worker_id, port, error = %e, "worker task failed"),
            Err(_) => {
                tracing::warn!(
                    worker_id,
                    port,
                    timeout_secs = self.stop_timeout.as_secs(),
                    "worker did not stop in time, aborting"
                );
                handle.abort();
                let _ = handle.await;
            }
        }
        Ok(port)
    }

    /// Stop every registered worker concurrently.
    pub async fn stop_all(&self) {
        let ports = self.ports();
        let results =
            futures::future::join_all(ports.iter().map(|&port| self.stop_worker(port))).await;
        for (port, result) in ports.into_iter().zip(results) {
            if let Err(e) = result {
                tracing::debug!(port, error = %e, "worker already gone");
            }
        }
    }

    /// Ports with a registered worker, ascending.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.workers.iter().map(|w| *w.key()).collect();
        ports.sort_unstable();
        ports
    }

    /// `None` if no worker is registered on `port`.
    pub fn is_worker_running(&self, port: u16) -> Option<bool> {
        self.workers.get(&port).map(|w| !w.handle.is_finished())
    }

    pub fn worker_id(&self, port: u16) -> Option<u32> {
        self.workers.get(&port).map(|w| w.worker_id)
    }

    pub fn fault(&self) -> &FaultSignal {
        self.telemetry.fault()
    }

    /// DER of the TLS certificate workers present. `None` when TLS is off.
    pub fn certificate(&self) -> Option<&CertificateDer<'static>> {
        self.tls.as_ref().map(ServerTls::certificate)
    }
}

impl Drop for GatewayReceiver {
    fn drop(&mut self) {
        for worker in self.workers.iter() {
            worker.stop.cancel();
            worker.handle.abort();
        }
    }
}
