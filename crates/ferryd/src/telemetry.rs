//! Observability sink shared by every socket worker.
//!
//! Three pieces of cross-worker state:
//!   - `FaultSignal`: set-once, never cleared. Any worker may raise it;
//!     every worker stops at its next check.
//!   - error reports: append-only, drained by the control process.
//!   - profiling: per-read timing samples, dropped when nobody drains
//!     them fast enough. The data path never waits on these.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Process-wide failure flag.
#[derive(Debug, Clone, Default)]
pub struct FaultSignal(CancellationToken);

impl FaultSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Completes once the signal has been raised.
    pub async fn raised(&self) {
        self.0.cancelled().await
    }
}

/// One failure, attributed to the worker (and chunk, if any) it happened on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub worker_id: u32,
    pub port: u16,
    pub chunk_id: Option<u64>,
    pub description: String,
}

/// Receive progress for one chunk, emitted after every socket read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfilingSample {
    pub worker_id: u32,
    pub chunk_id: u64,
    pub elapsed_ms: f64,
    pub cumulative_bytes: u64,
}

/// Either kind of record coming out of a `TelemetryDrain`.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Error(ErrorReport),
    Sample(ProfilingSample),
}

/// Producer half, cloned into every worker.
#[derive(Clone)]
pub struct TelemetrySink {
    fault: FaultSignal,
    errors: mpsc::UnboundedSender<ErrorReport>,
    samples: mpsc::Sender<ProfilingSample>,
    dropped_samples: Arc<AtomicU64>,
}

/// Consumer half, owned by the control process.
pub struct TelemetryDrain {
    errors: mpsc::UnboundedReceiver<ErrorReport>,
    samples: mpsc::Receiver<ProfilingSample>,
    dropped_samples: Arc<AtomicU64>,
}

/// Create a connected sink/drain pair.
///
/// `sample_capacity` bounds the profiling backlog (minimum 1).
pub fn channel(fault: FaultSignal, sample_capacity: usize) -> (TelemetrySink, TelemetryDrain) {
    let (errors_tx, errors_rx) = mpsc::unbounded_channel();
    let (samples_tx, samples_rx) = mpsc::channel(sample_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        TelemetrySink {
            fault,
            errors: errors_tx,
            samples: samples_tx,
            dropped_samples: dropped.clone(),
        },
        TelemetryDrain {
            errors: errors_rx,
            samples: samples_rx,
            dropped_samples: dropped,
        },
    )
}

impl TelemetrySink {
    pub fn fault(&self) -> &FaultSignal {
        &self.fault
    }

    /// Append to the error report without touching the fault signal.
    pub fn report(&self, report: ErrorReport) {
        if self.errors.send(report).is_err() {
            tracing::trace!("error report dropped, drain closed");
        }
    }

    /// Append to the error report and raise the fault signal.
    pub fn fail(&self, report: ErrorReport) {
        self.report(report);
        self.fault.raise();
    }

    pub fn sample(&self, sample: ProfilingSample) {
        match self.samples.try_send(sample) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_samples.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

impl TelemetryDrain {
    /// Everything reported so far, in report order.
    pub fn drain_errors(&mut self) -> Vec<ErrorReport> {
        let mut out = Vec::new();
        while let Ok(report) = self.errors.try_recv() {
            out.push(report);
        }
        out
    }

    pub fn drain_samples(&mut self) -> Vec<ProfilingSample> {
        let mut out = Vec::new();
        while let Ok(sample) = self.samples.try_recv() {
            out.push(sample);
        }
        out
    }

    /// Wait for the next error report. `None` once every sink is gone.
    pub async fn next_error(&mut self) -> Option<ErrorReport> {
        self.errors.recv().await
    }

    /// Wait for the next profiling sample. `None` once every sink is gone.
    pub async fn next_sample(&mut self) -> Option<ProfilingSample> {
        self.samples.recv().await
    }

    /// Wait for whichever comes first, a report or a sample.
    ///
    /// `None` once every sink is gone and both queues are empty.
    pub async fn next_event(&mut self) -> Option<TelemetryEvent> {
        tokio::select! {
            Some(report) = self.errors.recv() => Some(TelemetryEvent::Error(report)),
            Some(sample) = self.samples.recv() => Some(TelemetryEvent::Sample(sample)),
            else => None,
        }
    }

    /// Samples discarded because the backlog was full.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }
}
