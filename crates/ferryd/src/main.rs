//! ferryd: cross-cloud gateway receiver daemon.
//!
//! Usage: `ferryd [WORKERS]`. Prints one listening port per line on stdout,
//! then receives until interrupted or until any worker hits a fatal error.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncWriteExt, BufWriter};

use ferry_core::config::FerryConfig;
use ferry_store::DiskChunkStore;
use ferryd::{GatewayReceiver, TelemetryDrain, TelemetryEvent};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = FerryConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = FerryConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FerryConfig::default()
    });
    if let Some(arg) = std::env::args().nth(1) {
        config.receiver.workers = arg
            .parse()
            .with_context(|| format!("invalid worker count {arg:?}"))?;
    }

    tracing::info!(
        workers = config.receiver.workers,
        bind_addr = %config.receiver.bind_addr,
        tls = config.receiver.use_tls,
        store = %config.store.root.display(),
        "ferryd starting"
    );

    let store = DiskChunkStore::open(&config.store.root, config.store.capacity_bytes)
        .context("failed to open chunk store")?;
    let (receiver, drain) =
        GatewayReceiver::new(&config, Arc::new(store)).context("failed to set up receiver")?;
    let telemetry_task = tokio::spawn(forward_telemetry(
        drain,
        config.telemetry.profile_log.clone(),
    ));

    let ports = receiver
        .start_workers(config.receiver.workers)
        .context("failed to start socket workers")?;
    // Senders read ports from stdout, one per line.
    for port in &ports {
        println!("{port}");
    }

    let fault = receiver.fault().clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
        _ = fault.raised() => tracing::error!("fault signal raised, stopping all workers"),
    }

    receiver.stop_all().await;
    drop(receiver);

    match telemetry_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "telemetry forwarding failed"),
        Err(e) => tracing::warn!(error = %e, "telemetry task failed"),
    }

    if fault.is_raised() {
        anyhow::bail!("receiver stopped after a fatal error");
    }
    tracing::info!("ferryd stopped");
    Ok(())
}

/// Log error reports and append profiling samples to the profile log as JSON lines.
///
/// Returns once every worker and the receiver have dropped their sinks.
async fn forward_telemetry(mut drain: TelemetryDrain, profile_log: Option<PathBuf>) -> Result<()> {
    let mut log = match profile_log {
        Some(path) => {
            let file = tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("failed to create profile log {}", path.display()))?;
            tracing::info!(path = %path.display(), "writing profiling samples");
            Some(BufWriter::new(file))
        }
        None => None,
    };

    while let Some(event) = drain.next_event().await {
        match event {
            TelemetryEvent::Error(report) => tracing::error!(
                worker_id = report.worker_id,
                port = report.port,
                chunk_id = ?report.chunk_id,
                "{}",
                report.description
            ),
            TelemetryEvent::Sample(sample) => {
                if let Some(log) = log.as_mut() {
                    let mut line = serde_json::to_vec(&sample)?;
                    line.push(b'\n');
                    log.write_all(&line).await?;
                }
            }
        }
    }

    if let Some(mut log) = log {
        log.flush().await?;
    }
    let dropped = drain.dropped_samples();
    if dropped > 0 {
        tracing::warn!(dropped, "profiling samples dropped, queue was full");
    }
    Ok(())
}
