//! History Downloader Binary
//!
//! Connects to the simulated trading-data service, resolves the configured
//! instruments, backfills their bar history and writes one JSON file per
//! instrument.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin history-downloader
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `HISTORY_INSTRUMENTS`: `TYPE:SYMBOL:EXCHANGE[:CURRENCY]`, comma separated
//!   (default: `FUT:ES:GLOBEX,FUT:NQ:GLOBEX`)
//! - `HISTORY_BAR_SIZE`: Bar size per request (default: `1 min`)
//! - `HISTORY_MAX_DAY_RETRIES`: Retries before a day is skipped (default: 2)
//! - `HISTORY_OUTPUT_DIR`: Where bar files are written (default: `data`)
//! - `HISTORY_RECONNECT_*`: Reconnect backoff
//! - `HISTORY_METRICS_PORT`: Prometheus metrics port (default: 0, disabled)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint
//! - `RUST_LOG`: Log level (default: info)

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use history_downloader::application::ports::{Notification, SystemClock};
use history_downloader::application::services::{
    Session, SessionDeps, SessionHandle, SessionRuntime, inbound_channel,
};
use history_downloader::infrastructure::notifications::{ConnectionStatus, NotificationHub};
use history_downloader::infrastructure::reader::ReaderTask;
use history_downloader::infrastructure::simulator::{SimulatedService, SimulatorConfig};
use history_downloader::infrastructure::telemetry;
use history_downloader::{DownloaderConfig, InstrumentKey, export_bars, init_metrics};
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

/// How long to wait for the handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for instrument details.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv_from_ancestors();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting History Downloader");

    let config = DownloaderConfig::from_env()?;
    init_metrics(config.metrics_port)?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let hub = Arc::new(NotificationHub::from_settings(&config.channels));
    let connection_rx = hub.connection_rx();
    let catalog_rx = hub.catalog_rx();
    let downloads_rx = hub.downloads_rx();

    let today = chrono::Local::now().date_naive();
    let service = SimulatedService::new(SimulatorConfig::demo(today));

    let (inbound_tx, inbound_rx) = inbound_channel(config.channels.inbound_capacity);
    let session = Session::new(
        &config,
        SessionDeps {
            client: Box::new(service),
            reader: Box::new(ReaderTask::new(inbound_tx.clone())),
            clock: Arc::new(SystemClock),
            notifications: hub.clone(),
        },
    )?;

    let worker = SessionRuntime::new(
        session,
        inbound_rx,
        &config.reconnect,
        shutdown_token.clone(),
    )
    .spawn();
    let handle = SessionHandle::new(inbound_tx, shutdown_token.clone());

    tokio::select! {
        result = run_downloads(&handle, &config, connection_rx, catalog_rx, downloads_rx) => {
            match result {
                Ok(written) => tracing::info!(files = written, "Downloads complete"),
                Err(e) => tracing::error!(error = %e, "Downloads failed"),
            }
        }
        () = await_shutdown(shutdown_token.clone()) => {}
    }

    if let Err(e) = handle.shutdown().await {
        tracing::debug!(error = %e, "Session already stopped");
    }
    let session = worker.await.context("session worker panicked")?;
    tracing::info!(
        instruments = session.instruments().len(),
        state = ?session.connectivity_state(),
        "History Downloader stopped"
    );

    Ok(())
}

/// Connect, resolve, download and export. Returns the number of files written.
async fn run_downloads(
    handle: &SessionHandle,
    config: &DownloaderConfig,
    mut connection_rx: broadcast::Receiver<ConnectionStatus>,
    mut catalog_rx: broadcast::Receiver<Notification>,
    mut downloads_rx: broadcast::Receiver<Notification>,
) -> anyhow::Result<usize> {
    handle.connect().await?;
    tokio::time::timeout(CONNECT_TIMEOUT, wait_connected(&mut connection_rx))
        .await
        .context("timed out waiting for the service handshake")??;

    let mut pending = BTreeSet::new();
    for spec in &config.instruments {
        pending.insert(handle.resolve_instrument(spec.clone()).await?);
    }

    let resolved = match tokio::time::timeout(
        RESOLVE_TIMEOUT,
        wait_resolved(&mut catalog_rx, pending.clone()),
    )
    .await
    {
        Ok(resolved) => resolved?,
        Err(_) => {
            tracing::warn!("Timed out waiting for instrument details");
            let mut resolved = BTreeSet::new();
            for key in &pending {
                if handle
                    .instrument(key.clone())
                    .await?
                    .is_some_and(|snapshot| snapshot.local_symbol.is_some())
                {
                    resolved.insert(key.clone());
                }
            }
            resolved
        }
    };
    for key in pending.difference(&resolved) {
        tracing::warn!(key = %key, "Instrument did not resolve, skipping");
    }

    for key in &resolved {
        handle.download_history(key.clone()).await?;
    }
    wait_finished(&mut downloads_rx, resolved.clone()).await?;

    let mut written = 0;
    for key in &resolved {
        let Some(bars) = handle.bars(key.clone()).await? else {
            continue;
        };
        export_bars(&config.output_dir, key, &bars)?;
        written += 1;
    }
    Ok(written)
}

async fn wait_connected(rx: &mut broadcast::Receiver<ConnectionStatus>) -> anyhow::Result<()> {
    loop {
        match rx.recv().await {
            Ok(ConnectionStatus { connected: true }) => return Ok(()),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => anyhow::bail!("notification hub closed"),
        }
    }
}

async fn wait_resolved(
    rx: &mut broadcast::Receiver<Notification>,
    mut pending: BTreeSet<InstrumentKey>,
) -> anyhow::Result<BTreeSet<InstrumentKey>> {
    let mut resolved = BTreeSet::new();
    while !pending.is_empty() {
        match rx.recv().await {
            Ok(Notification::InstrumentResolved { snapshot }) => {
                if pending.remove(&snapshot.key) {
                    tracing::info!(key = %snapshot.key, variants = snapshot.variants, "Instrument resolved");
                    resolved.insert(snapshot.key);
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Catalog notifications lagged");
            }
            Err(RecvError::Closed) => anyhow::bail!("notification hub closed"),
        }
    }
    Ok(resolved)
}

async fn wait_finished(
    rx: &mut broadcast::Receiver<Notification>,
    mut running: BTreeSet<InstrumentKey>,
) -> anyhow::Result<()> {
    while !running.is_empty() {
        match rx.recv().await {
            Ok(Notification::DownloadProgress {
                key,
                day,
                bar_count,
                ..
            }) => {
                tracing::info!(key = %key, day = %day, bars = bar_count, "Day downloaded");
            }
            Ok(Notification::DownloadFinished {
                key,
                bar_count,
                skipped_days,
            }) => {
                tracing::info!(
                    key = %key,
                    bars = bar_count,
                    skipped = skipped_days.len(),
                    "Download finished"
                );
                running.remove(&key);
            }
            Ok(Notification::DownloadInterrupted { key }) => {
                tracing::warn!(key = %key, "Download interrupted, waiting for resume");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Download notifications lagged");
            }
            Err(RecvError::Closed) => anyhow::bail!("notification hub closed"),
        }
    }
    Ok(())
}

/// Log configuration summary (without sensitive data).
fn log_config(config: &DownloaderConfig) {
    tracing::info!(
        endpoint = %config.endpoint.endpoint(),
        instruments = config.instruments.len(),
        bar_size = %config.history.bar_size,
        duration = %config.history.duration,
        what_to_show = %config.history.what_to_show,
        max_day_retries = config.history.max_day_retries,
        reconnect = config.reconnect.enabled,
        output_dir = %config.output_dir.display(),
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or ancestors.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
