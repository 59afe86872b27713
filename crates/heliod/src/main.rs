//! Helio Daemon - shade panel discovery and action execution
//!
//! Runs the job engine in the foreground: discovery scans and action
//! executions are server-owned background jobs that outlive the clients
//! that start them.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon
//! heliod
//!
//! # Start and immediately scan a host range
//! heliod --scan 192.168.1 --from 1 --to 254
//!
//! # Custom configuration
//! heliod --config /etc/helio/heliod.toml
//!
//! # Enable debug logging
//! RUST_LOG=heliod=debug heliod
//! ```
//!
//! # Signal Handling
//!
//! SIGTERM/SIGINT trigger graceful shutdown: the active scan is cancelled
//! and jobs observe the signal at their next safe boundary.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use helio_core::DiscoveryEvent;
use heliod::config::HubConfig;
use heliod::hub::Hub;
use heliod::ops::TcpDeviceOps;

/// helio daemon - shade panel hub
#[derive(Parser, Debug)]
#[command(name = "heliod", version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Kick off a discovery scan of this /24 prefix at startup
    /// (e.g. "192.168.1")
    #[arg(long)]
    scan: Option<String>,

    /// First host octet of the startup scan
    #[arg(long, default_value_t = 1)]
    from: u8,

    /// Last host octet of the startup scan
    #[arg(long, default_value_t = 254)]
    to: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("heliod=info".parse()?)
                .add_directive("helio_core=info".parse()?),
        )
        .init();

    let config = HubConfig::load_or_default(args.config.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "helio daemon starting"
    );

    let hub = Hub::new(config, Arc::new(TcpDeviceOps::default()));

    // Create cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    // Optional startup scan, logged as its events arrive.
    if let Some(prefix) = args.scan.as_deref() {
        match hub.discovery().start(prefix, args.from, args.to) {
            Ok(mut handle) => {
                info!(job_id = %handle.job_id, prefix, "Startup scan launched");
                tokio::spawn(async move {
                    while let Some(event) = handle.events.recv().await {
                        log_scan_event(&event);
                    }
                });
            }
            Err(e) => error!(error = %e, "Startup scan rejected"),
        }
    }

    // Idle until shutdown; jobs run as background tasks.
    cancel_token.cancelled().await;

    hub.discovery().cancel_active();
    let running = hub.executor().running_actions();
    if !running.is_empty() {
        warn!(
            count = running.len(),
            "Shutting down with executions still running"
        );
    }

    info!("helio daemon stopped");
    Ok(())
}

fn log_scan_event(event: &DiscoveryEvent) {
    match event {
        DiscoveryEvent::Result {
            address,
            classification,
            ..
        } => info!(%address, ?classification, "Scan result"),
        DiscoveryEvent::PhaseChange {
            phase,
            scanned_count,
            panels_found,
        } => info!(%phase, scanned_count, panels_found, "Scan phase change"),
        DiscoveryEvent::Complete { stats } => info!(
            total_ips = stats.total_ips,
            panels_found = stats.panels_found,
            no_response = stats.no_response,
            errors = stats.errors,
            duration_ms = stats.total_duration_ms,
            "Scan complete"
        ),
    }
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
