//! mvirt-lb daemon: keeps the kernel IPVS table in sync with the desired state file.

use anyhow::{Context, Result};
use clap::Parser;
use mvirt_lb::config::Args;
use mvirt_lb::{AllHealthy, DesiredState, FileState, IpvsAdm, Reconciler, SyncReport};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mvirt_lb=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    info!("mvirt-lb starting...");
    info!(state_file = %args.state_file.display(), "Desired state source");

    // Bootstrap: load ip_vs and start from an empty table
    let reconciler = match Reconciler::initialize(IpvsAdm::new(&args.ipvsadm)) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "Failed to initialize IPVS");
            std::process::exit(1);
        }
    };

    if args.once {
        if let Err(e) = run_pass(Arc::clone(&reconciler), args.state_file.clone()).await {
            error!(error = %e, "Sync failed");
            std::process::exit(1);
        }
        return Ok(());
    }

    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    let mut ticker = tokio::time::interval(args.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_secs = args.interval, "Sync loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = sighup.recv() => { info!("Received SIGHUP, syncing now"); }
            _ = sigint.recv() => { info!("Received SIGINT"); break; }
            _ = sigterm.recv() => { info!("Received SIGTERM"); break; }
        }

        // A failed pass is retried on the next tick
        if let Err(e) = run_pass(Arc::clone(&reconciler), args.state_file.clone()).await {
            warn!(error = %format!("{e:#}"), "Sync failed");
        }
    }

    info!("Shutting down...");
    if args.flush_on_exit {
        let r = Arc::clone(&reconciler);
        match tokio::task::spawn_blocking(move || r.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Failed to flush IPVS table"),
            Err(e) => error!(error = %e, "Flush task failed"),
        }
    }

    info!("mvirt-lb stopped");
    Ok(())
}

/// Load a fresh desired state snapshot and run one sync pass.
///
/// The pass blocks on kernel calls, so it runs on the blocking pool.
async fn run_pass(reconciler: Arc<Reconciler<IpvsAdm>>, state_file: PathBuf) -> Result<SyncReport> {
    let report = tokio::task::spawn_blocking(move || -> Result<SyncReport> {
        let provider = FileState::load(&state_file)?;
        let desired = DesiredState::load(&provider, &AllHealthy)?;
        debug!(
            path = %provider.path().display(),
            services = desired.len(),
            "Loaded desired state"
        );
        Ok(reconciler.sync(&desired)?)
    })
    .await
    .context("Sync task failed")??;

    if report.is_noop() {
        debug!("IPVS table already in sync");
    }
    Ok(report)
}
