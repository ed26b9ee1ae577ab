//! Reconciler-integration binary for the concurrency control core: loads
//! configuration, sets up structured logging, selects a driver, runs
//! `InitQueues` recovery, and drives one [`Reconciler`] per configured repo
//! until a shutdown signal arrives and in-flight slot operations settle.
mod config;
mod logging;
mod reconcile;

use anyhow::Context;
use clap::Parser;
use config::{DaemonConfig, Opt};
use logging::{DiagnosticFormat, LoggingConfig};
use reconcile::Reconciler;
use runctl_core::driver::DriverConfig;
use runctl_core::{ConcurrencyManager, RepoRef};
use runctl_lifecycle::{LifeCycle, ShutdownSubscription};
use std::sync::Arc;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(opt))
}

async fn run(opt: Opt) -> anyhow::Result<()> {
    let config = DaemonConfig::load(&opt.config)?.merge(&opt)?;

    LoggingConfig {
        log_dir: config.log_dir.clone(),
        diag_format: config.log_format.unwrap_or(DiagnosticFormat::Full),
        filter_env_var: "RUNCTL_LOG",
        default_filter: "runctl_daemon=info,runctl_core=info",
    }
    .init()
    .context("initializing logging")?;

    let driver_config = config.driver.unwrap_or(DriverConfig::Memory {
        lease_ttl: Duration::from_secs(30 * 60),
    });
    let manager = Arc::new(
        ConcurrencyManager::from_config(&driver_config)
            .await
            .context("constructing concurrency manager")?,
    );

    manager
        .init_queues()
        .await
        .context("recovering queue state from driver")?;
    tracing::info!("initialization complete");

    let mut life_cycle = LifeCycle::new();

    // Demo workload: a single repo with a small concurrency limit, so the
    // admission path (queue -> acquire -> release -> wakeup -> re-admit)
    // actually exercises contention. A real deployment would construct one
    // `Reconciler` per repo custom resource the controller watches.
    let repo = RepoRef::new("demo", "example-repo", Some(2));
    let reconciler = Reconciler::new(manager.clone(), repo);
    reconciler.setup_watcher().await.context("setting up watcher")?;

    let loop_handle = tokio::spawn({
        let reconciler = reconciler.clone();
        let shutdown = ShutdownSubscription::get();
        async move {
            reconciler
                .run_loop(Duration::from_secs(3), shutdown)
                .await;
        }
    });

    let arrivals_handle = tokio::spawn({
        let reconciler = reconciler.clone();
        let mut shutdown = ShutdownSubscription::get();
        async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(4)) => {}
                    _ = shutdown.shutting_down() => return,
                }
                if let Err(err) = reconciler.spawn_run().await {
                    tracing::warn!(error = %err, "failed to admit a newly arrived run");
                }
            }
        }
    });

    life_cycle.wait_for_shutdown().await;
    loop_handle.await.ok();
    arrivals_handle.await.ok();
    manager.close().await.context("closing concurrency manager")?;
    tracing::info!("shutdown completed OK");
    Ok(())
}
