//! # playop - playbook operator
//!
//! Entry point for the `playop` binary.
//!
//! ## Startup Sequence
//!
//! 1. **Tracing** - `RUST_LOG`-filtered fmt subscriber, `info` by default
//! 2. **Configuration** - config file (if any) with `PLAYOP_*` overrides
//! 3. **Secret store** - Vault client when an address is configured
//! 4. **Controller** - worker pool, resync and idle-lock timers
//! 5. **Log tail** - playbook output re-emitted under the `playbook` target
//! 6. **Manifest source** - directory poller feeding lifecycle events
//!
//! ## Shutdown
//!
//! Ctrl+C stops the manifest source and the log tail, then waits for the
//! workers to finish the item they are on.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod manifest;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use playop_events::LogChannel;
use playop_reconciler::{
    Controller, Environment, ReconcilerConfig, SecretStore, VariableResolver, VaultSecretStore,
};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands, Common};
use crate::manifest::{ManifestSource, read_manifests};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Run {
            common,
            manifests,
            poll_interval_ms,
            workers,
        } => run(&common, manifests, Duration::from_millis(poll_interval_ms), workers).await,
        Commands::Resolve {
            common,
            manifest,
            action,
        } => resolve(&common, &manifest, action.as_deref()),
    }
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(common: &Common, env: &Environment) -> Result<ReconcilerConfig> {
    let config = match &common.config {
        Some(path) => ReconcilerConfig::from_file(path)?.with_env(env)?,
        None => ReconcilerConfig::default().with_env(env)?,
    };
    if config.workflows.is_empty() {
        warn!("No workflows configured; every resource will fail with ConfigurationError");
    }
    Ok(config)
}

async fn run(
    common: &Common,
    manifests: std::path::PathBuf,
    poll_interval: Duration,
    workers: Option<usize>,
) -> Result<()> {
    let start_time = Instant::now();
    info!("playop starting...");

    let env = Environment::from_process();
    let mut config = load_config(common, &env).context("Failed to load configuration")?;
    if let Some(workers) = workers {
        config.workers = workers;
    }

    let mut builder = Controller::builder(config.clone()).overrides(common.overrides());
    if let Some(vault) = VaultSecretStore::from_config(&config.vault, &env)
        .context("Failed to initialize secret store")?
    {
        info!("Vault secret store configured");
        builder = builder.secrets(Arc::new(vault) as Arc<dyn SecretStore>);
    }
    let controller = builder.build().context("Invalid controller configuration")?;
    let handle = controller.start();

    let (stop_tx, stop_rx) = watch::channel(false);
    let tail = tokio::spawn(tail_log(Arc::clone(controller.log()), stop_rx.clone()));
    let source = tokio::spawn(ManifestSource::new(manifests).run(
        controller.clone(),
        poll_interval,
        stop_rx,
    ));

    info!(
        workers = config.workers,
        "playop started in {:?}",
        start_time.elapsed()
    );
    info!("playop is running. Press Ctrl+C to stop.");
    wait_for_shutdown().await;

    info!("Cleaning up...");
    let _ = stop_tx.send(true);
    if let Err(e) = source.await {
        error!(error = %e, "Manifest source task failed");
    }
    handle.shutdown().await;
    if let Err(e) = tail.await {
        error!(error = %e, "Log tail task failed");
    }

    info!("playop stopped gracefully");
    Ok(())
}

/// Re-emit channel lines as tracing events so console mode shows playbook output.
async fn tail_log(log: Arc<LogChannel>, mut stop_rx: watch::Receiver<bool>) {
    let mut subscription = log.subscribe();
    loop {
        let line = tokio::select! {
            line = subscription.recv() => line,
            _ = stop_rx.changed() => break,
        };
        match line {
            Ok(line) => match &line.resource {
                Some(resource) => info!(target: "playbook", source = %line.source, resource = %resource, "{}", line.text),
                None => info!(target: "playbook", source = %line.source, "{}", line.text),
            },
            Err(_) => break,
        }
    }
    if subscription.dropped() > 0 {
        warn!(dropped = subscription.dropped(), "Log tail fell behind");
    }
}

fn resolve(common: &Common, path: &std::path::Path, action: Option<&str>) -> Result<()> {
    let env = Environment::from_process();
    let config = load_config(common, &env)?;
    let overrides = common.overrides();

    let manifests = read_manifests(path)?;
    if manifests.is_empty() {
        bail!("no manifests in {}", path.display());
    }

    for manifest in manifests {
        let id = manifest.id();
        let Some(workflow) = config.workflow_for(&id.kind) else {
            bail!("no workflow registered for kind '{}'", id.kind);
        };
        let resolver = VariableResolver::for_workflow(workflow, &overrides);
        let spec = manifest.params()?;
        let params = match action {
            Some(action) => resolver.resolve_action(&spec, &env, action),
            None => resolver.resolve(&spec, &env),
        }
        .with_context(|| format!("failed to resolve {id}"))?;

        let output = serde_json::json!({
            "resource": id.to_string(),
            "params": resolver.masked(&params).to_json(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}
