use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use gcs::bridge::HandlerRegistry;
use gcs::config::{AgentConfig, RuntimeKind};
use gcs::logging::init_tracing;
use gcs::runtime::{ProcessShim, Runtime};
use gcs::{Bridge, GCS_VERSION, Host, Publisher, transport};

#[tokio::main]
async fn main() -> ExitCode {
    let config = AgentConfig::parse();
    if let Err(e) = init_tracing(&config.log_config()) {
        eprintln!("gcs: failed to open log file: {e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "GCS exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AgentConfig) -> Result<()> {
    tracing::info!(
        version = GCS_VERSION,
        runtime = ?config.runtime,
        max_version = %config.max_version(),
        "GCS started"
    );

    let runtime = build_runtime(&config)?;
    let publisher = Publisher::new();
    let host = Host::new(runtime, publisher.clone());

    let mut handlers = HandlerRegistry::builder();
    host.assign_handlers(&mut handlers);
    let bridge = Bridge::new(config.bridge_config(), handlers.build(), publisher);

    let (reader, writer) = if config.use_inouterr {
        tracing::info!("Bridging over stdin/stdout");
        transport::stdio()
    } else {
        transport::dial_vsock(config.vsock_port)
            .await
            .with_context(|| format!("failed to dial host on vsock port {:#x}", config.vsock_port))?
    };

    bridge.serve(reader, writer).await.context("bridge failed")?;
    tracing::info!("GCS shut down cleanly");
    Ok(())
}

fn build_runtime(config: &AgentConfig) -> Result<Arc<dyn Runtime>> {
    match config.runtime {
        RuntimeKind::Shim => Ok(Arc::new(ProcessShim::new())),
        RuntimeKind::Runc => build_runc(config),
    }
}

#[cfg(unix)]
fn build_runc(config: &AgentConfig) -> Result<Arc<dyn Runtime>> {
    // Detached runc processes are reparented to us so they can be reaped.
    #[cfg(target_os = "linux")]
    nix::sys::prctl::set_child_subreaper(true).context("failed to become child subreaper")?;

    let runc = config.runc_config();
    tracing::debug!(binary = %runc.binary.display(), root = %runc.root.display(), "Using runc runtime");
    Ok(Arc::new(gcs::runtime::RuncRuntime::new(runc)))
}

#[cfg(not(unix))]
fn build_runc(_config: &AgentConfig) -> Result<Arc<dyn Runtime>> {
    anyhow::bail!("the runc runtime requires a unix host")
}
