use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{SigSet, Signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mirrorfs::{Config, Server};

#[derive(Parser)]
#[command(
    version,
    about = "Mirror a local directory over virtio-fs for DPU-attached guests."
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', value_name = "CONFIG")]
    config: PathBuf,
}

/// Route SIGINT/SIGTERM to a flag the poll and reaper loops watch. The mask
/// is installed before any thread spawns so every thread inherits it.
fn watch_signals(shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block().context("cannot block signals")?;

    std::thread::Builder::new()
        .name("mirrorfs-signals".into())
        .spawn(move || {
            if let Ok(signal) = mask.wait() {
                info!(%signal, "shutdown requested");
                shutdown.store(true, Ordering::Release);
            }
        })
        .context("cannot spawn signal thread")?;
    Ok(())
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Error: {e:#}");
            std::process::exit(1);
        }
    };
    info!(dir = %config.local_mirror.dir.display(), "mirrorfs starting up");

    let shutdown = Arc::new(AtomicBool::new(false));
    watch_signals(Arc::clone(&shutdown))?;

    let result = Server::new(config.local_mirror, shutdown).and_then(|server| server.serve());

    // Handle errors
    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }

    result
}
