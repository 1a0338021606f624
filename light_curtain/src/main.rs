// THEORY:
// The `light_curtain` binary replays a directory of captured frames through a
// monitoring session at a fixed rate and logs every state the session passes
// through. It wires the library together the way a host would: configuration,
// then logging, then a `Monitor` fed by an acquisition task on the blocking
// pool.
//
// A session that never left `Init` is ended with `Exit` before shutdown, so the
// final log always shows how the replay finished.

use anyhow::{Context, Result};
use clap::Parser;
use light_curtain::monitor::Monitor;
use light_curtain::source::{ImageDirSource, spawn_acquisition};
use light_curtain::{Command, Interlock, ProcessState, SafetyConfig, SafetyModule};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "light_curtain", about = "Replay frames through the light curtain safety pipeline")]
struct Args {
    /// Directory of still frames, replayed in file-name order.
    frames: PathBuf,

    /// TOML configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replay rate in frames per second.
    #[arg(long, default_value_t = 10.0)]
    fps: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SafetyConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => SafetyConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    anyhow::ensure!(args.fps > 0.0, "--fps must be positive");
    let source = ImageDirSource::open(&args.frames)
        .with_context(|| format!("opening {}", args.frames.display()))?
        .with_interval(Duration::from_secs_f64(1.0 / args.fps));
    anyhow::ensure!(!source.is_empty(), "no frames found in {}", args.frames.display());

    let module = SafetyModule::new(&config, Interlock::new());
    let monitor = Monitor::spawn(module, config.device.camera_identity.clone());

    let mut states = monitor.state_changes();
    let watcher = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(%state, "session state");
            if state == ProcessState::Terminated {
                break;
            }
        }
    });

    let summary = spawn_acquisition(source, monitor.submitter())
        .await
        .context("acquisition task failed")?;
    info!(?summary, safe = monitor.is_safe(), "replay finished");

    if monitor.state() == ProcessState::Init {
        monitor.command(Command::Exit).await?;
    }
    info!(stats = ?monitor.stats(), "final counters");
    monitor.shutdown().await?;
    watcher.abort();
    Ok(())
}
