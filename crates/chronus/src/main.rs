//! Music Chronus entry point.
//!
//! Headless synthesizer engine: bring up the audio core, then serve OSC
//! until interrupted. All knobs are available as flags; a TOML config file
//! provides the base values and flags override it.

use anyhow::Context;
use chronus_engine::Engine;
use chronus_protocol::EngineConfig;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Headless command-driven modular synthesizer.
#[derive(Parser, Debug)]
#[command(name = "chronus")]
#[command(about = "OSC-driven real-time modular synthesizer engine")]
struct Args {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sample rate in Hz (44100 or 48000).
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Audio buffer size in samples (128, 256, 512 or 1024).
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Audio ring depth in frames (8, 16 or 32).
    #[arg(long)]
    ring_depth: Option<usize>,

    /// Patch prime timeout in milliseconds.
    #[arg(long)]
    prime_timeout_ms: Option<u64>,

    /// Liveness monitor period in milliseconds (1-5).
    #[arg(long)]
    heartbeat_period_ms: Option<u64>,

    /// Worker lead target in frames.
    #[arg(long)]
    lead_target_frames: Option<usize>,

    /// OSC listen host.
    #[arg(long)]
    osc_host: Option<String>,

    /// OSC listen port.
    #[arg(long)]
    osc_port: Option<u16>,

    /// Visualizer broadcast host.
    #[arg(long)]
    viz_host: Option<String>,

    /// Visualizer broadcast port.
    #[arg(long)]
    viz_port: Option<u16>,

    /// Disable the visualizer broadcast.
    #[arg(long)]
    no_viz: bool,
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut cfg = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => EngineConfig::default(),
    };

    if let Some(v) = args.sample_rate {
        cfg.audio.sample_rate = v;
    }
    if let Some(v) = args.buffer_size {
        cfg.audio.buffer_size = v;
    }
    if let Some(v) = args.ring_depth {
        cfg.supervisor.ring_depth = v;
    }
    if let Some(v) = args.prime_timeout_ms {
        cfg.supervisor.prime_timeout_ms = v;
    }
    if let Some(v) = args.heartbeat_period_ms {
        cfg.supervisor.heartbeat_period_ms = v;
    }
    if let Some(v) = args.lead_target_frames {
        cfg.supervisor.lead_target_frames = v;
    }
    if let Some(v) = &args.osc_host {
        cfg.osc.host = v.clone();
    }
    if let Some(v) = args.osc_port {
        cfg.osc.port = v;
    }
    if let Some(v) = &args.viz_host {
        cfg.viz.host = v.clone();
    }
    if let Some(v) = args.viz_port {
        cfg.viz.port = v;
    }
    if args.no_viz {
        cfg.viz.enable = false;
    }

    cfg.validate()?;
    Ok(cfg)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let cfg = load_config(&args)?;

    let osc_addr = format!("{}:{}", cfg.osc.host, cfg.osc.port);
    tracing::info!(
        sample_rate = cfg.audio.sample_rate,
        buffer_size = cfg.audio.buffer_size,
        osc = %osc_addr,
        "starting engine"
    );

    let engine = Engine::start(cfg).context("engine start failed")?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("installing signal handler")?;

    tracing::info!("engine running; press Ctrl+C to stop");
    let _ = rx.recv();

    tracing::info!("shutting down");
    engine.shutdown();
    Ok(())
}
