use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use serde_json::json;
use tracing::info;

use hft_feed::config::PipelineConfig;
use hft_feed::executor::StopToken;
use hft_feed::replayer::UdpReplayer;
use hft_feed::telemetry;

#[derive(Debug, Parser)]
#[command(version, about = "Replay a capture file over UDP with its recorded timing")]
struct Args {
    /// Capture file to replay (.cap)
    #[arg(long, short = 'i')]
    input: Option<PathBuf>,

    /// JSON pipeline config; flags below override it
    #[arg(long, env = "HFT_CONFIG")]
    config: Option<PathBuf>,

    /// Where to send datagrams
    #[arg(long, env = "REPLAY_DESTINATION")]
    destination: Option<SocketAddr>,

    /// 2.0 replays twice as fast, 0.5 at half speed
    #[arg(long, env = "SPEED_FACTOR")]
    speed: Option<f64>,

    /// Core for the send thread
    #[arg(long, env = "REPLAYER_CORE")]
    core: Option<usize>,
}

fn main() -> Result<()> {
    let _ = dotenv();
    telemetry::init();
    let args = Args::parse();

    let mut cfg = PipelineConfig::load_or_default(args.config.as_deref()).context("load pipeline config")?;
    if let Some(dest) = args.destination {
        cfg.destination = dest;
    }
    if let Some(speed) = args.speed {
        cfg.speed_factor = speed;
    }
    if args.core.is_some() {
        cfg.replayer_core = args.core;
    }
    if args.input.is_some() {
        cfg.capture_path = args.input.clone();
    }
    cfg.validate().context("invalid pipeline config")?;
    let input = cfg.capture_path.clone().context("no capture file given (--input or capture_path)")?;

    let mut replayer =
        UdpReplayer::load(&input, cfg.replay()).with_context(|| format!("load {}", input.display()))?;
    info!(path = %input.display(), records = replayer.len(), "capture loaded");

    let shutdown = StopToken::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.stop()).context("install Ctrl+C handler")?;
    }

    replayer.start()?;
    while replayer.is_running() && !shutdown.is_stopped() {
        thread::sleep(Duration::from_millis(50));
    }
    let report = if shutdown.is_stopped() { replayer.stop()? } else { replayer.wait()? };

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "destination": cfg.destination,
            "speed_factor": cfg.speed_factor,
            "total": report.total,
            "sent": report.sent,
            "completed": report.completed,
            "max_lateness_ns": report.max_lateness_ns,
        }))?
    );
    Ok(())
}
