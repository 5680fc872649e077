use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dotenvy::dotenv;
use serde::Serialize;
use tracing::{info, warn};

use hft_feed::capture::{self, CaptureRecorder, CapturedMessage, RecordHandle};
use hft_feed::affinity::Placement;
use hft_feed::clock;
use hft_feed::config::PipelineConfig;
use hft_feed::consumer::{MessageHandler, RingConsumer};
use hft_feed::executor::StopToken;
use hft_feed::listener::{ListenerStatsSnapshot, UdpListener};
use hft_feed::message::WireMessage;
use hft_feed::ring::{RingStats, SpScRingBuffer};
use hft_feed::strategy::{MeanReversion, SymbolCounter, SymbolCounterReport};
use hft_feed::telemetry;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyKind {
    Counter,
    MeanReversion,
}

#[derive(Debug, Parser)]
#[command(version, about = "UDP market data listener: socket -> ring buffer -> pinned strategy")]
struct Args {
    /// JSON pipeline config; flags below override it
    #[arg(long, env = "HFT_CONFIG")]
    config: Option<PathBuf>,

    /// UDP port to listen on
    #[arg(long, env = "LISTEN_PORT")]
    port: Option<u16>,

    /// Local address to bind
    #[arg(long, env = "BIND_IP")]
    bind: Option<IpAddr>,

    /// Ring buffer slots (power of two)
    #[arg(long, env = "RING_CAPACITY")]
    ring_capacity: Option<usize>,

    /// Core for the listener thread
    #[arg(long, env = "LISTENER_CORE")]
    listener_core: Option<usize>,

    /// Core for the consumer thread
    #[arg(long, env = "CONSUMER_CORE")]
    consumer_core: Option<usize>,

    /// Stop after this many seconds without a datagram
    #[arg(long, env = "IDLE_TIMEOUT_SECS")]
    idle_timeout: Option<u64>,

    /// Handler run on the consumer thread
    #[arg(long, value_enum, default_value_t = StrategyKind::Counter)]
    strategy: StrategyKind,

    /// Moving-average window for mean-reversion
    #[arg(long, default_value_t = 20)]
    window: usize,

    /// Record every consumed message to a capture file
    #[arg(long, default_value_t = false)]
    record: bool,

    /// Capture output path; defaults to captures/LABEL_YYYY_MM_DD.cap
    #[arg(long, env = "OUT_FILE")]
    out: Option<PathBuf>,

    /// Label used in the default capture file name
    #[arg(long, default_value = "FEED")]
    label: String,
}

impl Args {
    fn apply(&self, cfg: &mut PipelineConfig) {
        if let Some(port) = self.port {
            cfg.listen_port = port;
        }
        if let Some(ip) = self.bind {
            cfg.bind_ip = ip;
        }
        if let Some(cap) = self.ring_capacity {
            cfg.ring_capacity = cap;
        }
        if self.listener_core.is_some() {
            cfg.listener_core = self.listener_core;
        }
        if self.consumer_core.is_some() {
            cfg.consumer_core = self.consumer_core;
        }
        if self.idle_timeout.is_some() {
            cfg.idle_timeout_secs = self.idle_timeout;
        }
        if self.out.is_some() {
            cfg.capture_path = self.out.clone();
        }
    }
}

enum Strategy {
    Counter(SymbolCounter),
    MeanReversion(MeanReversion),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum StrategyReport {
    Counter(SymbolCounterReport),
    MeanReversion { buys: u64, sells: u64, holds: u64, moving_average: Option<f64> },
}

impl Strategy {
    fn report(&self) -> StrategyReport {
        match self {
            Self::Counter(c) => StrategyReport::Counter(c.report()),
            Self::MeanReversion(m) => {
                let (buys, sells, holds) = m.signal_counts();
                StrategyReport::MeanReversion { buys, sells, holds, moving_average: m.moving_average() }
            }
        }
    }
}

/// Consumer-thread handler: strategy first, then the optional recorder.
struct FeedHandler {
    strategy: Strategy,
    recorder: Option<RecordHandle>,
}

impl MessageHandler<WireMessage> for FeedHandler {
    fn on_message(&mut self, msg: &WireMessage) {
        match &mut self.strategy {
            Strategy::Counter(c) => c.on_message(msg),
            Strategy::MeanReversion(m) => m.on_message(msg),
        }
        if let Some(rec) = &self.recorder {
            rec.try_record(CapturedMessage::new(clock::mono_ns(), *msg));
        }
    }
}

#[derive(Debug, Serialize)]
struct FinalReport {
    finished_unix_ns: u128,
    listener_placement: Option<Placement>,
    consumer_placement: Option<Placement>,
    listener: ListenerStatsSnapshot,
    ring: RingStats,
    strategy: StrategyReport,
    recorded: Option<u64>,
    record_dropped: Option<u64>,
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    let _ = dotenv();
    telemetry::init();
    let args = Args::parse();

    let mut cfg = PipelineConfig::load_or_default(args.config.as_deref()).context("load pipeline config")?;
    args.apply(&mut cfg);
    cfg.validate().context("invalid pipeline config")?;
    info!(config = %serde_json::to_string(&cfg)?, "starting listener pipeline");

    let recorder = if args.record {
        let path = cfg.capture_path.clone().unwrap_or_else(|| capture::default_capture_path(&args.label));
        Some(CaptureRecorder::spawn(path, cfg.ring_capacity * 4)?)
    } else {
        None
    };

    let strategy = match args.strategy {
        StrategyKind::Counter => Strategy::Counter(SymbolCounter::new()),
        StrategyKind::MeanReversion => Strategy::MeanReversion(MeanReversion::new(args.window)),
    };
    let handler = FeedHandler { strategy, recorder: recorder.as_ref().and_then(CaptureRecorder::handle) };

    let (producer, consumer) = SpScRingBuffer::<WireMessage>::with_capacity(cfg.ring_capacity)?.split();
    let ring = consumer.monitor();
    let consumer = RingConsumer::spawn(consumer, cfg.consumer_core, handler).context("start consumer")?;
    // Ctrl+C stops the listener directly; the consumer is stopped after the
    // ring has drained.
    let shutdown = StopToken::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.stop()).context("install Ctrl+C handler")?;
    }
    let mut listener = UdpListener::new(cfg.listener(), producer).context("create listener")?;
    listener.start_with_token(shutdown.clone()).context("start listener")?;

    let stats = listener.stats();
    let idle_timeout = cfg.idle_timeout();
    let started_ns = clock::mono_ns();
    while !shutdown.is_stopped() {
        thread::sleep(Duration::from_millis(100));
        if shutdown.is_stopped() {
            info!("shutdown requested");
            break;
        }
        if !listener.is_running() {
            warn!("listener thread exited on its own");
            break;
        }
        if let Some(timeout) = idle_timeout {
            let last = stats.last_recv_mono_ns.load(Ordering::Relaxed).max(started_ns);
            if clock::mono_ns().saturating_sub(last) >= timeout.as_nanos() as u64 {
                info!(?timeout, "no traffic within idle timeout, shutting down");
                break;
            }
        }
    }

    let listener_placement = listener.placement();
    listener.stop();
    let consumer_placement = consumer.placement();
    // Let the consumer catch up with whatever the listener already pushed.
    while !ring.is_empty() && !consumer.is_finished() {
        thread::sleep(Duration::from_millis(1));
    }
    let FeedHandler { strategy, recorder: handle } = consumer.stop().context("consumer thread panicked")?;
    drop(handle);

    let (recorded, record_dropped) = match recorder {
        Some(r) => {
            let dropped = r.dropped();
            (Some(r.finish()?), Some(dropped))
        }
        None => (None, None),
    };

    let report = FinalReport {
        finished_unix_ns: clock::unix_ns(),
        listener_placement,
        consumer_placement,
        listener: stats.snapshot(),
        ring: ring.stats(),
        strategy: strategy.report(),
        recorded,
        record_dropped,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
