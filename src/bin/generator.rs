use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use hft_feed::capture::default_capture_path;
use hft_feed::generator::{self, DEFAULT_SEED, GeneratorConfig};
use hft_feed::telemetry;

#[derive(Debug, Parser)]
#[command(version, about = "Write a synthetic AddOrder capture session")]
struct Args {
    /// Output path; defaults to captures/LABEL_YYYY_MM_DD.cap
    #[arg(long, short = 'o')]
    out: Option<PathBuf>,

    /// Label used in the default file name
    #[arg(long, default_value = "SYNTH")]
    label: String,

    /// Number of records
    #[arg(long, short = 'n', default_value_t = 10_000)]
    count: usize,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// Comma-separated symbols (at most 8 bytes each)
    #[arg(long, value_delimiter = ',', default_value = "AAPL,GOOG,MSFT")]
    symbols: Vec<String>,

    /// Gaps between records are drawn from 1..=max_gap_ns
    #[arg(long, default_value_t = 100)]
    max_gap_ns: u64,
}

fn main() -> Result<()> {
    telemetry::init();
    let args = Args::parse();
    let out = args.out.clone().unwrap_or_else(|| default_capture_path(&args.label));
    let config = GeneratorConfig {
        seed: args.seed,
        count: args.count,
        symbols: args.symbols,
        max_gap_ns: args.max_gap_ns,
    };
    let written = generator::generate_to_file(&out, &config).with_context(|| format!("generate {}", out.display()))?;
    info!(path = %out.display(), written, seed = config.seed, "capture session generated");
    println!("{}", out.display());
    Ok(())
}
