//! `spindle`: replay a captured workload through the sampling engine.

mod replay;

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spindle_core::capture::FilteredDumper;
use spindle_core::{
    ExportOptions, MergeMode, SamplerBuilder, SamplerConfig, ThreadFilter, ThreadGrouping,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::replay::{Capture, ReplayDumper};

static ENV_FILTER: &str = "info";

#[derive(Parser, Debug)]
#[command(name = "spindle", version, about = "Call-stack sampling profiler")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample a collapsed-stack capture in real time and write the profile
    /// as JSON.
    Replay(ReplayArgs),
}

#[derive(clap::Args, Debug)]
struct ReplayArgs {
    /// Capture file: `thread;Class.method:line;... count` per line.
    capture: PathBuf,
    /// Sampler configuration as JSON. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Sampling interval in milliseconds.
    #[arg(long)]
    interval_ms: Option<u64>,
    /// How long to sample for.
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,
    /// Thread grouping: by-name, by-pool or as-one.
    #[arg(long)]
    grouping: Option<ThreadGrouping>,
    /// Only sample threads whose whole name matches one of these patterns.
    #[arg(long = "thread", value_name = "PATTERN")]
    threads: Vec<String>,
    #[arg(long)]
    ignore_sleeping: bool,
    /// Keep calls to the same method from different caller lines apart.
    #[arg(long)]
    separate_parent_calls: bool,
    /// Write the profile here instead of stdout.
    #[arg(long, short)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(ENV_FILTER)),
        )
        .with_writer(io::stderr)
        .init();

    match Args::parse().command {
        Command::Replay(args) => replay(&args),
    }
}

fn load_config(args: &ReplayArgs) -> Result<SamplerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let data = fs::read(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            SamplerConfig::from_json(&data)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => SamplerConfig::default(),
    };
    if let Some(ms) = args.interval_ms {
        config = config.with_interval(Duration::from_millis(ms));
    }
    if let Some(grouping) = args.grouping {
        config.grouping = grouping;
    }
    config.ignore_sleeping |= args.ignore_sleeping;
    Ok(config.with_complete_after(Duration::from_secs(args.duration_secs)))
}

fn replay(args: &ReplayArgs) -> Result<()> {
    let config = load_config(args)?;
    let text = fs::read_to_string(&args.capture)
        .with_context(|| format!("failed to read capture {}", args.capture.display()))?;
    let capture = Capture::parse(&text)
        .with_context(|| format!("invalid capture {}", args.capture.display()))?;
    let filter = if args.threads.is_empty() {
        ThreadFilter::All
    } else {
        ThreadFilter::patterns(&args.threads)?
    };

    let sampler = SamplerBuilder::new(config)
        .dumper(FilteredDumper::new(ReplayDumper::new(capture), filter))
        .build()?;
    sampler.start()?;
    info!(duration_secs = args.duration_secs, "replaying capture");
    let finished = sampler.completion().wait()?;

    let merge_mode = if args.separate_parent_calls {
        MergeMode::separate_parent_calls()
    } else {
        MergeMode::same_method()
    };
    let profile = finished.export(&ExportOptions::default().with_merge_mode(merge_mode));
    info!(
        groups = profile.threads.len(),
        windows = profile.time_windows.len(),
        dropped = finished.dropped_samples(),
        "profile exported"
    );

    let writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let mut writer = BufWriter::new(writer);
    serde_json::to_writer_pretty(&mut writer, &profile)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}
