//! Stagedoor - Clock-Sync Doctor
//!
//! Small operational entry point: loads the configuration, measures the
//! offset against the configured (or overridden) time source and prints
//! it, so skew can be checked before queueing tasks.

use std::time::Duration;

use clap::Parser;

use stagedoor::clock::{TimeSource, TimeSyncClient};
use stagedoor::config::AppConfig;
use stagedoor::logging::{self, OpTimer};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "stagedoor")]
#[command(about = "Stagedoor - time sync doctor for the purchase orchestrator")]
#[command(version)]
struct Args {
    /// Time source override (HTTP endpoint or NTP host).
    #[arg(short, long, env = "STAGEDOOR_TIME_SOURCE")]
    source: Option<String>,

    /// Sync timeout override in milliseconds.
    #[arg(long, env = "STAGEDOOR_SYNC_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Number of measurements to take.
    #[arg(short = 'n', long, default_value = "3")]
    samples: u32,

    /// Log level.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let config = AppConfig::load()?;
    let source = TimeSource::parse(args.source.as_deref().unwrap_or(&config.time.source));
    let timeout = Duration::from_millis(args.timeout_ms.unwrap_or(config.time.sync_timeout_ms));

    tracing::info!(source = %source, ?timeout, "measuring clock offset");

    let client = TimeSyncClient::new();
    let mut offsets = Vec::new();

    for sample in 1..=args.samples {
        let timer = OpTimer::new("clock", "sync");
        let result = client.sync(&source, timeout).await;
        timer.finish_with_result(result.as_ref().map(|_| &()));

        match result {
            Ok(offset) => {
                println!("sample {sample}: offset {:+}ms", offset.offset_millis);
                offsets.push(offset.offset_millis);
            }
            Err(e) => {
                eprintln!("sample {sample}: {e}");
            }
        }
    }

    if offsets.is_empty() {
        anyhow::bail!("no successful measurement against {source}");
    }

    let mean = offsets.iter().sum::<i64>() / offsets.len() as i64;
    println!(
        "local clock is {}ms {} the source ({} of {} samples)",
        mean.abs(),
        if mean >= 0 { "behind" } else { "ahead of" },
        offsets.len(),
        args.samples
    );
    Ok(())
}
