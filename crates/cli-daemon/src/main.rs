//! CLI entry point for the UHD downscaler.
//!
//! Parses arguments, installs logging, wires Ctrl-C to cancellation and
//! dispatches to the daemon or one of the maintenance commands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uhd_downscaler::{dry_run_scan, open_store, Config, Daemon};

/// UHD Downscaler - replaces 4K videos with 1080p H.264 versions
#[derive(Parser, Debug)]
#[command(name = "uhd-downscaler")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file; environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Run,
    /// List current candidates without processing them
    Scan,
    /// Show ledger statistics
    Stats {
        /// Number of days of daily statistics
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Delete failed records so those files are retried
    ClearFailed,
    /// Delete every record and cached analysis
    ClearAll,
    /// Delete records older than the given number of days
    Prune {
        #[arg(long)]
        days: u32,
    },
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::resolve(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config, args.verbose);

    let result = match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Scan => scan(&config).await,
        Command::Stats { days } => stats(&config, days),
        Command::ClearFailed => open_store(&config)
            .and_then(|store| Ok(store.clear_failed_records()?))
            .map(|n| println!("Cleared {} failed records", n)),
        Command::ClearAll => open_store(&config)
            .and_then(|store| Ok(store.clear_all()?))
            .map(|()| println!("Cleared all records and cached analyses")),
        Command::Prune { days } => open_store(&config)
            .and_then(|store| Ok(store.prune_records_older_than(days)?))
            .map(|n| println!("Pruned {} records older than {} days", n, days)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), uhd_downscaler::DaemonError> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing up");
            interrupt.cancel();
        }
    });

    tracing::info!("UHD downscaler starting");
    let daemon = Daemon::new(Arc::new(config), cancel).await?;
    daemon.run().await
}

async fn scan(config: &Config) -> Result<(), uhd_downscaler::DaemonError> {
    let candidates = dry_run_scan(config).await?;
    for c in &candidates {
        println!(
            "{}\t{}x{}\t{}\t{} kbps\t{}",
            c.kind,
            c.attributes.width,
            c.attributes.height,
            c.attributes.codec,
            c.attributes.bitrate / 1000,
            c.path.display()
        );
    }
    println!("{} candidate(s)", candidates.len());
    Ok(())
}

fn stats(config: &Config, days: u32) -> Result<(), uhd_downscaler::DaemonError> {
    let store = open_store(config)?;
    let stats = store.stats()?;
    println!("Records:         {}", stats.total_records);
    println!("  completed:     {}", stats.completed);
    println!("  failed:        {}", stats.failed);
    println!("Cached analyses: {}", stats.cached_analyses);
    println!("Bytes saved:     {}", stats.bytes_saved);

    let daily = store.daily_stats(days)?;
    if !daily.is_empty() {
        println!();
        println!("{:<12} {:>6} {:>8} {:>14} {:>10}", "date", "files", "success", "bytes saved", "avg secs");
        for day in daily {
            println!(
                "{:<12} {:>6} {:>7.0}% {:>14} {:>10.0}",
                day.date,
                day.files_processed,
                day.success_rate(),
                day.bytes_saved,
                day.avg_processing_secs
            );
        }
    }
    Ok(())
}
