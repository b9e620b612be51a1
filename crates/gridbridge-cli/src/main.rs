//! `gridbridge` – command line front end of the scan-to-map bridge.
//!
//! - `gridbridge run --replay session.ndjson [--rate 2.0] [--save-map out/map]`
//!   starts a node, plays a recorded session onto its bus and optionally
//!   writes the final map to disk.
//! - `gridbridge config show` prints the effective configuration.
//! - `gridbridge config init` writes the defaults to `~/.gridbridge/config.toml`.
//!
//! Ctrl-C stops playback and shuts the node down cleanly.

mod config;
mod map_saver;
mod replay;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use gridbridge_runtime::map_publisher::map_topic_name;
use gridbridge_runtime::{BridgeNode, NodeConfig, NodeReport, node_bus, telemetry};
use gridbridge_types::BridgeError;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ConfigSource;

#[derive(Parser)]
#[command(name = "gridbridge", version)]
#[command(about = "Feed laser scans and transforms into a multi-resolution grid mapper")]
struct Cli {
    /// Config file (default: ~/.gridbridge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node over a recorded session
    Run(RunArgs),
    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Newline-delimited JSON session to play back
    #[arg(long)]
    replay: PathBuf,

    /// Playback speed relative to the recorded stamps (0 = as fast as possible)
    #[arg(long, default_value_t = 1.0, value_parser = replay::parse_rate)]
    rate: f64,

    /// Write the final level-0 map to <PREFIX>.pgm and <PREFIX>.json
    #[arg(long, value_name = "PREFIX")]
    save_map: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _telemetry = telemetry::init_tracing("gridbridge");
    let path = cli.config.unwrap_or_else(config::config_path);

    let result = match cli.command {
        Command::Run(args) => run_command(&args, &path),
        Command::Config { action: ConfigAction::Show } => show_config(&path),
        Command::Config {
            action: ConfigAction::Init { force },
        } => init_config(&path, force),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn describe_source(source: &ConfigSource) {
    match source {
        ConfigSource::File(p) => {
            println!("  Config loaded from {}", p.display().to_string().bold());
        }
        ConfigSource::Defaults => println!("  {}", "No config file; using defaults.".dimmed()),
        ConfigSource::Fallback(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
        }
    }
}

fn show_config(path: &Path) -> Result<(), String> {
    let (cfg, source) = config::resolve(path);
    describe_source(&source);
    println!();
    print!("{}", config::render(&cfg)?);
    if let Err(e) = cfg.validate() {
        println!("\n  {} {}", "⚠".yellow().bold(), e);
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<(), String> {
    if path.exists() && !force {
        println!(
            "  {} already exists; pass {} to overwrite.",
            path.display().to_string().bold(),
            "--force".bold()
        );
        return Ok(());
    }
    config::save_to(&NodeConfig::default(), path)?;
    println!(
        "  {} Config saved to {}",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

fn run_command(args: &RunArgs, path: &Path) -> Result<(), String> {
    let (cfg, source) = config::resolve(path);
    describe_source(&source);
    cfg.validate().map_err(|e| e.to_string())?;

    let file = File::open(&args.replay)
        .map_err(|e| format!("Failed to open {}: {}", args.replay.display(), e))?;
    let records = replay::read_records(BufReader::new(file)).map_err(|e| e.to_string())?;
    println!(
        "  Replaying {} record(s) from {} at {}x",
        records.len(),
        args.replay.display().to_string().bold(),
        args.rate
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let ctrlc_tx = Arc::clone(&shutdown_tx);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        let _ = ctrlc_tx.send(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let runtime = tokio::runtime::Runtime::new().map_err(|e| format!("Failed to start runtime: {}", e))?;
    let report = runtime
        .block_on(run_node(cfg, records, args, shutdown_rx))
        .map_err(|e| e.to_string())?;

    println!();
    println!(
        "  {} {} scan(s) processed, {} skipped",
        "✓".green().bold(),
        report.ingest.processed,
        report.ingest.skipped
    );
    for (level, stats) in report.publishers.iter().enumerate() {
        println!(
            "    {}: {} conversion(s), {} heartbeat(s)",
            map_topic_name(level),
            stats.conversions,
            stats.heartbeats
        );
    }
    Ok(())
}

async fn run_node(
    cfg: NodeConfig,
    records: Vec<replay::ReplayRecord>,
    args: &RunArgs,
    mut shutdown: watch::Receiver<bool>,
) -> Result<NodeReport, BridgeError> {
    let bus = node_bus(&cfg);
    let handle = BridgeNode::new(cfg.clone(), bus.clone())?.start();
    let level0 = handle.grid_level(0);

    let stats = replay::replay(records, &bus, &cfg.scan_topic, args.rate, shutdown.clone()).await;
    if !stats.interrupted {
        // Give the last scan time to clear the transform gate and the
        // publisher one more cycle.
        let linger = cfg.transform_wait() + cfg.map_pub_interval();
        tokio::select! {
            _ = tokio::time::sleep(linger) => {}
            _ = shutdown.changed() => {}
        }
    }
    let report = handle.shutdown().await;

    if let Some(prefix) = &args.save_map {
        match level0.and_then(|level| map_saver::final_map(level, &bus, &cfg.map_frame)) {
            Some(grid) => {
                let (image, meta) = map_saver::save_map(&grid, prefix)?;
                info!(image = %image.display(), sidecar = %meta.display(), "map saved");
                println!(
                    "  {} Map saved to {}",
                    "✓".green().bold(),
                    image.display().to_string().bold()
                );
            }
            None => println!("  {}", "The map was never updated; nothing saved.".yellow()),
        }
    }
    Ok(report)
}
