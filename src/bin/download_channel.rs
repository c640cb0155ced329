#![forbid(unsafe_code)]

//! One-shot harvester: ranks the shorts of one or more channels and downloads
//! the most viral ones into `<output>/<channel>/`.
//!
//! Channels given on the command line are added to the watch-list file so the
//! scheduled `routine_update` picks them up later. Without positional
//! channels the whole watch-list is processed.

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use std::path::PathBuf;
use viralshorts_tools::channels_file::{load_channels, merge_channels, save_channels};
use viralshorts_tools::config::{
    DEFAULT_CONFIG_PATH, DEFAULT_ENV_PATH, HarvestConfig, load_config_from,
};
use viralshorts_tools::coordinator::{BatchRequest, RunReport, spawn_batch};
use viralshorts_tools::downloader::DownloadStatus;
use viralshorts_tools::process::ensure_program_available;
use viralshorts_tools::progress::ProgressEvent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Download the most viral shorts of YouTube channels."
)]
struct Cli {
    #[arg(
        value_name = "CHANNEL",
        help = "Channel URL, @handle or UC… id (default: every channel in the watch-list)"
    )]
    channels: Vec<String>,
    #[arg(
        long = "channels-file",
        value_name = "PATH",
        help = "Watch-list file, one channel per line"
    )]
    channels_file: Option<PathBuf>,
    #[arg(
        short = 'o',
        long = "output",
        value_name = "DIR",
        help = "Root directory for per-channel folders"
    )]
    output: Option<PathBuf>,
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the TOML config file")]
    config: PathBuf,
    #[arg(long = "env-file", value_name = "PATH", default_value = DEFAULT_ENV_PATH, help = "KEY=value file holding the API key")]
    env_file: PathBuf,
    #[arg(
        long = "analyze-limit",
        value_name = "N",
        help = "Shorts to analyze per channel"
    )]
    analyze_limit: Option<usize>,
    #[arg(
        long = "download-limit",
        value_name = "N",
        help = "Shorts to download per channel"
    )]
    download_limit: Option<usize>,
    #[arg(long = "no-save", help = "Do not add CHANNEL arguments to the watch-list")]
    no_save: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config_from(&cli.config, &cli.env_file)?;

    let channels = resolve_channels(&cli, &config)?;
    if channels.is_empty() {
        bail!(
            "no channels to process; pass CHANNEL arguments or add them to {}",
            watch_list_path(&cli, &config).display()
        );
    }

    ensure_program_available(&config.ytdlp_path)?;

    let request = build_request(&cli, &config, channels);
    println!("===================================");
    println!("Viral Shorts Downloader");
    println!("===================================");
    println!("Channels: {}", request.channels.join(", "));
    println!("Output directory: {}", request.output_root.display());
    println!(
        "Analyze {} / download {} per channel",
        request.analyze_limit, request.download_limit
    );
    println!();

    let batch = spawn_batch(&config, request)?;
    batch.cancel.cancel_on_interrupt()?;
    let mut last_percent = None;
    for event in batch.progress.iter() {
        match event {
            ProgressEvent::Message(text) => println!("{text}"),
            ProgressEvent::Percent(value) => {
                if last_percent != Some(value) {
                    log::debug!("progress {value}%");
                    last_percent = Some(value);
                }
            }
        }
    }
    let reports = batch
        .handle
        .join()
        .map_err(|_| anyhow!("harvest worker panicked"))?;

    print_summary(&reports);
    if batch.cancel.is_cancelled() {
        bail!("interrupted");
    }
    if !reports.is_empty() && reports.iter().all(|report| !report.is_completed()) {
        bail!("every channel failed");
    }
    Ok(())
}

fn watch_list_path(cli: &Cli, config: &HarvestConfig) -> PathBuf {
    cli.channels_file
        .clone()
        .unwrap_or_else(|| config.channels_file.clone())
}

/// Positional channels win over the watch-list; they are merged into it
/// unless `--no-save` is given.
fn resolve_channels(cli: &Cli, config: &HarvestConfig) -> Result<Vec<String>> {
    let path = watch_list_path(cli, config);
    let mut watch_list = load_channels(&path)?;
    if cli.channels.is_empty() {
        return Ok(watch_list);
    }

    let added = merge_channels(&mut watch_list, &cli.channels);
    if added > 0 && !cli.no_save {
        save_channels(&path, &watch_list)?;
        println!("Added {added} channel(s) to {}", path.display());
    }

    let mut requested = Vec::new();
    merge_channels(&mut requested, &cli.channels);
    Ok(requested)
}

fn build_request(cli: &Cli, config: &HarvestConfig, channels: Vec<String>) -> BatchRequest {
    BatchRequest {
        channels,
        output_root: cli
            .output
            .clone()
            .unwrap_or_else(|| config.output_root.clone()),
        analyze_limit: cli.analyze_limit.unwrap_or(config.max_videos_to_analyze),
        download_limit: cli.download_limit.unwrap_or(config.max_videos_to_download),
    }
}

fn print_summary(reports: &[RunReport]) {
    println!();
    println!("===================================");
    println!("Download complete!");
    println!("===================================");
    for report in reports {
        println!("{report}");
        for outcome in &report.outcomes {
            if outcome.status == DownloadStatus::Failed {
                println!(
                    "  failed {}: {}",
                    outcome.video_id,
                    outcome.error_detail.as_deref().unwrap_or("unknown error")
                );
            }
        }
        if let Some(path) = &report.snapshot_path {
            println!("  metadata: {}", path.display());
        }
    }
}
