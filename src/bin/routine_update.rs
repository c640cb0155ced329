#![forbid(unsafe_code)]

//! Long-running helper that re-harvests every channel of the watch-list on a
//! fixed interval. Acts like a cron job that never leaves the foreground.

use anyhow::{Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use viralshorts_tools::channels_file::load_channels;
use viralshorts_tools::config::{
    DEFAULT_CONFIG_PATH, DEFAULT_ENV_PATH, HarvestConfig, load_config_from,
};
use viralshorts_tools::coordinator::{BatchRequest, RunReport, Schedule, spawn_schedule};
use viralshorts_tools::process::ensure_program_available;
use viralshorts_tools::progress::ProgressEvent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Harvest viral shorts for every watched channel on a schedule."
)]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the TOML config file")]
    config: PathBuf,
    #[arg(long = "env-file", value_name = "PATH", default_value = DEFAULT_ENV_PATH, help = "KEY=value file holding the API key")]
    env_file: PathBuf,
    #[arg(
        long = "channels-file",
        value_name = "PATH",
        help = "Watch-list file, re-read before every run"
    )]
    channels_file: Option<PathBuf>,
    #[arg(
        short = 'o',
        long = "output",
        value_name = "DIR",
        help = "Root directory for per-channel folders"
    )]
    output: Option<PathBuf>,
    #[arg(long = "run-now", help = "Run once immediately instead of waiting an interval")]
    run_now: bool,
}

/// Everything a scheduled run needs besides the channel list itself.
#[derive(Debug, Clone)]
struct RoutinePlan {
    channels_file: PathBuf,
    output_root: PathBuf,
    analyze_limit: usize,
    download_limit: usize,
}

impl RoutinePlan {
    fn new(cli: &Cli, config: &HarvestConfig) -> Self {
        Self {
            channels_file: cli
                .channels_file
                .clone()
                .unwrap_or_else(|| config.channels_file.clone()),
            output_root: cli
                .output
                .clone()
                .unwrap_or_else(|| config.output_root.clone()),
            analyze_limit: config.max_videos_to_analyze,
            download_limit: config.schedule.download_limit,
        }
    }

    fn load_request(&self) -> Result<BatchRequest> {
        Ok(BatchRequest {
            channels: load_channels(&self.channels_file)?,
            output_root: self.output_root.clone(),
            analyze_limit: self.analyze_limit,
            download_limit: self.download_limit,
        })
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config_from(&cli.config, &cli.env_file)?;
    ensure_program_available(&config.ytdlp_path)?;

    let plan = RoutinePlan::new(&cli, &config);
    announce(&plan, &config, cli.run_now);

    let schedule = Schedule::new(config.schedule_interval(), cli.run_now);
    let worker = spawn_schedule(
        &config,
        schedule,
        move || plan.load_request(),
        log_batch,
    )?;
    worker.cancel.cancel_on_interrupt()?;

    for event in worker.progress.iter() {
        if let ProgressEvent::Message(text) = event {
            println!("{text}");
        }
    }
    worker
        .handle
        .join()
        .map_err(|_| anyhow!("harvest scheduler panicked"))
}

fn log_batch(reports: &[RunReport]) {
    let completed = reports.iter().filter(|report| report.is_completed()).count();
    log::info!(
        "scheduled run finished: {completed} of {} channel(s) completed",
        reports.len()
    );
}

fn announce(plan: &RoutinePlan, config: &HarvestConfig, run_now: bool) {
    println!("Routine update");
    println!("  watch-list: {}", plan.channels_file.display());
    println!("  output: {}", plan.output_root.display());
    println!(
        "  every {} minutes, {} downloads per channel{}",
        config.schedule.interval_secs / 60,
        plan.download_limit,
        if run_now { ", first run now" } else { "" }
    );
}
