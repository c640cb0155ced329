//! Drives fetch, rank, snapshot and download for a list of channels.
//!
//! Channels are processed strictly one after another. A failing channel is
//! turned into a report entry and the batch moves on; the only thing that
//! stops a batch early is the shared [`CancelFlag`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

use crate::channel::ChannelRef;
use crate::config::{HarvestConfig, MetadataSourceKind, PacingRange, RankingStrategy};
use crate::downloader::{
    ContentSource, DownloadOrchestrator, DownloadOutcome, DownloadSettings, DownloadStatus,
    YtDlpContentSource,
};
use crate::error::ChannelError;
use crate::fetcher::{MetadataFetcher, MetadataSource, YouTubeApiSource, YtDlpFeedSource};
use crate::metadata::write_snapshot;
use crate::pacing::{CancelFlag, Pacer, PauseKind, ThreadPacer};
use crate::progress::{ProgressEvent, ProgressSink, Reporter, channel_sink};
use crate::scorer::rank_with;

#[derive(Debug)]
pub enum ChannelStatus {
    Completed,
    Failed(ChannelError),
}

#[derive(Debug)]
pub struct RunReport {
    /// The reference exactly as it was supplied.
    pub channel: String,
    pub status: ChannelStatus,
    /// Eligible shorts found before ranking.
    pub candidates: usize,
    pub outcomes: Vec<DownloadOutcome>,
    pub snapshot_path: Option<PathBuf>,
    pub elapsed: Duration,
}

impl RunReport {
    fn failed(channel: &str, error: ChannelError, elapsed: Duration) -> Self {
        Self {
            channel: channel.to_owned(),
            status: ChannelStatus::Failed(error),
            candidates: 0,
            outcomes: Vec::new(),
            snapshot_path: None,
            elapsed,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, ChannelStatus::Completed)
    }

    pub fn error(&self) -> Option<&ChannelError> {
        match &self.status {
            ChannelStatus::Completed => None,
            ChannelStatus::Failed(err) => Some(err),
        }
    }

    pub fn count(&self, status: DownloadStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn file_paths(&self) -> Vec<&Path> {
        self.outcomes
            .iter()
            .filter_map(|o| o.file_path.as_deref())
            .collect()
    }

    pub fn summary(&self) -> String {
        match &self.status {
            ChannelStatus::Failed(err) => format!("{}: {err}", self.channel),
            ChannelStatus::Completed => format!(
                "{}: {} downloaded, {} already present, {} failed, {} skipped ({} candidates, {}s)",
                self.channel,
                self.count(DownloadStatus::Success),
                self.count(DownloadStatus::AlreadyExists),
                self.count(DownloadStatus::Failed),
                self.count(DownloadStatus::Skipped),
                self.candidates,
                self.elapsed.as_secs()
            ),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Inputs of one batch run.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub channels: Vec<String>,
    pub output_root: PathBuf,
    pub analyze_limit: usize,
    pub download_limit: usize,
}

/// Work running on the worker thread. `progress` closes once the worker is
/// done; raising `cancel` stops it at the next channel or download.
pub struct WorkerHandle<T> {
    pub handle: JoinHandle<T>,
    pub progress: Receiver<ProgressEvent>,
    pub cancel: CancelFlag,
}

pub type BatchHandle = WorkerHandle<Vec<RunReport>>;

pub struct ChannelRunCoordinator {
    fetcher: MetadataFetcher,
    orchestrator: DownloadOrchestrator,
    pacer: Arc<dyn Pacer>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancelFlag,
    ranking: RankingStrategy,
    cooldown: PacingRange,
    clock: fn() -> DateTime<Utc>,
}

impl ChannelRunCoordinator {
    pub fn new(
        config: &HarvestConfig,
        fetcher: MetadataFetcher,
        content: Box<dyn ContentSource>,
        pacer: Arc<dyn Pacer>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let cancel = CancelFlag::new();
        let orchestrator = DownloadOrchestrator::new(
            content,
            Arc::clone(&pacer),
            DownloadSettings::from_config(config),
            cancel.clone(),
        );
        Self {
            fetcher,
            orchestrator,
            pacer,
            sink,
            cancel,
            ranking: config.ranking,
            cooldown: config.inter_channel_cooldown,
            clock: Utc::now,
        }
    }

    /// Replaces the wall clock used to age videos during ranking.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Production wiring: metadata from the Data API or yt-dlp depending on
    /// configuration, content from yt-dlp, real sleeps.
    pub fn from_config(config: &HarvestConfig, sink: Arc<dyn ProgressSink>) -> Result<Self> {
        let source: Box<dyn MetadataSource> = match config.effective_metadata_source() {
            MetadataSourceKind::Api => {
                let Some(key) = config.api_key.as_deref() else {
                    bail!("the Data API source needs an API key");
                };
                log::info!("metadata source: YouTube Data API");
                Box::new(YouTubeApiSource::new(key, config.request_timeout()))
            }
            _ => {
                log::info!(
                    "metadata source: {} (flat listing)",
                    config.ytdlp_path.display()
                );
                Box::new(YtDlpFeedSource::from_config(config))
            }
        };
        Ok(Self::new(
            config,
            MetadataFetcher::new(source, config),
            Box::new(YtDlpContentSource::from_config(config)),
            Arc::new(ThreadPacer),
            sink,
        ))
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn run_request(&self, request: &BatchRequest) -> Vec<RunReport> {
        self.run(
            &request.channels,
            &request.output_root,
            request.analyze_limit,
            request.download_limit,
        )
    }

    /// Processes `channels` in order and returns exactly one report per entry.
    pub fn run(
        &self,
        channels: &[String],
        output_root: &Path,
        analyze_limit: usize,
        download_limit: usize,
    ) -> Vec<RunReport> {
        let reporter = Reporter::new(self.sink.as_ref());
        let total = channels.len();
        let mut reports = Vec::with_capacity(total);
        let mut rng = rand::rng();

        for (index, raw) in channels.iter().enumerate() {
            if self.cancel.is_cancelled() {
                reports.push(RunReport::failed(raw, ChannelError::Cancelled, Duration::ZERO));
                continue;
            }

            reporter.message(&format!("Processing channel {}/{}: {}", index + 1, total, raw));
            let (report, contacted) =
                self.run_channel(raw, output_root, analyze_limit, download_limit);
            match report.error() {
                Some(err) => log::warn!("{raw}: {err}"),
                None => log::info!("{}", report.summary()),
            }
            reporter.message(&report.summary());
            reports.push(report);

            let is_last = index + 1 == total;
            if contacted && !is_last && !self.cancel.is_cancelled() {
                let pause = self.cooldown.sample(&mut rng);
                reporter.message(&format!(
                    "Waiting {} seconds before next channel",
                    pause.as_secs()
                ));
                self.pacer.pause(PauseKind::ChannelCooldown, pause);
            }
        }

        if self.cancel.is_cancelled() {
            reporter.message("Batch cancelled");
        } else {
            reporter.message(&format!("Finished {total} channel(s)"));
        }
        reports
    }

    /// Runs one channel. The flag is true when the metadata source was
    /// contacted, which is what earns the following channel a cool-down.
    fn run_channel(
        &self,
        raw: &str,
        output_root: &Path,
        analyze_limit: usize,
        download_limit: usize,
    ) -> (RunReport, bool) {
        let started = Instant::now();
        let channel = match ChannelRef::parse(raw) {
            Ok(channel) => channel,
            Err(err) => return (RunReport::failed(raw, err, started.elapsed()), false),
        };

        let dir = output_root.join(channel.folder_name());
        if let Err(source) = fs::create_dir_all(&dir) {
            let err = ChannelError::DirectoryFailure { path: dir, source };
            return (RunReport::failed(raw, err, started.elapsed()), false);
        }

        let sink = self.sink.as_ref();
        let fetched =
            self.fetcher
                .fetch_channel(&channel, analyze_limit, sink, self.pacer.as_ref());
        let records = match fetched {
            Ok(records) => records,
            Err(err) => return (RunReport::failed(raw, err, started.elapsed()), true),
        };
        let contacted = analyze_limit > 0;

        Reporter::new(sink).message(&format!(
            "Analyzing {} shorts from {channel}",
            records.len()
        ));
        let candidates = records.len();
        let ranked = rank_with(records, (self.clock)(), self.ranking);

        let snapshot_path = match write_snapshot(&dir, ranked.as_slice()) {
            Ok(path) => Some(path),
            Err(err) => {
                log::warn!("{channel}: could not write metadata snapshot: {err:#}");
                None
            }
        };

        let outcomes = self
            .orchestrator
            .download_top(&ranked, &dir, download_limit, sink);

        let report = RunReport {
            channel: raw.to_owned(),
            status: ChannelStatus::Completed,
            candidates,
            outcomes,
            snapshot_path,
            elapsed: started.elapsed(),
        };
        (report, contacted)
    }

    /// Moves the coordinator onto a named worker thread.
    pub fn spawn(self, request: BatchRequest) -> Result<JoinHandle<Vec<RunReport>>> {
        thread::Builder::new()
            .name("harvest-worker".into())
            .spawn(move || self.run_request(&request))
            .context("spawning harvest worker thread")
    }

    /// Moves the scheduler loop onto a named worker thread.
    pub fn spawn_scheduled<L, R>(
        self,
        mut schedule: Schedule,
        poll: Duration,
        load_request: L,
        on_reports: R,
    ) -> Result<JoinHandle<()>>
    where
        L: FnMut() -> Result<BatchRequest> + Send + 'static,
        R: FnMut(&[RunReport]) + Send + 'static,
    {
        thread::Builder::new()
            .name("harvest-scheduler".into())
            .spawn(move || self.run_scheduled(&mut schedule, poll, load_request, on_reports))
            .context("spawning harvest scheduler thread")
    }

    /// Polls `schedule` every `poll` and runs a batch each time it is due,
    /// until the cancel flag is raised. `load_request` is called at each due
    /// slot so edits to the channel list are picked up; `on_reports` gets
    /// the reports of every completed batch.
    pub fn run_scheduled<L, R>(
        &self,
        schedule: &mut Schedule,
        poll: Duration,
        mut load_request: L,
        mut on_reports: R,
    ) where
        L: FnMut() -> Result<BatchRequest>,
        R: FnMut(&[RunReport]),
    {
        let reporter = Reporter::new(self.sink.as_ref());
        while !self.cancel.is_cancelled() {
            if schedule.is_due(Instant::now()) {
                match load_request() {
                    Ok(request) if request.channels.is_empty() => {
                        reporter.message("No channels to process");
                    }
                    Ok(request) => {
                        let reports = self.run_request(&request);
                        on_reports(&reports);
                    }
                    Err(err) => log::warn!("scheduled run skipped: {err:#}"),
                }
                schedule.advance(Instant::now());
                reporter.message(&format!(
                    "Next run in {} minutes",
                    schedule.until_due(Instant::now()).as_secs().div_ceil(60)
                ));
            }
            self.pacer.pause(PauseKind::SchedulePoll, poll);
        }
        reporter.message("Scheduler stopped");
    }
}

/// Builds the production coordinator with a channel-backed sink and starts
/// `request` on the worker thread.
pub fn spawn_batch(config: &HarvestConfig, request: BatchRequest) -> Result<BatchHandle> {
    let (sink, progress) = channel_sink();
    let coordinator = ChannelRunCoordinator::from_config(config, Arc::new(sink))?;
    let cancel = coordinator.cancel_flag();
    let handle = coordinator.spawn(request)?;
    Ok(WorkerHandle {
        handle,
        progress,
        cancel,
    })
}

/// Production scheduler on the worker thread, reporting through a
/// channel-backed sink.
pub fn spawn_schedule<L, R>(
    config: &HarvestConfig,
    schedule: Schedule,
    load_request: L,
    on_reports: R,
) -> Result<WorkerHandle<()>>
where
    L: FnMut() -> Result<BatchRequest> + Send + 'static,
    R: FnMut(&[RunReport]) + Send + 'static,
{
    let (sink, progress) = channel_sink();
    let coordinator = ChannelRunCoordinator::from_config(config, Arc::new(sink))?;
    let cancel = coordinator.cancel_flag();
    let handle =
        coordinator.spawn_scheduled(schedule, config.schedule_poll(), load_request, on_reports)?;
    Ok(WorkerHandle {
        handle,
        progress,
        cancel,
    })
}

/// Fixed-interval wall-clock schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    interval: Duration,
    next_due: Instant,
}

impl Schedule {
    /// First slot is due immediately when `run_now` is set, otherwise one
    /// interval from now.
    pub fn new(interval: Duration, run_now: bool) -> Self {
        let now = Instant::now();
        let interval = interval.max(Duration::from_secs(1));
        Self::starting_at(interval, if run_now { now } else { now + interval })
    }

    pub fn starting_at(interval: Duration, first_due: Instant) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            next_due: first_due,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    pub fn until_due(&self, now: Instant) -> Duration {
        self.next_due.saturating_duration_since(now)
    }

    /// Moves to the first slot strictly after `now`. Slots that passed while
    /// a long run was in progress are dropped.
    pub fn advance(&mut self, now: Instant) {
        while self.next_due <= now {
            self.next_due += self.interval;
        }
    }
}
