//! Rate-limited retrieval of the top-ranked shorts.
//!
//! The orchestrator walks a prefix of [`RankedVideos`] in rank order, skips
//! anything already on disk, hands the rest to a [`ContentSource`] and paces
//! itself between attempts. One failed video never stops the loop.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::{FormatPreference, HarvestConfig, PacingRange};
use crate::error::{DownloadFailure, DownloadFailureKind};
use crate::metadata::{VideoRecord, shorts_url};
use crate::pacing::{CancelFlag, Pacer, PauseKind};
use crate::process::{ProcessError, run_with_timeout};
use crate::progress::{ProgressSink, Reporter, percent_of};
use crate::scorer::RankedVideos;

pub const ARCHIVE_FILE: &str = "download-archive.txt";

const MAX_TITLE_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Success,
    AlreadyExists,
    /// The record was unusable (malformed id); nothing was contacted.
    Skipped,
    Failed,
}

impl DownloadStatus {
    fn label(&self) -> &'static str {
        match self {
            DownloadStatus::Success => "Downloaded",
            DownloadStatus::AlreadyExists => "Already present",
            DownloadStatus::Skipped => "Skipped",
            DownloadStatus::Failed => "Failed",
        }
    }
}

/// Result of one attempt. `file_path` is set for `AlreadyExists` and for a
/// `Success` that produced a file; error fields only for `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadOutcome {
    pub video_id: String,
    pub status: DownloadStatus,
    pub file_path: Option<PathBuf>,
    pub error_detail: Option<String>,
    pub failure_kind: Option<DownloadFailureKind>,
}

impl DownloadOutcome {
    fn new(video_id: &str, status: DownloadStatus) -> Self {
        Self {
            video_id: video_id.to_owned(),
            status,
            file_path: None,
            error_detail: None,
            failure_kind: None,
        }
    }

    pub fn success(video_id: &str, file_path: Option<PathBuf>) -> Self {
        Self {
            file_path,
            ..Self::new(video_id, DownloadStatus::Success)
        }
    }

    pub fn already_exists(video_id: &str, file_path: PathBuf) -> Self {
        Self {
            file_path: Some(file_path),
            ..Self::new(video_id, DownloadStatus::AlreadyExists)
        }
    }

    pub fn skipped(video_id: &str) -> Self {
        Self::new(video_id, DownloadStatus::Skipped)
    }

    pub fn failed(video_id: &str, failure: DownloadFailure) -> Self {
        Self {
            error_detail: Some(failure.detail),
            failure_kind: Some(failure.kind),
            ..Self::new(video_id, DownloadStatus::Failed)
        }
    }
}

/// What the content source is asked to produce: `<destination>/<stem>.<extension>`.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub video_id: &'a str,
    pub url: String,
    pub destination: &'a Path,
    pub stem: String,
    pub extension: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedPayload {
    Saved(PathBuf),
    /// The source recognised the video as already retrieved and wrote nothing.
    AlreadyRetrieved,
}

pub trait ContentSource: Send + Sync {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchedPayload, DownloadFailure>;
}

/// Eleven characters from `[A-Za-z0-9_-]`.
pub fn is_valid_video_id(video_id: &str) -> bool {
    video_id.len() == 11
        && video_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Replaces path separators and characters Windows refuses, squeezes
/// whitespace and caps the length.
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let squeezed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = squeezed.trim_matches(|c: char| c == '.' || c == ' ');
    trimmed.chars().take(MAX_TITLE_CHARS).collect::<String>().trim_end().to_owned()
}

/// File stem used for a record: `<title> [<id>]`, or just `<id>` when the
/// title sanitizes to nothing.
pub fn output_stem(record: &VideoRecord) -> String {
    let title = sanitize_title(&record.title);
    if title.is_empty() {
        record.video_id.clone()
    } else {
        format!("{title} [{}]", record.video_id)
    }
}

pub fn expected_output_path(destination: &Path, record: &VideoRecord, extension: &str) -> PathBuf {
    destination.join(format!("{}.{extension}", output_stem(record)))
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub per_download: PacingRange,
    pub per_batch: PacingRange,
    pub batch_every: usize,
    pub extension: &'static str,
}

impl DownloadSettings {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            per_download: config.per_download_pacing,
            per_batch: config.per_batch_pacing,
            batch_every: config.batch_every.max(1),
            extension: config.format_preference.extension(),
        }
    }
}

pub struct DownloadOrchestrator {
    content: Box<dyn ContentSource>,
    pacer: Arc<dyn Pacer>,
    settings: DownloadSettings,
    cancel: CancelFlag,
}

impl DownloadOrchestrator {
    pub fn new(
        content: Box<dyn ContentSource>,
        pacer: Arc<dyn Pacer>,
        settings: DownloadSettings,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            content,
            pacer,
            settings,
            cancel,
        }
    }

    /// Attempts the first `limit` candidates in rank order. Returns one
    /// outcome per attempted candidate; a cancellation stops before the next
    /// candidate and the list is shorter.
    pub fn download_top(
        &self,
        ranked: &RankedVideos,
        destination: &Path,
        limit: usize,
        sink: &dyn ProgressSink,
    ) -> Vec<DownloadOutcome> {
        let reporter = Reporter::new(sink);
        let candidates = ranked.top(limit);
        let total = candidates.len();
        let mut outcomes = Vec::with_capacity(total);
        if total == 0 {
            reporter.message("No videos to download");
            return outcomes;
        }

        reporter.message(&format!("Preparing to download top {total} videos"));
        let mut rng = rand::rng();

        for (index, record) in candidates.iter().enumerate() {
            if self.cancel.is_cancelled() {
                reporter.message(&format!("Download cancelled after {index} of {total}"));
                break;
            }

            let outcome = self.download_one(record, destination);
            reporter.message(&format!(
                "[{}/{}] {}: {}",
                index + 1,
                total,
                outcome.status.label(),
                record.title
            ));
            reporter.percent(percent_of(index + 1, total));
            if let Some(detail) = &outcome.error_detail {
                log::warn!("{}: {}", record.video_id, detail);
            }

            outcomes.push(outcome);

            // Every attempt is paced, whatever its outcome. Nothing follows
            // the last candidate except a due batch pause.
            let attempts = index + 1;
            if attempts < total {
                let pause = self.settings.per_download.sample(&mut rng);
                self.pacer.pause(PauseKind::PerDownload, pause);
            }
            if attempts % self.settings.batch_every == 0 {
                let pause = self.settings.per_batch.sample(&mut rng);
                reporter.message(&format!(
                    "Rate limiting: pausing for {} seconds",
                    pause.as_secs()
                ));
                self.pacer.pause(PauseKind::Batch, pause);
            }
        }

        outcomes
    }

    fn download_one(&self, record: &VideoRecord, destination: &Path) -> DownloadOutcome {
        let video_id = record.video_id.as_str();
        if !is_valid_video_id(video_id) {
            log::warn!("skipping record with malformed video id {video_id:?}");
            return DownloadOutcome::skipped(video_id);
        }

        let target = expected_output_path(destination, record, self.settings.extension);
        if target.exists() {
            return DownloadOutcome::already_exists(video_id, target);
        }

        let request = FetchRequest {
            video_id,
            url: shorts_url(video_id),
            destination,
            stem: output_stem(record),
            extension: self.settings.extension,
        };
        match self.content.fetch(&request) {
            Ok(FetchedPayload::Saved(path)) if path.exists() => {
                DownloadOutcome::success(video_id, Some(path))
            }
            Ok(FetchedPayload::Saved(path)) => DownloadOutcome::failed(
                video_id,
                DownloadFailure::new(
                    DownloadFailureKind::IoError,
                    format!("reported file {} does not exist", path.display()),
                ),
            ),
            Ok(FetchedPayload::AlreadyRetrieved) => DownloadOutcome::success(video_id, None),
            Err(failure) => DownloadOutcome::failed(video_id, failure),
        }
    }
}

/// Downloads through the `yt-dlp` executable.
pub struct YtDlpContentSource {
    program: PathBuf,
    timeout: Duration,
    format: FormatPreference,
    rate_limit: String,
    sleep_requests_secs: u64,
    cookies_file: Option<PathBuf>,
    user_agent: Option<String>,
    referer: Option<String>,
}

impl YtDlpContentSource {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            program: config.ytdlp_path.clone(),
            timeout: config.request_timeout(),
            format: config.format_preference,
            rate_limit: config.rate_limit.clone(),
            sleep_requests_secs: config.sleep_requests_secs,
            cookies_file: config.cookies_file.clone(),
            user_agent: config.user_agent.clone(),
            referer: config.referer.clone(),
        }
    }

    fn build_command(&self, request: &FetchRequest<'_>) -> Command {
        let output_template = request.destination.join(format!("{}.%(ext)s", request.stem));
        let archive = request.destination.join(ARCHIVE_FILE);

        let mut command = Command::new(&self.program);
        command
            .arg("--format")
            .arg(self.format.selector())
            .arg("--remux-video")
            .arg(request.extension)
            .arg("--output")
            .arg(output_template.to_string_lossy().to_string())
            .arg("--print")
            .arg("after_move:filepath")
            .arg("--no-simulate")
            .arg("--download-archive")
            .arg(archive.to_string_lossy().to_string())
            .arg("--limit-rate")
            .arg(&self.rate_limit)
            .arg("--sleep-requests")
            .arg(self.sleep_requests_secs.to_string())
            .arg("--no-playlist")
            .arg("--no-progress")
            .arg("--no-warnings");

        if let Some(cookies) = self.cookies_file.as_ref().filter(|path| path.exists()) {
            command
                .arg("--cookies")
                .arg(cookies.to_string_lossy().to_string());
        }
        if let Some(agent) = &self.user_agent {
            command.arg("--user-agent").arg(agent);
        }
        if let Some(referer) = &self.referer {
            command.arg("--referer").arg(referer);
        }
        command.arg(&request.url);
        command
    }
}

impl ContentSource for YtDlpContentSource {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchedPayload, DownloadFailure> {
        let mut command = self.build_command(request);
        log::debug!("yt-dlp download {}", request.url);
        let output = run_with_timeout(&mut command, self.timeout).map_err(|err| match &err {
            ProcessError::TimedOut(_) => {
                DownloadFailure::new(DownloadFailureKind::Unknown, err.to_string())
            }
            _ => DownloadFailure::new(DownloadFailureKind::IoError, err.to_string()),
        })?;
        classify_ytdlp_output(output.status.success(), &output.stdout, &output.stderr)
    }
}

/// Maps a finished yt-dlp run onto a payload or a classified failure.
pub fn classify_ytdlp_output(
    success: bool,
    stdout: &str,
    stderr: &str,
) -> Result<FetchedPayload, DownloadFailure> {
    let lowered = format!("{stdout}\n{stderr}").to_lowercase();
    if lowered.contains("has already been recorded in the archive")
        || lowered.contains("has already been downloaded")
    {
        return Ok(FetchedPayload::AlreadyRetrieved);
    }

    if success {
        // --print writes the final path on its own line; --quiet hides the rest.
        let printed = stdout
            .lines()
            .map(str::trim)
            .rev()
            .find(|line| !line.is_empty() && !line.starts_with('['));
        return Ok(match printed {
            Some(path) => FetchedPayload::Saved(PathBuf::from(path)),
            None => FetchedPayload::AlreadyRetrieved,
        });
    }

    let detail = stderr
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .unwrap_or("yt-dlp exited without error output")
        .to_owned();

    if lowered.contains("http error 429")
        || lowered.contains("too many requests")
        || lowered.contains("rate-limited")
        || lowered.contains("rate limited")
    {
        return Err(DownloadFailure::rate_limited());
    }

    let kind = if lowered.contains("video unavailable")
        || lowered.contains("private video")
        || lowered.contains("is not available")
        || lowered.contains("has been removed")
        || lowered.contains("members-only")
        || lowered.contains("sign in to confirm your age")
    {
        DownloadFailureKind::Unavailable
    } else if lowered.contains("no space left")
        || lowered.contains("permission denied")
        || lowered.contains("unable to open for writing")
        || lowered.contains("read-only file system")
    {
        DownloadFailureKind::IoError
    } else {
        DownloadFailureKind::Unknown
    };
    Err(DownloadFailure::new(kind, detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::testing::RecordingPacer;
    use crate::progress::testing::RecordingSink;
    use crate::scorer::score_and_rank_at;
    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    enum Behavior {
        Fail(DownloadFailure),
        Archived,
        MissingFile,
    }

    /// Writes `<stem>.<ext>` unless told otherwise, and records every call.
    #[derive(Default)]
    struct FakeContent {
        calls: Mutex<Vec<String>>,
        behaviors: HashMap<String, Behavior>,
    }

    impl FakeContent {
        fn with(mut self, id: &str, behavior: Behavior) -> Self {
            self.behaviors.insert(id.to_owned(), behavior);
            self
        }
    }

    impl ContentSource for Arc<FakeContent> {
        fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchedPayload, DownloadFailure> {
            self.calls.lock().push(request.video_id.to_owned());
            match self.behaviors.get(request.video_id) {
                Some(Behavior::Fail(failure)) => Err(failure.clone()),
                Some(Behavior::Archived) => Ok(FetchedPayload::AlreadyRetrieved),
                Some(Behavior::MissingFile) => Ok(FetchedPayload::Saved(
                    request.destination.join("ghost.mp4"),
                )),
                None => {
                    let path = request
                        .destination
                        .join(format!("{}.{}", request.stem, request.extension));
                    fs::write(&path, b"video").map_err(|err| {
                        DownloadFailure::new(DownloadFailureKind::IoError, err.to_string())
                    })?;
                    Ok(FetchedPayload::Saved(path))
                }
            }
        }
    }

    fn id(n: usize) -> String {
        format!("vid{n:08}")
    }

    fn record(video_id: &str, views: u64) -> VideoRecord {
        VideoRecord {
            video_id: video_id.to_owned(),
            title: format!("Clip {video_id}"),
            view_count: views,
            like_count: 0,
            comment_count: 0,
            published_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            duration_seconds: 20,
            has_statistics: true,
            viral_score: None,
        }
    }

    fn ranked(count: usize) -> RankedVideos {
        let records = (0..count).map(|n| record(&id(n), (count - n) as u64 * 100)).collect();
        score_and_rank_at(records, Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap())
    }

    fn settings() -> DownloadSettings {
        DownloadSettings::from_config(&HarvestConfig::default())
    }

    fn orchestrator(
        content: &Arc<FakeContent>,
        pacer: &Arc<RecordingPacer>,
        cancel: CancelFlag,
    ) -> DownloadOrchestrator {
        DownloadOrchestrator::new(
            Box::new(Arc::clone(content)),
            pacer.clone(),
            settings(),
            cancel,
        )
    }

    #[test]
    fn downloads_limit_candidates_with_one_batch_pause() -> Result<()> {
        let dir = tempdir()?;
        let content = Arc::new(FakeContent::default());
        let pacer = Arc::new(RecordingPacer::default());
        let sink = RecordingSink::default();

        let outcomes = orchestrator(&content, &pacer, CancelFlag::new()).download_top(
            &ranked(15),
            dir.path(),
            10,
            &sink,
        );

        assert_eq!(outcomes.len(), 10);
        assert!(outcomes.iter().all(|o| o.status == DownloadStatus::Success));
        let expected: Vec<String> = (0..10).map(id).collect();
        assert_eq!(*content.calls.lock(), expected);
        assert_eq!(pacer.count(PauseKind::PerDownload), 9);
        assert_eq!(pacer.count(PauseKind::Batch), 1);
        assert_eq!(pacer.kinds().last(), Some(&PauseKind::Batch));

        let messages = sink.messages();
        assert_eq!(messages[0], "Preparing to download top 10 videos");
        assert!(messages.iter().any(|m| m.starts_with("[10/10] Downloaded:")));
        assert_eq!(sink.percents().last(), Some(&100));
        Ok(())
    }

    #[test]
    fn existing_file_is_not_fetched_but_still_paced() -> Result<()> {
        let dir = tempdir()?;
        let ranked = ranked(2);
        let existing = expected_output_path(dir.path(), &ranked.as_slice()[0], "mp4");
        fs::write(&existing, b"old")?;

        let content = Arc::new(FakeContent::default());
        let pacer = Arc::new(RecordingPacer::default());
        let outcomes = orchestrator(&content, &pacer, CancelFlag::new()).download_top(
            &ranked,
            dir.path(),
            5,
            &RecordingSink::default(),
        );

        assert_eq!(outcomes[0].status, DownloadStatus::AlreadyExists);
        assert_eq!(outcomes[0].file_path.as_deref(), Some(existing.as_path()));
        assert_eq!(outcomes[1].status, DownloadStatus::Success);
        assert_eq!(*content.calls.lock(), vec![id(1)]);
        assert_eq!(pacer.kinds(), vec![PauseKind::PerDownload]);
        Ok(())
    }

    #[test]
    fn files_already_on_disk_count_toward_pacing() -> Result<()> {
        let dir = tempdir()?;
        let ranked = ranked(15);
        for record in &ranked.as_slice()[..3] {
            fs::write(expected_output_path(dir.path(), record, "mp4"), b"old")?;
        }

        let content = Arc::new(FakeContent::default());
        let pacer = Arc::new(RecordingPacer::default());
        let outcomes = orchestrator(&content, &pacer, CancelFlag::new()).download_top(
            &ranked,
            dir.path(),
            10,
            &RecordingSink::default(),
        );

        assert_eq!(outcomes.len(), 10);
        assert!(outcomes[..3].iter().all(|o| o.status == DownloadStatus::AlreadyExists));
        assert!(outcomes[3..].iter().all(|o| o.status == DownloadStatus::Success));
        let fetched: Vec<String> = (3..10).map(id).collect();
        assert_eq!(*content.calls.lock(), fetched);
        assert_eq!(pacer.count(PauseKind::PerDownload), 9);
        assert_eq!(pacer.count(PauseKind::Batch), 1);
        assert_eq!(pacer.kinds().last(), Some(&PauseKind::Batch));
        Ok(())
    }

    #[test]
    fn batch_pause_lands_mid_run_and_last_attempt_is_unpaced() -> Result<()> {
        let dir = tempdir()?;
        let content = Arc::new(FakeContent::default());
        let pacer = Arc::new(RecordingPacer::default());
        orchestrator(&content, &pacer, CancelFlag::new()).download_top(
            &ranked(12),
            dir.path(),
            12,
            &RecordingSink::default(),
        );

        let kinds = pacer.kinds();
        assert_eq!(pacer.count(PauseKind::PerDownload), 11);
        assert_eq!(pacer.count(PauseKind::Batch), 1);
        assert_eq!(kinds[9], PauseKind::PerDownload);
        assert_eq!(kinds[10], PauseKind::Batch);
        assert_eq!(kinds.last(), Some(&PauseKind::PerDownload));
        Ok(())
    }

    #[test]
    fn failures_are_recorded_and_loop_continues() -> Result<()> {
        let dir = tempdir()?;
        let content = Arc::new(
            FakeContent::default()
                .with(&id(0), Behavior::Fail(DownloadFailure::rate_limited()))
                .with(&id(1), Behavior::MissingFile)
                .with(&id(2), Behavior::Archived),
        );
        let pacer = Arc::new(RecordingPacer::default());
        let outcomes = orchestrator(&content, &pacer, CancelFlag::new()).download_top(
            &ranked(4),
            dir.path(),
            4,
            &RecordingSink::default(),
        );

        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[0].status, DownloadStatus::Failed);
        assert_eq!(outcomes[0].failure_kind, Some(DownloadFailureKind::RateLimited));
        assert_eq!(outcomes[0].error_detail.as_deref(), Some("rate limited"));
        assert_eq!(outcomes[1].failure_kind, Some(DownloadFailureKind::IoError));
        assert_eq!(outcomes[2].status, DownloadStatus::Success);
        assert!(outcomes[2].file_path.is_none());
        assert_eq!(outcomes[3].status, DownloadStatus::Success);
        assert!(outcomes[3].file_path.as_ref().is_some_and(|p| p.exists()));
        assert_eq!(pacer.count(PauseKind::PerDownload), 3);
        Ok(())
    }

    #[test]
    fn malformed_ids_are_skipped_without_contact_but_paced() -> Result<()> {
        let dir = tempdir()?;
        let ranked = score_and_rank_at(
            vec![record("short", 10), record(&id(7), 5)],
            Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap(),
        );
        let content = Arc::new(FakeContent::default());
        let pacer = Arc::new(RecordingPacer::default());
        let outcomes = orchestrator(&content, &pacer, CancelFlag::new()).download_top(
            &ranked,
            dir.path(),
            10,
            &RecordingSink::default(),
        );

        assert_eq!(outcomes[0].status, DownloadStatus::Skipped);
        assert!(outcomes[0].error_detail.is_none());
        assert_eq!(*content.calls.lock(), vec![id(7)]);
        assert_eq!(pacer.kinds(), vec![PauseKind::PerDownload]);
        Ok(())
    }

    #[test]
    fn zero_limit_and_cancellation_attempt_nothing() -> Result<()> {
        let dir = tempdir()?;
        let content = Arc::new(FakeContent::default());
        let pacer = Arc::new(RecordingPacer::default());
        let sink = RecordingSink::default();

        let outcomes = orchestrator(&content, &pacer, CancelFlag::new()).download_top(
            &ranked(3),
            dir.path(),
            0,
            &sink,
        );
        assert!(outcomes.is_empty());
        assert_eq!(sink.messages(), vec!["No videos to download".to_owned()]);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcomes =
            orchestrator(&content, &pacer, cancel).download_top(&ranked(3), dir.path(), 3, &sink);
        assert!(outcomes.is_empty());
        assert!(content.calls.lock().is_empty());
        assert!(pacer.kinds().is_empty());
        Ok(())
    }

    #[test]
    fn video_id_validation() {
        assert!(is_valid_video_id("dQw4w9WgXcQ"));
        assert!(is_valid_video_id("a-b_c-d_e-f"));
        assert!(!is_valid_video_id("dQw4w9WgXc"));
        assert!(!is_valid_video_id("dQw4w9WgXc!"));
        assert!(!is_valid_video_id("dQw4w9WgXcQQ"));
    }

    #[test]
    fn titles_are_made_filesystem_safe() {
        assert_eq!(sanitize_title("a/b\\c: what?"), "a_b_c_ what_");
        assert_eq!(sanitize_title("  many   spaces\n\there  "), "many spaces here");
        assert_eq!(sanitize_title("..."), "");
        assert_eq!(sanitize_title(&"x".repeat(200)).len(), MAX_TITLE_CHARS);

        let mut untitled = record("dQw4w9WgXcQ", 1);
        untitled.title = "???".into();
        assert_eq!(output_stem(&untitled), "___ [dQw4w9WgXcQ]");
        untitled.title = " ".into();
        assert_eq!(output_stem(&untitled), "dQw4w9WgXcQ");
    }

    #[test]
    fn ytdlp_output_classification() {
        assert_eq!(
            classify_ytdlp_output(true, "/tmp/out/clip [id].mp4\n", ""),
            Ok(FetchedPayload::Saved(PathBuf::from("/tmp/out/clip [id].mp4")))
        );
        assert_eq!(
            classify_ytdlp_output(true, "", ""),
            Ok(FetchedPayload::AlreadyRetrieved)
        );
        assert_eq!(
            classify_ytdlp_output(
                true,
                "[download] abc has already been recorded in the archive\n",
                ""
            ),
            Ok(FetchedPayload::AlreadyRetrieved)
        );

        let err = classify_ytdlp_output(false, "", "ERROR: HTTP Error 429: Too Many Requests")
            .unwrap_err();
        assert_eq!(err, DownloadFailure::rate_limited());

        let err = classify_ytdlp_output(false, "", "ERROR: [youtube] abc: Private video").unwrap_err();
        assert_eq!(err.kind, DownloadFailureKind::Unavailable);
        assert_eq!(err.detail, "ERROR: [youtube] abc: Private video");

        let err =
            classify_ytdlp_output(false, "", "ERROR: unable to write: No space left on device")
                .unwrap_err();
        assert_eq!(err.kind, DownloadFailureKind::IoError);

        let err = classify_ytdlp_output(false, "", "").unwrap_err();
        assert_eq!(err.kind, DownloadFailureKind::Unknown);
    }

    #[cfg(unix)]
    fn install_ytdlp_stub(dir: &Path, body: &str) -> Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let script_path = dir.join("yt-dlp");
        let script = format!(
            r#"#!/usr/bin/env bash
set -euo pipefail
prev=""
output=""
for arg in "$@"; do
    if [[ "$prev" == "--output" ]]; then
        output="$arg"
    fi
    prev="$arg"
done
echo "$@" > "{args}"
{body}
"#,
            args = dir.join("args.txt").display()
        );
        fs::write(&script_path, script)?;
        let mut perms = fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms)?;
        Ok(script_path)
    }

    #[cfg(unix)]
    #[test]
    fn ytdlp_source_reports_printed_path() -> Result<()> {
        let bin = tempdir()?;
        let dest = tempdir()?;
        let stub = install_ytdlp_stub(
            bin.path(),
            r#"path=$(printf '%s' "$output" | sed 's/%(ext)s/mp4/')
printf 'video' > "$path"
echo "$path""#,
        )?;
        let config = HarvestConfig {
            ytdlp_path: stub,
            user_agent: Some("agent/1.0".into()),
            ..HarvestConfig::default()
        };
        let source = YtDlpContentSource::from_config(&config);
        let request = FetchRequest {
            video_id: "dQw4w9WgXcQ",
            url: shorts_url("dQw4w9WgXcQ"),
            destination: dest.path(),
            stem: "Clip [dQw4w9WgXcQ]".into(),
            extension: "mp4",
        };

        let payload = source.fetch(&request).map_err(anyhow::Error::msg)?;
        let expected = dest.path().join("Clip [dQw4w9WgXcQ].mp4");
        assert_eq!(payload, FetchedPayload::Saved(expected.clone()));
        assert!(expected.exists());

        let args = fs::read_to_string(bin.path().join("args.txt"))?;
        assert!(args.contains("--limit-rate 2M"));
        assert!(args.contains("--sleep-requests 1"));
        assert!(args.contains("--user-agent agent/1.0"));
        assert!(args.contains("--referer https://www.youtube.com/"));
        assert!(args.contains(ARCHIVE_FILE));
        assert!(args.trim_end().ends_with("https://www.youtube.com/shorts/dQw4w9WgXcQ"));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn ytdlp_source_classifies_failure_exit() -> Result<()> {
        let bin = tempdir()?;
        let dest = tempdir()?;
        let stub = install_ytdlp_stub(
            bin.path(),
            r#"echo "ERROR: [youtube] dQw4w9WgXcQ: Video unavailable" >&2
exit 1"#,
        )?;
        let config = HarvestConfig {
            ytdlp_path: stub,
            ..HarvestConfig::default()
        };
        let source = YtDlpContentSource::from_config(&config);
        let request = FetchRequest {
            video_id: "dQw4w9WgXcQ",
            url: shorts_url("dQw4w9WgXcQ"),
            destination: dest.path(),
            stem: "dQw4w9WgXcQ".into(),
            extension: "mp4",
        };

        let failure = source.fetch(&request).unwrap_err();
        assert_eq!(failure.kind, DownloadFailureKind::Unavailable);
        Ok(())
    }
}
