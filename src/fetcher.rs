//! Metadata fetching: turns a channel reference into normalized short-video
//! records.
//!
//! Two listing backends implement [`MetadataSource`]:
//!
//! * [`YouTubeApiSource`] pages the YouTube Data API v3 and returns full
//!   statistics. This is the canonical source.
//! * [`YtDlpFeedSource`] runs a flat `yt-dlp` extraction of the Shorts tab.
//!   It needs no API key but usually lacks like/comment counts.
//!
//! [`MetadataFetcher`] owns the pagination policy (page size, page ceiling,
//! early stop at `max_videos`), the short-duration filter and progress
//! reporting, so sources only need to translate one page at a time.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::channel::ChannelRef;
use crate::config::HarvestConfig;
use crate::error::ChannelError;
use crate::metadata::{VideoRecord, timestamp_to_datetime, upload_date_to_datetime};
use crate::pacing::{Pacer, PauseKind};
use crate::process::{ProcessError, run_with_timeout};
use crate::progress::{ProgressSink, Reporter, percent_of};

pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

/// Duration as delivered by a source, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawDuration {
    /// ISO-8601 notation such as `PT45S` (Data API).
    Iso8601(String),
    /// Plain seconds (yt-dlp).
    Seconds(f64),
}

/// One listing entry exactly as the source reported it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawListing {
    pub video_id: String,
    pub title: Option<String>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub comment_count: Option<u64>,
    pub published_at: Option<DateTime<Utc>>,
    pub duration: Option<RawDuration>,
    pub has_statistics: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub entries: Vec<RawListing>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub page_token: Option<String>,
    pub page_size: u32,
    /// How many more eligible records the fetcher still wants.
    pub remaining: usize,
}

pub trait MetadataSource: Send + Sync {
    fn list_page(
        &self,
        channel: &ChannelRef,
        request: &PageRequest,
    ) -> Result<ListingPage, ChannelError>;
}

pub struct MetadataFetcher {
    source: Box<dyn MetadataSource>,
    page_size: u32,
    max_pages: u32,
    page_interval: Duration,
}

impl MetadataFetcher {
    pub fn new(source: Box<dyn MetadataSource>, config: &HarvestConfig) -> Self {
        Self {
            source,
            page_size: config.page_size,
            max_pages: config.max_pages,
            page_interval: config.page_interval(),
        }
    }

    /// Normalizes `channel_identifier` and fetches up to `max_videos` shorts.
    pub fn fetch(
        &self,
        channel_identifier: &str,
        max_videos: usize,
        sink: &dyn ProgressSink,
        pacer: &dyn Pacer,
    ) -> Result<Vec<VideoRecord>, ChannelError> {
        let channel = ChannelRef::parse(channel_identifier)?;
        self.fetch_channel(&channel, max_videos, sink, pacer)
    }

    pub fn fetch_channel(
        &self,
        channel: &ChannelRef,
        max_videos: usize,
        sink: &dyn ProgressSink,
        pacer: &dyn Pacer,
    ) -> Result<Vec<VideoRecord>, ChannelError> {
        let reporter = Reporter::new(sink);
        if max_videos == 0 {
            return Ok(Vec::new());
        }

        reporter.message(&format!("Retrieving shorts from {}", channel.feed_address()));
        let fetched_at = Utc::now();
        let mut records: Vec<VideoRecord> = Vec::new();
        let mut seen = HashSet::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0;

        loop {
            if pages > 0 {
                pacer.pause(PauseKind::Page, self.page_interval);
            }
            let request = PageRequest {
                page_token: page_token.take(),
                page_size: self.page_size,
                remaining: max_videos - records.len(),
            };
            let page = self.source.list_page(channel, &request)?;
            pages += 1;

            for raw in page.entries {
                let record = normalize_listing(raw, fetched_at);
                if !record.is_short() || !seen.insert(record.video_id.clone()) {
                    continue;
                }
                records.push(record);
                if records.len() >= max_videos {
                    break;
                }
            }

            reporter.message(&format!(
                "Found {} of {} shorts",
                records.len(),
                max_videos
            ));
            reporter.percent(percent_of(records.len(), max_videos));

            if records.len() >= max_videos {
                break;
            }
            match page.next_page_token {
                Some(token) if pages < self.max_pages => page_token = Some(token),
                Some(_) => {
                    log::info!(
                        "{}: stopping after {} pages (page ceiling)",
                        channel,
                        pages
                    );
                    break;
                }
                None => break,
            }
        }

        records.truncate(max_videos);
        log::info!(
            "{}: {} eligible shorts from {} page(s)",
            channel,
            records.len(),
            pages
        );
        Ok(records)
    }
}

/// Builds a [`VideoRecord`] from a raw entry, defaulting every missing field.
pub fn normalize_listing(raw: RawListing, fetched_at: DateTime<Utc>) -> VideoRecord {
    let duration_seconds = match &raw.duration {
        Some(RawDuration::Iso8601(text)) => parse_iso8601_duration(text).unwrap_or_else(|| {
            log::debug!("unparseable duration {text:?} for {}", raw.video_id);
            0
        }),
        Some(RawDuration::Seconds(secs)) if secs.is_finite() && *secs >= 0.0 => *secs as u64,
        _ => 0,
    };
    let title = raw
        .title
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| raw.video_id.clone());

    VideoRecord {
        title,
        view_count: raw.view_count.unwrap_or(0),
        like_count: raw.like_count.unwrap_or(0),
        comment_count: raw.comment_count.unwrap_or(0),
        published_at: raw.published_at.unwrap_or(fetched_at),
        duration_seconds,
        has_statistics: raw.has_statistics,
        viral_score: None,
        video_id: raw.video_id,
    }
}

/// Parses ISO-8601 durations (`PT1M5S`, `P1DT2H`, `P2W`). Fractional
/// seconds are truncated; year and month designators are rejected.
pub fn parse_iso8601_duration(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix('P')?;
    if rest.is_empty() {
        return None;
    }
    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) if !time.is_empty() => (date, Some(time)),
        Some(_) => return None,
        None => (rest, None),
    };

    let mut total = 0.0_f64;
    for (amount, unit) in duration_components(date_part)? {
        total += amount
            * match unit {
                'W' => 604_800.0,
                'D' => 86_400.0,
                _ => return None,
            };
    }
    if let Some(time_part) = time_part {
        for (amount, unit) in duration_components(time_part)? {
            total += amount
                * match unit {
                    'H' => 3_600.0,
                    'M' => 60.0,
                    'S' => 1.0,
                    _ => return None,
                };
        }
    }
    Some(total as u64)
}

fn duration_components(part: &str) -> Option<Vec<(f64, char)>> {
    let mut components = Vec::new();
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' || c == ',' {
            number.push(if c == ',' { '.' } else { c });
        } else {
            if number.is_empty() {
                return None;
            }
            components.push((number.parse().ok()?, c));
            number.clear();
        }
    }
    number.is_empty().then_some(components)
}

// ---------------------------------------------------------------------------
// YouTube Data API v3
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
    video_id: Option<String>,
    channel_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VideosResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    id: String,
    snippet: Option<VideoSnippet>,
    statistics: Option<VideoStatistics>,
    content_details: Option<ContentDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: Option<String>,
    published_at: Option<String>,
}

/// The API encodes counters as decimal strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    view_count: Option<String>,
    like_count: Option<String>,
    comment_count: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentDetails {
    duration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelsResponse {
    #[serde(default)]
    items: Vec<ChannelItem>,
}

#[derive(Debug, Deserialize)]
struct ChannelItem {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
    #[serde(default)]
    errors: Vec<ApiErrorReason>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorReason {
    reason: Option<String>,
}

pub struct YouTubeApiSource {
    agent: ureq::Agent,
    api_key: String,
    base_url: String,
    channel_ids: Mutex<HashMap<ChannelRef, String>>,
}

impl YouTubeApiSource {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(concat!("viralshorts-tools/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent,
            api_key: api_key.into(),
            base_url: YOUTUBE_API_BASE.to_owned(),
            channel_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ChannelError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut request = self.agent.get(&url);
        for (key, value) in params {
            request = request.query(key, value);
        }
        request = request.query("key", &self.api_key);

        match request.call() {
            Ok(response) => response.into_json::<T>().map_err(|err| {
                ChannelError::FetchFailure(format!("malformed {endpoint} response: {err}"))
            }),
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(ChannelError::FetchFailure(describe_api_error(code, &body)))
            }
            // The transport error's Display includes the URL and therefore
            // the key, so only the kind and message are surfaced.
            Err(ureq::Error::Transport(transport)) => Err(ChannelError::FetchFailure(format!(
                "{endpoint} request failed: {}{}",
                transport.kind(),
                transport
                    .message()
                    .map(|message| format!(" ({message})"))
                    .unwrap_or_default()
            ))),
        }
    }

    fn resolve_channel_id(&self, channel: &ChannelRef) -> Result<String, ChannelError> {
        if let ChannelRef::Id(id) = channel {
            return Ok(id.clone());
        }
        if let Some(id) = self.channel_ids.lock().get(channel) {
            return Ok(id.clone());
        }

        let resolved = match channel {
            ChannelRef::Handle(handle) => {
                let handle = format!("@{handle}");
                let response: ChannelsResponse =
                    self.get_json("channels", &[("part", "id"), ("forHandle", handle.as_str())])?;
                response.items.into_iter().next().map(|item| item.id)
            }
            ChannelRef::User(name) => {
                let response: ChannelsResponse =
                    self.get_json("channels", &[("part", "id"), ("forUsername", name.as_str())])?;
                response.items.into_iter().next().map(|item| item.id)
            }
            ChannelRef::Custom(name) => {
                let response: SearchResponse = self.get_json(
                    "search",
                    &[
                        ("part", "id"),
                        ("type", "channel"),
                        ("maxResults", "1"),
                        ("q", name.as_str()),
                    ],
                )?;
                response
                    .items
                    .into_iter()
                    .find_map(|item| item.id.channel_id)
            }
            ChannelRef::Id(id) => Some(id.clone()),
        };

        let id = resolved
            .ok_or_else(|| ChannelError::FetchFailure(format!("channel {channel} not found")))?;
        log::debug!("resolved {channel} to {id}");
        self.channel_ids.lock().insert(channel.clone(), id.clone());
        Ok(id)
    }
}

impl MetadataSource for YouTubeApiSource {
    fn list_page(
        &self,
        channel: &ChannelRef,
        request: &PageRequest,
    ) -> Result<ListingPage, ChannelError> {
        let channel_id = self.resolve_channel_id(channel)?;
        let page_size = request.page_size.to_string();
        let mut params = vec![
            ("part", "id"),
            ("channelId", channel_id.as_str()),
            ("type", "video"),
            ("order", "date"),
            ("videoDuration", "short"),
            ("maxResults", page_size.as_str()),
        ];
        if let Some(token) = request.page_token.as_deref() {
            params.push(("pageToken", token));
        }
        let search: SearchResponse = self.get_json("search", &params)?;
        let ids = search_video_ids(&search);

        let entries = if ids.is_empty() {
            Vec::new()
        } else {
            let joined = ids.join(",");
            let details: VideosResponse = self.get_json(
                "videos",
                &[
                    ("part", "snippet,statistics,contentDetails"),
                    ("id", joined.as_str()),
                ],
            )?;
            order_like(&ids, video_listings(details))
        };

        Ok(ListingPage {
            entries,
            next_page_token: search.next_page_token,
        })
    }
}

fn search_video_ids(search: &SearchResponse) -> Vec<String> {
    search
        .items
        .iter()
        .filter_map(|item| item.id.video_id.clone())
        .collect()
}

fn video_listings(response: VideosResponse) -> Vec<RawListing> {
    response
        .items
        .into_iter()
        .map(|item| {
            let (title, published_at) = item
                .snippet
                .map(|snippet| {
                    let published = snippet.published_at.as_deref().and_then(|raw| {
                        DateTime::parse_from_rfc3339(raw)
                            .ok()
                            .map(|date| date.with_timezone(&Utc))
                    });
                    (snippet.title, published)
                })
                .unwrap_or((None, None));
            let parse_count =
                |value: &Option<String>| value.as_deref().and_then(|raw| raw.parse::<u64>().ok());
            let (view_count, like_count, comment_count) = item
                .statistics
                .as_ref()
                .map(|stats| {
                    (
                        parse_count(&stats.view_count),
                        parse_count(&stats.like_count),
                        parse_count(&stats.comment_count),
                    )
                })
                .unwrap_or((None, None, None));

            RawListing {
                has_statistics: item.statistics.is_some(),
                video_id: item.id,
                title,
                view_count,
                like_count,
                comment_count,
                published_at,
                duration: item
                    .content_details
                    .and_then(|details| details.duration)
                    .map(RawDuration::Iso8601),
            }
        })
        .collect()
}

/// Reorders detail entries to match the search result order.
fn order_like(ids: &[String], mut listings: Vec<RawListing>) -> Vec<RawListing> {
    listings.sort_by_key(|listing| {
        ids.iter()
            .position(|id| *id == listing.video_id)
            .unwrap_or(usize::MAX)
    });
    listings
}

fn describe_api_error(code: u16, body: &str) -> String {
    let Ok(envelope) = serde_json::from_str::<ApiErrorEnvelope>(body) else {
        return format!("HTTP {code}");
    };
    let reason = envelope
        .error
        .errors
        .iter()
        .find_map(|entry| entry.reason.as_deref());
    match reason {
        Some("quotaExceeded" | "dailyLimitExceeded" | "rateLimitExceeded") => {
            format!("quota exceeded (HTTP {code})")
        }
        _ => format!(
            "HTTP {code}: {}",
            envelope
                .error
                .message
                .unwrap_or_else(|| "unknown error".to_owned())
        ),
    }
}

// ---------------------------------------------------------------------------
// yt-dlp flat extraction
// ---------------------------------------------------------------------------

/// Subset of `yt-dlp --flat-playlist --dump-single-json`.
#[derive(Debug, Deserialize)]
struct FlatPlaylist {
    #[serde(default)]
    entries: Vec<FlatEntry>,
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    title: Option<String>,
    view_count: Option<u64>,
    like_count: Option<u64>,
    comment_count: Option<u64>,
    duration: Option<f64>,
    timestamp: Option<i64>,
    upload_date: Option<String>,
}

pub struct YtDlpFeedSource {
    program: PathBuf,
    timeout: Duration,
    cookies_file: Option<PathBuf>,
}

impl YtDlpFeedSource {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            cookies_file: None,
        }
    }

    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            program: config.ytdlp_path.clone(),
            timeout: config.request_timeout(),
            cookies_file: config.cookies_file.clone(),
        }
    }
}

impl MetadataSource for YtDlpFeedSource {
    /// Flat extraction returns the whole listing at once, so there is never
    /// a continuation token.
    fn list_page(
        &self,
        channel: &ChannelRef,
        request: &PageRequest,
    ) -> Result<ListingPage, ChannelError> {
        let feed = channel.feed_address();
        let mut command = Command::new(&self.program);
        command
            .arg("--flat-playlist")
            .arg("--dump-single-json")
            .arg("--no-warnings")
            .arg("--extractor-args")
            .arg("youtubetab:approximate_date")
            .arg("--playlist-end")
            .arg(request.remaining.max(1).to_string());
        if let Some(cookies) = self.cookies_file.as_ref().filter(|path| path.exists()) {
            command.arg("--cookies").arg(cookies);
        }
        command.arg(&feed);

        let output = run_with_timeout(&mut command, self.timeout).map_err(|err| {
            ChannelError::FetchFailure(match &err {
                ProcessError::TimedOut(_) => format!("listing {feed} {err}"),
                _ => format!("yt-dlp: {err}"),
            })
        })?;
        if !output.status.success() {
            let cause = output
                .stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no error output")
                .trim()
                .to_owned();
            return Err(ChannelError::FetchFailure(format!(
                "yt-dlp exited with {} for {feed}: {cause}",
                output.status
            )));
        }

        let entries = parse_flat_playlist(&output.stdout)?;
        Ok(ListingPage {
            entries,
            next_page_token: None,
        })
    }
}

fn parse_flat_playlist(raw: &str) -> Result<Vec<RawListing>, ChannelError> {
    let playlist: FlatPlaylist = serde_json::from_str(raw)
        .map_err(|err| ChannelError::FetchFailure(format!("malformed yt-dlp listing: {err}")))?;
    Ok(playlist
        .entries
        .into_iter()
        .filter_map(|entry| {
            let video_id = entry.id.filter(|id| !id.is_empty())?;
            let published_at = entry.timestamp.and_then(timestamp_to_datetime).or_else(|| {
                entry
                    .upload_date
                    .as_deref()
                    .and_then(upload_date_to_datetime)
            });
            Some(RawListing {
                has_statistics: entry.view_count.is_some()
                    && entry.like_count.is_some()
                    && entry.comment_count.is_some(),
                video_id,
                title: entry.title,
                view_count: entry.view_count,
                like_count: entry.like_count,
                comment_count: entry.comment_count,
                published_at,
                duration: entry.duration.map(RawDuration::Seconds),
            })
        })
        .collect())
}
