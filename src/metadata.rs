//! Video records and the per-channel metadata snapshot.
//!
//! A [`VideoRecord`] is created by the fetcher from one listing entry, gains
//! a `viral_score` in the scorer, and ends its life serialized into
//! `viral_shorts_metadata.json` inside the channel's output directory. The
//! snapshot is only for auditing; later runs never read it back.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_FILE: &str = "viral_shorts_metadata.json";

/// Longest duration (exclusive) that still counts as a short.
pub const SHORT_MAX_SECONDS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: String,
    pub title: String,
    #[serde(default)]
    pub view_count: u64,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub comment_count: u64,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub duration_seconds: u64,
    /// False when the listing came from an extraction mode that carries no
    /// engagement statistics; the counts above are then defaults.
    #[serde(default = "default_true")]
    pub has_statistics: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viral_score: Option<f64>,
}

fn default_true() -> bool {
    true
}

impl VideoRecord {
    pub fn is_short(&self) -> bool {
        self.duration_seconds < SHORT_MAX_SECONDS
    }
}

pub fn shorts_url(video_id: &str) -> String {
    format!("https://www.youtube.com/shorts/{video_id}")
}

/// Writes the scored records as a pretty JSON array and returns the path.
pub fn write_snapshot(dir: &Path, records: &[VideoRecord]) -> Result<PathBuf> {
    let path = dir.join(SNAPSHOT_FILE);
    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, records)
        .with_context(|| format!("serializing {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
pub(crate) fn read_snapshot(path: &Path) -> Result<Vec<VideoRecord>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))
}

/// Converts yt-dlp's `YYYYMMDD` upload date into midnight UTC.
pub fn upload_date_to_datetime(value: &str) -> Option<DateTime<Utc>> {
    if value.len() != 8 {
        return None;
    }
    let year = value.get(0..4)?.parse().ok()?;
    let month = value.get(4..6)?.parse().ok()?;
    let day = value.get(6..8)?.parse().ok()?;
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?;
    Some(naive.and_utc())
}

/// Converts epoch seconds into a UTC timestamp.
pub fn timestamp_to_datetime(timestamp: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
}
