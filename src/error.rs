//! Error taxonomy shared by the fetch, download, and coordination stages.
//!
//! Plumbing code (config parsing, filesystem helpers, child processes) keeps
//! using `anyhow`; the enums below are the typed outcomes that end up inside
//! a [`crate::coordinator::RunReport`].

use std::fmt;
use std::path::PathBuf;

/// Channel-level failure. Any of these skips the channel for the current run.
#[derive(Debug)]
pub enum ChannelError {
    /// The identifier could not be mapped to a channel feed address.
    InvalidChannelReference(String),
    /// Metadata retrieval failed (network, quota, malformed response, timeout).
    FetchFailure(String),
    /// The per-channel output directory could not be created.
    DirectoryFailure {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The batch was cancelled before this channel was started.
    Cancelled,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::InvalidChannelReference(raw) => {
                write!(f, "invalid channel reference: {raw}")
            }
            ChannelError::FetchFailure(cause) => write!(f, "metadata fetch failed: {cause}"),
            ChannelError::DirectoryFailure { path, source } => {
                write!(f, "could not create {}: {source}", path.display())
            }
            ChannelError::Cancelled => f.write_str("cancelled before start"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::DirectoryFailure { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Classification of a single failed download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadFailureKind {
    RateLimited,
    Unavailable,
    IoError,
    Unknown,
}

impl DownloadFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadFailureKind::RateLimited => "rate_limited",
            DownloadFailureKind::Unavailable => "unavailable",
            DownloadFailureKind::IoError => "io_error",
            DownloadFailureKind::Unknown => "unknown",
        }
    }
}

/// Failure reported by a [`crate::downloader::ContentSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFailure {
    pub kind: DownloadFailureKind,
    pub detail: String,
}

impl DownloadFailure {
    pub fn new(kind: DownloadFailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn rate_limited() -> Self {
        Self::new(DownloadFailureKind::RateLimited, "rate limited")
    }
}

impl fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.detail, self.kind.as_str())
    }
}

impl std::error::Error for DownloadFailure {}
