//! Channel reference normalization.
//!
//! Users paste channel references in many shapes (full URLs with or without
//! scheme, `@handles`, raw `UC…` ids). Everything is reduced to a
//! [`ChannelRef`] so the rest of the pipeline only deals with one canonical
//! short-video feed address per channel.

use std::fmt;

use url::Url;

use crate::error::ChannelError;

const YOUTUBE_HOSTS: &[&str] = &["youtube.com", "www.youtube.com", "m.youtube.com"];
const CHANNEL_ID_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelRef {
    /// `@handle`, stored without the leading `@`.
    Handle(String),
    /// `UC…` channel id.
    Id(String),
    /// Legacy `/c/<name>` custom URL.
    Custom(String),
    /// Legacy `/user/<name>` URL.
    User(String),
}

impl ChannelRef {
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let trimmed = raw.trim();
        let invalid = || ChannelError::InvalidChannelReference(trimmed.to_owned());

        if let Some(handle) = trimmed.strip_prefix('@') {
            return valid_name(handle)
                .then(|| ChannelRef::Handle(handle.to_owned()))
                .ok_or_else(invalid);
        }
        if is_channel_id(trimmed) {
            return Ok(ChannelRef::Id(trimmed.to_owned()));
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_owned()
        } else {
            format!("https://{trimmed}")
        };
        let url = Url::parse(&with_scheme).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid());
        }
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        if !YOUTUBE_HOSTS.contains(&host.as_str()) {
            return Err(invalid());
        }

        let mut segments = url
            .path_segments()
            .into_iter()
            .flatten()
            .filter(|segment| !segment.is_empty());
        let parsed = match (segments.next(), segments.next()) {
            (Some(first), _) if first.starts_with('@') => {
                let handle = &first[1..];
                valid_name(handle).then(|| ChannelRef::Handle(handle.to_owned()))
            }
            (Some("channel"), Some(id)) if is_channel_id(id) => Some(ChannelRef::Id(id.to_owned())),
            (Some("c"), Some(name)) if valid_name(name) => Some(ChannelRef::Custom(name.to_owned())),
            (Some("user"), Some(name)) if valid_name(name) => Some(ChannelRef::User(name.to_owned())),
            _ => None,
        };
        parsed.ok_or_else(invalid)
    }

    /// Canonical URL of the channel page (without a tab).
    pub fn channel_url(&self) -> String {
        match self {
            ChannelRef::Handle(handle) => format!("https://www.youtube.com/@{handle}"),
            ChannelRef::Id(id) => format!("https://www.youtube.com/channel/{id}"),
            ChannelRef::Custom(name) => format!("https://www.youtube.com/c/{name}"),
            ChannelRef::User(name) => format!("https://www.youtube.com/user/{name}"),
        }
    }

    /// Address of the channel's Shorts tab.
    pub fn feed_address(&self) -> String {
        format!("{}/shorts", self.channel_url())
    }

    /// Name of the per-channel output directory.
    pub fn folder_name(&self) -> &str {
        match self {
            ChannelRef::Handle(name)
            | ChannelRef::Id(name)
            | ChannelRef::Custom(name)
            | ChannelRef::User(name) => name,
        }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRef::Handle(handle) => write!(f, "@{handle}"),
            other => f.write_str(other.folder_name()),
        }
    }
}

fn is_channel_id(value: &str) -> bool {
    value.len() == CHANNEL_ID_LEN
        && value.starts_with("UC")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn valid_name(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 100
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && value != "."
        && value != ".."
}
