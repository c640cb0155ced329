//! Line-oriented channel watch-list: one reference per line.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// Reads the watch-list, skipping blank lines, `#` comments and duplicates
/// while keeping the original order. A missing file is an empty list.
pub fn load_channels(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut seen = HashSet::new();
    let mut channels = Vec::new();

    for line in reader.lines() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        let entry = line.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        if seen.insert(entry.to_owned()) {
            channels.push(entry.to_owned());
        }
    }

    Ok(channels)
}

/// Rewrites the watch-list in full. The file is written next to the target
/// and renamed over it so a crash never leaves a truncated list behind.
pub fn save_channels(path: &Path, channels: &[String]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut file =
            File::create(&tmp_path).with_context(|| format!("creating {}", tmp_path.display()))?;
        for channel in channels {
            writeln!(file, "{}", channel.trim())
                .with_context(|| format!("writing {}", tmp_path.display()))?;
        }
        file.sync_all()
            .with_context(|| format!("flushing {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replacing {} with {}", path.display(), tmp_path.display()))?;
    Ok(())
}

/// Appends `additions` to `channels`, ignoring entries already present.
/// Returns how many were added.
pub fn merge_channels(channels: &mut Vec<String>, additions: &[String]) -> usize {
    let mut added = 0;
    for addition in additions {
        let entry = addition.trim();
        if entry.is_empty() || channels.iter().any(|existing| existing == entry) {
            continue;
        }
        channels.push(entry.to_owned());
        added += 1;
    }
    added
}
