//! Viral scoring and ranking. Pure functions over already-fetched records.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::config::RankingStrategy;
use crate::metadata::VideoRecord;

const VELOCITY_WEIGHT: f64 = 0.6;
const LIKE_WEIGHT: f64 = 0.2;
const COMMENT_WEIGHT: f64 = 0.2;
/// Brings per-view ratios to the same order of magnitude as views per day.
const RATIO_SCALE: f64 = 10_000.0;

/// Candidates ordered best-first. Never mutated after ranking; consumers
/// only take a prefix.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RankedVideos {
    videos: Vec<VideoRecord>,
}

impl RankedVideos {
    pub fn as_slice(&self) -> &[VideoRecord] {
        &self.videos
    }

    /// The first `limit` candidates (or all of them).
    pub fn top(&self, limit: usize) -> &[VideoRecord] {
        &self.videos[..limit.min(self.videos.len())]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, VideoRecord> {
        self.videos.iter()
    }
}

/// Whole days since upload, floored, never below 1.
pub fn days_since_upload(published_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - published_at).num_days().max(1)
}

pub fn viral_score(record: &VideoRecord, now: DateTime<Utc>) -> f64 {
    let days = days_since_upload(record.published_at, now) as f64;
    let views = record.view_count as f64;
    let per_view = views.max(1.0);

    let views_per_day = views / days;
    let likes_to_views = record.like_count as f64 / per_view;
    let comments_to_views = record.comment_count as f64 / per_view;

    VELOCITY_WEIGHT * views_per_day
        + LIKE_WEIGHT * RATIO_SCALE * likes_to_views
        + COMMENT_WEIGHT * RATIO_SCALE * comments_to_views
}

pub fn score_and_rank(records: Vec<VideoRecord>) -> RankedVideos {
    score_and_rank_at(records, Utc::now())
}

/// Scores every record against `now` and sorts by descending score. The sort
/// is stable, so equal scores keep fetch order.
pub fn score_and_rank_at(records: Vec<VideoRecord>, now: DateTime<Utc>) -> RankedVideos {
    rank_with(records, now, RankingStrategy::ViralScore)
}

/// Like [`score_and_rank_at`] with an explicit ordering strategy. Scores are
/// always filled in; only the ordering changes.
///
/// `EngagementSort` orders by comments, then views, then newest upload. It
/// is what `Auto` falls back to when any record lacks statistics, because a
/// formula fed with defaulted zeros would rank on views per day alone.
pub fn rank_with(
    mut records: Vec<VideoRecord>,
    now: DateTime<Utc>,
    strategy: RankingStrategy,
) -> RankedVideos {
    for record in &mut records {
        record.viral_score = Some(viral_score(record, now));
    }

    let strategy = match strategy {
        RankingStrategy::Auto if records.iter().all(|r| r.has_statistics) => {
            RankingStrategy::ViralScore
        }
        RankingStrategy::Auto => {
            log::info!("statistics missing, ranking by engagement sort");
            RankingStrategy::EngagementSort
        }
        other => other,
    };

    match strategy {
        RankingStrategy::EngagementSort => records.sort_by(|a, b| {
            b.comment_count
                .cmp(&a.comment_count)
                .then_with(|| b.view_count.cmp(&a.view_count))
                .then_with(|| b.published_at.cmp(&a.published_at))
        }),
        _ => records.sort_by(|a, b| {
            let a = a.viral_score.unwrap_or(0.0);
            let b = b.viral_score.unwrap_or(0.0);
            b.partial_cmp(&a).unwrap_or(Ordering::Equal)
        }),
    }

    RankedVideos { videos: records }
}
