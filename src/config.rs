use anyhow::{Context, Result, bail};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "viralshorts.toml";
pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_OUTPUT_ROOT: &str = "videos";
pub const DEFAULT_CHANNELS_FILE: &str = "channels.txt";
pub const API_KEY_VAR: &str = "YOUTUBE_API_KEY";

/// Inclusive range of whole seconds to pause for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingRange {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl PacingRange {
    pub const fn new(min_secs: u64, max_secs: u64) -> Self {
        Self { min_secs, max_secs }
    }

    /// Uniformly picks a whole number of seconds within the range.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        Duration::from_secs(rng.random_range(self.min_secs..=self.max_secs))
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.min_secs > self.max_secs {
            bail!(
                "{name}: min_secs ({}) is greater than max_secs ({})",
                self.min_secs,
                self.max_secs
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataSourceKind {
    /// Data API when a key is configured, flat yt-dlp extraction otherwise.
    #[default]
    Auto,
    Api,
    YtDlp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankingStrategy {
    /// Viral score when every record carries statistics, engagement sort otherwise.
    #[default]
    Auto,
    ViralScore,
    EngagementSort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatPreference {
    #[default]
    Mp4,
    Webm,
}

impl FormatPreference {
    pub fn extension(&self) -> &'static str {
        match self {
            FormatPreference::Mp4 => "mp4",
            FormatPreference::Webm => "webm",
        }
    }

    /// yt-dlp format selector preferring a single file in the wanted container.
    pub fn selector(&self) -> &'static str {
        match self {
            FormatPreference::Mp4 => "best[ext=mp4]/bestvideo[ext=mp4]+bestaudio[ext=m4a]/best",
            FormatPreference::Webm => "best[ext=webm]/bestvideo[ext=webm]+bestaudio[ext=webm]/best",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    pub poll_secs: u64,
    /// Downloads per channel for scheduled runs; usually below the interactive limit.
    pub download_limit: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            poll_secs: 10,
            download_limit: 11,
        }
    }
}

/// Every tunable of the harvesting pipeline. Missing keys fall back to the
/// defaults below, so an empty file is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub max_videos_to_analyze: usize,
    pub max_videos_to_download: usize,
    pub per_download_pacing: PacingRange,
    pub per_batch_pacing: PacingRange,
    /// Number of download attempts between two batch pauses.
    pub batch_every: usize,
    pub inter_channel_cooldown: PacingRange,
    pub request_timeout_secs: u64,
    pub page_size: u32,
    pub max_pages: u32,
    pub page_interval_ms: u64,
    pub metadata_source: MetadataSourceKind,
    pub ranking: RankingStrategy,
    pub format_preference: FormatPreference,
    /// Passed to `yt-dlp --limit-rate`.
    pub rate_limit: String,
    /// Passed to `yt-dlp --sleep-requests`.
    pub sleep_requests_secs: u64,
    pub ytdlp_path: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub api_key: Option<String>,
    pub output_root: PathBuf,
    pub channels_file: PathBuf,
    pub schedule: ScheduleConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            max_videos_to_analyze: 100,
            max_videos_to_download: 31,
            per_download_pacing: PacingRange::new(2, 5),
            per_batch_pacing: PacingRange::new(15, 30),
            batch_every: 10,
            inter_channel_cooldown: PacingRange::new(60, 300),
            request_timeout_secs: 120,
            page_size: 50,
            max_pages: 10,
            page_interval_ms: 1000,
            metadata_source: MetadataSourceKind::Auto,
            ranking: RankingStrategy::Auto,
            format_preference: FormatPreference::Mp4,
            rate_limit: "2M".to_owned(),
            sleep_requests_secs: 1,
            ytdlp_path: PathBuf::from("yt-dlp"),
            cookies_file: None,
            user_agent: None,
            referer: Some("https://www.youtube.com/".to_owned()),
            api_key: None,
            output_root: PathBuf::from(DEFAULT_OUTPUT_ROOT),
            channels_file: PathBuf::from(DEFAULT_CHANNELS_FILE),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl HarvestConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn page_interval(&self) -> Duration {
        Duration::from_millis(self.page_interval_ms)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_secs)
    }

    pub fn schedule_poll(&self) -> Duration {
        Duration::from_secs(self.schedule.poll_secs)
    }

    /// Resolves `Auto` against the presence of an API key.
    pub fn effective_metadata_source(&self) -> MetadataSourceKind {
        match self.metadata_source {
            MetadataSourceKind::Auto if self.api_key.is_some() => MetadataSourceKind::Api,
            MetadataSourceKind::Auto => MetadataSourceKind::YtDlp,
            other => other,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.per_download_pacing.validate("per_download_pacing")?;
        self.per_batch_pacing.validate("per_batch_pacing")?;
        self.inter_channel_cooldown
            .validate("inter_channel_cooldown")?;
        if self.max_videos_to_analyze == 0 {
            bail!("max_videos_to_analyze must be at least 1");
        }
        if self.batch_every == 0 {
            bail!("batch_every must be at least 1");
        }
        if self.page_size == 0 || self.page_size > 50 {
            bail!("page_size must be between 1 and 50, got {}", self.page_size);
        }
        if self.max_pages == 0 {
            bail!("max_pages must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }
        if self.schedule.interval_secs == 0 || self.schedule.poll_secs == 0 {
            bail!("schedule interval_secs and poll_secs must be at least 1");
        }
        if self.metadata_source == MetadataSourceKind::Api && self.api_key.is_none() {
            bail!("metadata_source = \"api\" requires {API_KEY_VAR} or api_key to be set");
        }
        Ok(())
    }
}

/// Values read from a `KEY=value` env file.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub api_key: Option<String>,
    pub output_root: Option<PathBuf>,
    pub channels_file: Option<PathBuf>,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"').trim_matches('\'');
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                API_KEY_VAR => cfg.api_key = Some(value.to_string()),
                "OUTPUT_ROOT" => cfg.output_root = Some(PathBuf::from(value)),
                "CHANNELS_FILE" => cfg.channels_file = Some(PathBuf::from(value)),
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

/// Parses a TOML config file, returning `None` when it does not exist.
pub fn read_config(path: &Path) -> Result<Option<HarvestConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let cfg: HarvestConfig =
        toml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))?;
    Ok(Some(cfg))
}

/// Layers the TOML file, the env file and the process environment (highest
/// precedence for the API key) and validates the result.
pub fn load_config_from(
    config_path: impl AsRef<Path>,
    env_path: impl AsRef<Path>,
) -> Result<HarvestConfig> {
    let config_path = config_path.as_ref();
    let base = match read_config(config_path)? {
        Some(cfg) => cfg,
        None => {
            log::debug!(
                "no config file at {}, using defaults",
                config_path.display()
            );
            HarvestConfig::default()
        }
    };
    let env_cfg = read_env_config(env_path.as_ref())?;
    let process_key = env::var(API_KEY_VAR).ok().filter(|key| !key.is_empty());
    let cfg = apply_overrides(base, env_cfg, process_key);
    cfg.validate()
        .with_context(|| format!("Validating {}", config_path.display()))?;
    Ok(cfg)
}

fn apply_overrides(
    mut cfg: HarvestConfig,
    env_cfg: Option<EnvConfig>,
    process_key: Option<String>,
) -> HarvestConfig {
    if let Some(env_cfg) = env_cfg {
        if env_cfg.api_key.is_some() {
            cfg.api_key = env_cfg.api_key;
        }
        if let Some(root) = env_cfg.output_root {
            cfg.output_root = root;
        }
        if let Some(file) = env_cfg.channels_file {
            cfg.channels_file = file;
        }
    }
    if process_key.is_some() {
        cfg.api_key = process_key;
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn read_env_config_extracts_api_key() {
        let env = make_file("# creds\nexport YOUTUBE_API_KEY=\"abc123\"\nOUTPUT_ROOT='/data'\n");
        let parsed = read_env_config(env.path()).unwrap().unwrap();
        assert_eq!(parsed.api_key.as_deref(), Some("abc123"));
        assert_eq!(parsed.output_root, Some(PathBuf::from("/data")));
        assert!(parsed.channels_file.is_none());
    }

    #[test]
    fn read_env_config_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_env_config(&dir.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let file = make_file(
            "max_videos_to_download = 5\nformat_preference = \"webm\"\n\n[per_download_pacing]\nmin_secs = 0\nmax_secs = 1\n\n[schedule]\ndownload_limit = 3\n",
        );
        let cfg = read_config(file.path()).unwrap().unwrap();
        assert_eq!(cfg.max_videos_to_download, 5);
        assert_eq!(cfg.format_preference, FormatPreference::Webm);
        assert_eq!(cfg.per_download_pacing, PacingRange::new(0, 1));
        assert_eq!(cfg.per_batch_pacing, PacingRange::new(15, 30));
        assert_eq!(cfg.schedule.download_limit, 3);
        assert_eq!(cfg.schedule.interval_secs, 3600);
        assert_eq!(cfg.max_videos_to_analyze, 100);
    }

    #[test]
    fn metadata_source_parses_kebab_case() {
        let file = make_file("metadata_source = \"yt-dlp\"\nranking = \"engagement-sort\"\n");
        let cfg = read_config(file.path()).unwrap().unwrap();
        assert_eq!(cfg.metadata_source, MetadataSourceKind::YtDlp);
        assert_eq!(cfg.ranking, RankingStrategy::EngagementSort);
    }

    #[test]
    fn process_key_wins_over_env_file() {
        let env_cfg = EnvConfig {
            api_key: Some("from-file".into()),
            output_root: None,
            channels_file: Some(PathBuf::from("list.txt")),
        };
        let cfg = apply_overrides(
            HarvestConfig::default(),
            Some(env_cfg.clone()),
            Some("from-env".into()),
        );
        assert_eq!(cfg.api_key.as_deref(), Some("from-env"));
        assert_eq!(cfg.channels_file, PathBuf::from("list.txt"));

        let cfg = apply_overrides(HarvestConfig::default(), Some(env_cfg), None);
        assert_eq!(cfg.api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn auto_source_depends_on_key() {
        let mut cfg = HarvestConfig::default();
        assert_eq!(cfg.effective_metadata_source(), MetadataSourceKind::YtDlp);
        cfg.api_key = Some("k".into());
        assert_eq!(cfg.effective_metadata_source(), MetadataSourceKind::Api);
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let cfg = HarvestConfig {
            inter_channel_cooldown: PacingRange::new(10, 5),
            ..HarvestConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("inter_channel_cooldown"));
    }

    #[test]
    fn validate_requires_key_for_api_source() {
        let cfg = HarvestConfig {
            metadata_source: MetadataSourceKind::Api,
            ..HarvestConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pacing_sample_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let range = PacingRange::new(2, 5);
        for _ in 0..200 {
            let secs = range.sample(&mut rng).as_secs();
            assert!((2..=5).contains(&secs));
        }
        assert_eq!(
            PacingRange::new(0, 0).sample(&mut rng),
            Duration::from_secs(0)
        );
    }
}
