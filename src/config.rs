use anyhow::{anyhow, Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::ai::ProviderKind;
use crate::retry::RetryPolicy;

const DEFAULT_JOB_BOARDS: &[&str] = &[
    "linkedin.com",
    "indeed.com",
    "glassdoor.com",
    "ziprecruiter.com",
    "monster.com",
    "wellfound.com",
    "greenhouse.io",
    "lever.co",
    "ashbyhq.com",
    "smartrecruiters.com",
    "myworkdayjobs.com",
];

const DEFAULT_DISALLOWED_LOCALES: &[&str] = &["cn", "jp", "kr", "ru", "br", "fr", "de", "es", "it", "nl"];

/// Settings for one pipeline instance. Built once and shared read-only.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_preferences: usize,
    pub results_per_query: u32,
    pub search_region: String,
    /// Search calls allowed per `search_window`.
    pub search_max_ops: usize,
    pub search_window: Duration,
    pub job_board_domains: Vec<String>,
    pub disallowed_locales: Vec<String>,
    pub loose_fallback_cap: usize,
    /// Snippets longer than this (in chars) are used without fetching the page.
    pub snippet_threshold: usize,
    pub fetch_timeout: Duration,
    pub max_content_chars: usize,
    pub provider: ProviderKind,
    pub models: Vec<String>,
    pub retry: RetryPolicy,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub stale_after_days: i64,
    /// Postings scoring below this are not stored. `None` keeps everything.
    pub min_match_score: Option<u8>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let provider = ProviderKind::Anthropic;
        Self {
            max_preferences: 5,
            results_per_query: 10,
            search_region: "us".to_string(),
            search_max_ops: 5,
            search_window: Duration::from_secs(60),
            job_board_domains: DEFAULT_JOB_BOARDS.iter().map(|s| s.to_string()).collect(),
            disallowed_locales: DEFAULT_DISALLOWED_LOCALES.iter().map(|s| s.to_string()).collect(),
            loose_fallback_cap: 3,
            snippet_threshold: 200,
            fetch_timeout: Duration::from_secs(10),
            max_content_chars: 12_000,
            provider,
            models: provider.default_models(),
            retry: RetryPolicy::default(),
            batch_size: 5,
            batch_delay: Duration::from_secs(10),
            stale_after_days: 30,
            min_match_score: Some(60),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Applies `SCOUT_*` overrides from `lookup` on top of the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("SCOUT_MAX_PREFERENCES") {
            config.max_preferences = parse("SCOUT_MAX_PREFERENCES", &v)?;
        }
        if let Some(v) = get("SCOUT_RESULTS_PER_QUERY") {
            config.results_per_query = parse("SCOUT_RESULTS_PER_QUERY", &v)?;
        }
        if let Some(v) = get("SCOUT_SEARCH_REGION") {
            config.search_region = v;
        }
        if let Some(v) = get("SCOUT_SEARCH_MAX_OPS") {
            config.search_max_ops = parse("SCOUT_SEARCH_MAX_OPS", &v)?;
        }
        if let Some(v) = get("SCOUT_SEARCH_WINDOW_SECS") {
            config.search_window = Duration::from_secs(parse("SCOUT_SEARCH_WINDOW_SECS", &v)?);
        }
        if let Some(v) = get("SCOUT_JOB_BOARDS") {
            config.job_board_domains = split_list(&v);
        }
        if let Some(v) = get("SCOUT_DISALLOWED_LOCALES") {
            config.disallowed_locales = split_list(&v);
        }
        if let Some(v) = get("SCOUT_SNIPPET_THRESHOLD") {
            config.snippet_threshold = parse("SCOUT_SNIPPET_THRESHOLD", &v)?;
        }
        if let Some(v) = get("SCOUT_FETCH_TIMEOUT_SECS") {
            config.fetch_timeout = Duration::from_secs(parse("SCOUT_FETCH_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("SCOUT_PROVIDER") {
            config.provider = match v.to_lowercase().as_str() {
                "anthropic" => ProviderKind::Anthropic,
                "openai" => ProviderKind::OpenAI,
                other => return Err(anyhow!("SCOUT_PROVIDER must be 'anthropic' or 'openai', got '{}'", other)),
            };
            config.models = config.provider.default_models();
        }
        if let Some(v) = get("SCOUT_MODELS") {
            config.models = split_list(&v);
        }
        if let Some(v) = get("SCOUT_MAX_RETRIES") {
            config.retry.max_retries = parse("SCOUT_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("SCOUT_RETRY_BASE_MS") {
            config.retry.base_delay = Duration::from_millis(parse("SCOUT_RETRY_BASE_MS", &v)?);
        }
        if let Some(v) = get("SCOUT_RETRY_MAX_MS") {
            config.retry.max_delay = Duration::from_millis(parse("SCOUT_RETRY_MAX_MS", &v)?);
        }
        if let Some(v) = get("SCOUT_BATCH_SIZE") {
            config.batch_size = parse("SCOUT_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("SCOUT_BATCH_DELAY_SECS") {
            config.batch_delay = Duration::from_secs(parse("SCOUT_BATCH_DELAY_SECS", &v)?);
        }
        if let Some(v) = get("SCOUT_STALE_AFTER_DAYS") {
            config.stale_after_days = parse("SCOUT_STALE_AFTER_DAYS", &v)?;
        }
        if let Some(v) = get("SCOUT_MIN_MATCH_SCORE") {
            config.min_match_score = match v.to_lowercase().as_str() {
                "off" | "none" => None,
                _ => Some(parse::<u8>("SCOUT_MIN_MATCH_SCORE", &v)?.min(100)),
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow!("batch size must be at least 1"));
        }
        if self.search_max_ops == 0 {
            return Err(anyhow!("search throttle must allow at least one call per window"));
        }
        if self.models.is_empty() {
            return Err(anyhow!("at least one model must be configured"));
        }
        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("invalid value for {}: '{}'", key, value))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
