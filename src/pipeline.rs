//! One discovery run for one user: search, classify, retrieve, extract,
//! score and store.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use futures::future::join_all;
use regex::Regex;
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, info, warn};

use crate::ai::TextModel;
use crate::classify::{dedupe_by_url, UrlClassifier};
use crate::config::PipelineConfig;
use crate::db::{Database, InsertOutcome};
use crate::dispatch::QueryDispatcher;
use crate::extract::{ExtractError, ExtractedJob, Extractor};
use crate::fetch::{ContentRetriever, PageFetcher};
use crate::models::{NewJobPosting, SearchCandidate, UserProfile};
use crate::profile::ProfileSource;
use crate::score::MatchScorer;
use crate::search::SearchProvider;
use crate::stage::Stage;

static RELATIVE_AGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\+?\s*(minute|hour|day|week|month|year)s?\s+ago")
        .expect("relative age pattern is hardcoded and valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// The user changed preferences or skills.
    ProfileUpdated,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub user_id: String,
    pub reason: TriggerReason,
}

impl Trigger {
    pub fn new(user_id: impl Into<String>, reason: TriggerReason) -> Self {
        Self {
            user_id: user_id.into(),
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunStatus {
    #[default]
    Completed,
    NoProfile,
    NoPreferences,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub user_id: String,
    pub status: RunStatus,
    pub preferences_searched: usize,
    /// Search hits across all preferences, before classification.
    pub candidates_found: usize,
    /// Classified, deduplicated candidates that went through enrichment.
    pub processed: usize,
    pub saved: usize,
    pub skipped_duplicate: usize,
    pub skipped_stale: usize,
    pub skipped_low_score: usize,
    pub parse_failures: usize,
    pub failed: usize,
}

impl RunReport {
    fn new(user_id: &str, status: RunStatus) -> Self {
        Self {
            user_id: user_id.to_string(),
            status,
            ..Self::default()
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped_duplicate + self.skipped_stale + self.skipped_low_score
    }

    fn record(&mut self, outcome: &CandidateOutcome) {
        match outcome {
            CandidateOutcome::Saved(_) => self.saved += 1,
            CandidateOutcome::Duplicate => self.skipped_duplicate += 1,
            CandidateOutcome::Stale => self.skipped_stale += 1,
            CandidateOutcome::LowScore(_) => self.skipped_low_score += 1,
            CandidateOutcome::ParseFailure => self.parse_failures += 1,
            CandidateOutcome::Failed => self.failed += 1,
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            RunStatus::NoProfile => return write!(f, "{}: no profile found", self.user_id),
            RunStatus::NoPreferences => return write!(f, "{}: no job preferences set", self.user_id),
            RunStatus::Completed => {}
        }
        write!(
            f,
            "{}: {} preference(s), {} hit(s), {} processed, {} saved, {} skipped ({} duplicate, {} stale, {} low score), {} parse failure(s), {} failed",
            self.user_id,
            self.preferences_searched,
            self.candidates_found,
            self.processed,
            self.saved,
            self.skipped(),
            self.skipped_duplicate,
            self.skipped_stale,
            self.skipped_low_score,
            self.parse_failures,
            self.failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    Saved(i64),
    Duplicate,
    Stale,
    LowScore(u8),
    ParseFailure,
    Failed,
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    db: Arc<Database>,
    profiles: Arc<dyn ProfileSource>,
    dispatcher: QueryDispatcher,
    classifier: UrlClassifier,
    retriever: ContentRetriever,
    extractor: Extractor,
    scorer: MatchScorer,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        db: Arc<Database>,
        profiles: Arc<dyn ProfileSource>,
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn PageFetcher>,
        model: Arc<dyn TextModel>,
    ) -> Self {
        Self {
            dispatcher: QueryDispatcher::new(search, config.clone()),
            classifier: UrlClassifier::new(&config),
            retriever: ContentRetriever::new(fetcher, &config),
            extractor: Extractor::new(model.clone(), &config),
            scorer: MatchScorer::new(model, &config),
            config,
            db,
            profiles,
        }
    }

    pub async fn run(&self, trigger: &Trigger) -> Result<RunReport> {
        let user_id = trigger.user_id.as_str();
        info!(user_id, reason = ?trigger.reason, "Discovery run started");

        let Some(profile) = self.profiles.load(user_id)? else {
            info!(user_id, "No profile, nothing to do");
            return Ok(RunReport::new(user_id, RunStatus::NoProfile));
        };

        let preferences = profile.active_preferences(self.config.max_preferences);
        if preferences.is_empty() {
            info!(user_id, "No preferences, nothing to do");
            return Ok(RunReport::new(user_id, RunStatus::NoPreferences));
        }

        let mut report = RunReport::new(user_id, RunStatus::Completed);
        report.preferences_searched = preferences.len();

        let results = self.dispatcher.dispatch(&preferences, profile.city()).await;
        report.candidates_found = results.iter().map(|r| r.candidates.len()).sum();

        let classified = results.into_iter().flat_map(|r| {
            let kept = self.classifier.classify(r.candidates);
            debug!(user_id, preference = %r.preference, kept = kept.len(), "Preference classified");
            kept
        });
        let candidates = dedupe_by_url(classified);
        report.processed = candidates.len();
        debug!(user_id, found = report.candidates_found, kept = candidates.len(), "Candidates classified");

        for (index, batch) in candidates.chunks(self.config.batch_size.max(1)).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }
            let outcomes = join_all(batch.iter().map(|c| self.process(&profile, c))).await;
            for outcome in &outcomes {
                report.record(outcome);
            }
        }

        info!(
            user_id,
            processed = report.processed,
            saved = report.saved,
            skipped = report.skipped(),
            parse_failures = report.parse_failures,
            failed = report.failed,
            "Discovery run finished"
        );
        Ok(report)
    }

    async fn process(&self, profile: &UserProfile, candidate: &SearchCandidate) -> CandidateOutcome {
        let url = candidate.url.as_str();
        let content = self.retriever.retrieve(candidate).await.into_inner();

        let job = match self.extractor.extract(candidate, &content).await {
            Ok(outcome) => outcome.into_inner(),
            Err(ExtractError::Parse(message)) => {
                warn!(url, error = %message, "Extraction output unparseable, skipping");
                return CandidateOutcome::ParseFailure;
            }
            Err(e) => {
                error!(url, error = %e, "Extraction failed");
                return CandidateOutcome::Failed;
            }
        };

        if is_stale(job.posted_at.as_deref(), Utc::now(), self.config.stale_after_days) {
            debug!(url, posted_at = ?job.posted_at, "Posting is stale, skipping");
            return CandidateOutcome::Stale;
        }

        let mut posting = new_posting(&profile.id, url, &job);
        match self.db.find_by_key(&posting.key()) {
            Ok(Some(_)) => {
                debug!(url, "Already stored, skipping");
                return CandidateOutcome::Duplicate;
            }
            Ok(None) => {}
            Err(e) => {
                error!(url, error = %e, "Duplicate check failed");
                return CandidateOutcome::Failed;
            }
        }

        let scored = self.scorer.score(profile, &job).await;
        if scored.is_degraded() {
            debug!(url, score = scored.get().score, "Scored with keyword heuristic");
        }
        let score = scored.into_inner();
        if let Some(floor) = self.config.min_match_score {
            if score.score < floor {
                debug!(url, score = score.score, floor, "Below score floor, skipping");
                return CandidateOutcome::LowScore(score.score);
            }
        }

        posting.match_score = score.score;
        posting.ai_summary = score.reasoning;

        match self.db.insert_posting(&posting) {
            Ok(InsertOutcome::Inserted(id)) => {
                info!(url, posting_id = id, score = posting.match_score, title = %posting.title, company = %posting.company, "Saved posting");
                CandidateOutcome::Saved(id)
            }
            Ok(InsertOutcome::Duplicate) => CandidateOutcome::Duplicate,
            Err(e) => {
                error!(url, error = %e, "Failed to store posting");
                CandidateOutcome::Failed
            }
        }
    }
}

fn new_posting(user_id: &str, source_url: &str, job: &ExtractedJob) -> NewJobPosting {
    NewJobPosting {
        user_id: user_id.to_string(),
        title: job.title.clone(),
        company: job.company.clone(),
        location: job.location.clone(),
        employment_type: job.employment_type.clone(),
        remote_type: job.remote_type.clone(),
        salary_min: job.salary_min,
        salary_max: job.salary_max,
        currency: job.currency.clone(),
        description: job.description.clone(),
        ai_summary: String::new(),
        skills: job.skills.clone(),
        responsibilities: job.responsibilities.clone(),
        qualifications: job.qualifications.clone(),
        source_url: source_url.to_string(),
        posted_at: job.posted_at.clone(),
        match_score: 0,
        stage: Stage::Default,
    }
}

/// Parses RFC 3339, `YYYY-MM-DD`, "today", "yesterday" and "N days ago" forms.
pub fn parse_posted_at(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }

    let lower = raw.to_lowercase();
    if lower.contains("just now") || lower == "today" || lower.starts_with("posted today") {
        return Some(now);
    }
    if lower.contains("yesterday") {
        return now.checked_sub_signed(ChronoDuration::try_days(1)?);
    }

    let caps = RELATIVE_AGE_RE.captures(&lower)?;
    let count: i64 = caps.get(1)?.as_str().parse().ok()?;
    let age = match caps.get(2)?.as_str() {
        "minute" => ChronoDuration::try_minutes(count),
        "hour" => ChronoDuration::try_hours(count),
        "day" => ChronoDuration::try_days(count),
        "week" => ChronoDuration::try_weeks(count),
        "month" => ChronoDuration::try_days(count.checked_mul(30)?),
        "year" => ChronoDuration::try_days(count.checked_mul(365)?),
        _ => None,
    }?;
    now.checked_sub_signed(age)
}

/// Unknown or unparseable dates are never stale.
pub fn is_stale(posted_at: Option<&str>, now: DateTime<Utc>, max_age_days: i64) -> bool {
    posted_at
        .and_then(|raw| parse_posted_at(raw, now))
        .is_some_and(|posted| (now - posted).num_days() > max_age_days)
}
