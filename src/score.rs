use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::ai::{GenerateRequest, LlmError, TextModel};
use crate::config::PipelineConfig;
use crate::extract::{find_json_object, ExtractedJob};
use crate::fallback::{degrade_on_error, Outcome};
use crate::models::UserProfile;
use crate::retry::{call_with_models, RetryPolicy};
use crate::text::contains_ignore_case;

const SCORE_MAX_TOKENS: u32 = 512;

const BASE_SCORE: i32 = 50;
const SKILL_WEIGHT: i32 = 5;
const PREFERENCE_WEIGHT: i32 = 10;
const CITY_WEIGHT: i32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchScore {
    pub score: u8,
    pub reasoning: String,
}

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("model call failed: {0}")]
    Model(#[from] LlmError),

    #[error("could not parse score: {0}")]
    Parse(String),
}

pub struct MatchScorer {
    model: Arc<dyn TextModel>,
    models: Vec<String>,
    retry: RetryPolicy,
}

impl MatchScorer {
    pub fn new(model: Arc<dyn TextModel>, config: &PipelineConfig) -> Self {
        Self {
            model,
            models: config.models.clone(),
            retry: config.retry.clone(),
        }
    }

    /// Model score when available, keyword heuristic otherwise.
    pub async fn score(&self, profile: &UserProfile, job: &ExtractedJob) -> Outcome<MatchScore> {
        degrade_on_error("score", self.score_with_model(profile, job), |_: &ScoreError| {
            heuristic_score(profile, job)
        })
        .await
    }

    async fn score_with_model(&self, profile: &UserProfile, job: &ExtractedJob) -> Result<MatchScore, ScoreError> {
        let prompt = score_prompt(profile, job);
        let prompt = prompt.as_str();
        let raw = call_with_models(&self.retry, &self.models, |model| async move {
            self.model
                .generate(GenerateRequest {
                    prompt,
                    model_id: &model,
                    max_tokens: SCORE_MAX_TOKENS,
                })
                .await
        })
        .await?;

        parse_score(&raw)
    }
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "(none listed)".to_string();
    }
    items.iter().map(|i| format!("- {}", i)).collect::<Vec<_>>().join("\n")
}

fn score_prompt(profile: &UserProfile, job: &ExtractedJob) -> String {
    let skills: Vec<String> = profile.skills.iter().cloned().collect();
    let education: Vec<String> = profile.education.iter().map(|e| e.summary()).collect();

    format!(
        r#"Rate how well this candidate fits the job on a scale of 0 to 100.
Respond with JSON only: {{"score": number, "reasoning": string}}

CANDIDATE
Skills: {skills}
Preferred roles: {preferences}
City: {city}
Education:
{education}

JOB
Title: {title} at {company} ({location})
Skills:
{job_skills}
Responsibilities:
{responsibilities}
Qualifications:
{qualifications}
Description: {description}"#,
        skills = if skills.is_empty() { "(none listed)".to_string() } else { skills.join(", ") },
        preferences = profile.preferences.join(", "),
        city = profile.city().unwrap_or("(not given)"),
        education = bullet_list(&education),
        title = job.title,
        company = job.company,
        location = job.location,
        job_skills = bullet_list(&job.skills),
        responsibilities = bullet_list(&job.responsibilities),
        qualifications = bullet_list(&job.qualifications),
        description = job.description,
    )
}

/// Accepts `{"score": 72}` or `{"score": "72"}`; out-of-range values are clamped.
pub fn parse_score(raw: &str) -> Result<MatchScore, ScoreError> {
    let object = find_json_object(raw).ok_or_else(|| ScoreError::Parse("no JSON object in response".to_string()))?;

    let value = match object.get("score") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
    .ok_or_else(|| ScoreError::Parse("missing or non-numeric score".to_string()))?;

    let reasoning = object
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    Ok(MatchScore {
        score: value.round().clamp(0.0, 100.0) as u8,
        reasoning,
    })
}

/// Deterministic keyword score used when the model is unavailable.
pub fn heuristic_score(profile: &UserProfile, job: &ExtractedJob) -> MatchScore {
    let haystack = format!(
        "{}\n{}\n{}\n{}\n{}",
        job.title,
        job.description,
        job.skills.join(" "),
        job.responsibilities.join(" "),
        job.qualifications.join(" ")
    );

    let skills = profile
        .skills
        .iter()
        .filter(|s| contains_ignore_case(&haystack, s))
        .count() as i32;
    let preferences = profile
        .preferences
        .iter()
        .filter(|p| contains_ignore_case(&haystack, p))
        .count() as i32;
    let city = profile
        .city()
        .is_some_and(|c| contains_ignore_case(&job.location, c));

    let raw = BASE_SCORE + skills * SKILL_WEIGHT + preferences * PREFERENCE_WEIGHT + if city { CITY_WEIGHT } else { 0 };

    MatchScore {
        score: raw.clamp(0, 100) as u8,
        reasoning: format!(
            "Heuristic estimate: {} matching skill(s), {} matching preference(s){}",
            skills,
            preferences,
            if city { ", same city" } else { "" }
        ),
    }
}
