//! Structured fields from unstructured posting text.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::debug;

use crate::ai::{GenerateRequest, LlmError, TextModel};
use crate::config::PipelineConfig;
use crate::fallback::Outcome;
use crate::fetch::RetrievedContent;
use crate::models::SearchCandidate;
use crate::retry::{call_with_models, RetryPolicy};

const EXTRACTION_MAX_TOKENS: u32 = 2048;

pub const UNKNOWN_COMPANY: &str = "Unknown Company";

/// Trailing " | LinkedIn" style suffixes search engines append to titles.
const BOARD_NAMES: &[&str] = &[
    "linkedin",
    "indeed",
    "indeed.com",
    "glassdoor",
    "ziprecruiter",
    "monster",
    "wellfound",
    "greenhouse",
    "lever",
    "ashby",
    "workday",
    "smartrecruiters",
];

static SALARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\$\s*(\d[\d,]*(?:\.\d+)?)\s*(k)?\s*(\+)?(?:\s*(?:-|–|—|to)\s*\$?\s*(\d[\d,]*(?:\.\d+)?)\s*(k)?)?",
    )
    .expect("salary pattern is hardcoded and valid")
});

static MULTI_SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("spacing pattern is hardcoded and valid"));

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("model call failed: {0}")]
    Model(#[from] LlmError),

    #[error("could not parse model output: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedJob {
    pub title: String,
    pub company: String,
    pub location: String,
    pub employment_type: String,
    pub remote_type: String,
    pub salary_min: i64,
    pub salary_max: i64,
    pub currency: String,
    pub description: String,
    pub skills: Vec<String>,
    pub responsibilities: Vec<String>,
    pub qualifications: Vec<String>,
    pub posted_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawExtraction {
    title: Option<String>,
    company: Option<String>,
    location: Option<String>,
    employment_type: Option<String>,
    remote_type: Option<String>,
    salary_min: Option<Value>,
    salary_max: Option<Value>,
    currency: Option<String>,
    description: Option<String>,
    skills: Option<Value>,
    responsibilities: Option<Value>,
    qualifications: Option<Value>,
    posted_at: Option<String>,
}

pub struct Extractor {
    model: Arc<dyn TextModel>,
    models: Vec<String>,
    retry: RetryPolicy,
}

impl Extractor {
    pub fn new(model: Arc<dyn TextModel>, config: &PipelineConfig) -> Self {
        Self {
            model,
            models: config.models.clone(),
            retry: config.retry.clone(),
        }
    }

    /// Blocked content short-circuits to a record built from the search
    /// result alone; the model is only asked about readable pages.
    pub async fn extract(
        &self,
        candidate: &SearchCandidate,
        content: &RetrievedContent,
    ) -> Result<Outcome<ExtractedJob>, ExtractError> {
        if content.blocked {
            debug!(url = %candidate.url, "Content blocked, building minimal record");
            return Ok(Outcome::Degraded(synthetic_job(candidate)));
        }

        let prompt = extraction_prompt(&content.url, &content.text);
        let prompt = prompt.as_str();
        let raw = call_with_models(&self.retry, &self.models, |model| async move {
            self.model
                .generate(GenerateRequest {
                    prompt,
                    model_id: &model,
                    max_tokens: EXTRACTION_MAX_TOKENS,
                })
                .await
        })
        .await?;

        parse_extraction(&raw, candidate, &content.text).map(Outcome::Primary)
    }
}

fn extraction_prompt(url: &str, text: &str) -> String {
    format!(
        r#"Extract the job posting below into JSON. Respond with a single JSON object and nothing else.

Schema:
{{
  "title": string,
  "company": string,
  "location": string,
  "employmentType": "full-time" | "part-time" | "contract" | "internship" | "",
  "remoteType": "remote" | "hybrid" | "onsite" | "",
  "salaryMin": number (annual, 0 if unknown),
  "salaryMax": number (annual, 0 if unknown or open-ended),
  "currency": string (ISO code, "" if unknown),
  "description": string (two or three sentences),
  "skills": [string],
  "responsibilities": [string],
  "qualifications": [string],
  "postedAt": string (ISO date or the phrase shown, e.g. "3 days ago"; "" if unknown)
}}

Source URL: {url}

Posting:
{text}"#
    )
}

/// Code fences removed, if the whole response is wrapped in one.
pub fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip a language tag such as ```json
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// First balanced `{...}` substring that parses as a JSON object.
pub fn find_json_object(response: &str) -> Option<serde_json::Map<String, Value>> {
    let text = strip_code_fences(response);

    for (start, _) in text.match_indices('{') {
        let Some(end) = balanced_end(&text[start..]) else {
            continue;
        };
        if let Ok(Value::Object(map)) = serde_json::from_str(&text[start..start + end]) {
            return Some(map);
        }
    }
    None
}

/// Byte length of the object starting at `text[0] == '{'`, string-aware.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_extraction(raw: &str, candidate: &SearchCandidate, text: &str) -> Result<ExtractedJob, ExtractError> {
    let object = find_json_object(raw).ok_or_else(|| ExtractError::Parse("no JSON object in response".to_string()))?;
    let parsed: RawExtraction =
        serde_json::from_value(Value::Object(object)).map_err(|e| ExtractError::Parse(e.to_string()))?;

    let derived = TitleParts::from_candidate(candidate);
    let (salary_min, salary_max) = coerce_salary(parsed.salary_min.as_ref(), parsed.salary_max.as_ref(), text);

    let title = non_empty(parsed.title).unwrap_or(derived.title);
    let company = non_empty(parsed.company)
        .or(derived.company)
        .unwrap_or_else(|| UNKNOWN_COMPANY.to_string());
    let location = non_empty(parsed.location).or(derived.location).unwrap_or_default();

    let mut currency = non_empty(parsed.currency).unwrap_or_default();
    if currency.is_empty() && (salary_min > 0 || salary_max > 0) && text.contains('$') {
        currency = "USD".to_string();
    }

    Ok(ExtractedJob {
        title,
        company,
        location,
        employment_type: non_empty(parsed.employment_type).unwrap_or_default(),
        remote_type: non_empty(parsed.remote_type).unwrap_or_else(|| detect_remote_type(text)),
        salary_min,
        salary_max,
        currency,
        description: non_empty(parsed.description).unwrap_or_default(),
        skills: string_list(parsed.skills),
        responsibilities: string_list(parsed.responsibilities),
        qualifications: string_list(parsed.qualifications),
        posted_at: non_empty(parsed.posted_at),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn string_list(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => non_empty(Some(s)),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) => s
            .split([',', '\n'])
            .filter_map(|part| non_empty(Some(part.to_string())))
            .collect(),
        _ => Vec::new(),
    }
}

/// A parsed pay range. `max == 0` means open-ended or unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SalaryRange {
    pub min: i64,
    pub max: i64,
}

/// First dollar amount or range in `text`, with `k` meaning thousands.
pub fn parse_salary(text: &str) -> SalaryRange {
    let Some(caps) = SALARY_RE.captures(text) else {
        return SalaryRange::default();
    };

    let amount = |idx: usize| -> Option<f64> { caps.get(idx)?.as_str().replace(',', "").parse().ok() };
    let first = amount(1).unwrap_or(0.0);
    let first_k = caps.get(2).is_some();
    let open_ended = caps.get(3).is_some();

    match amount(4) {
        Some(second) => {
            let second_k = caps.get(5).is_some();
            // "$50-70k": the suffix covers both figures
            let first_k = first_k || (second_k && first < 1000.0);
            SalaryRange {
                min: scale(first, first_k),
                max: scale(second, second_k),
            }
        }
        None if open_ended => SalaryRange {
            min: scale(first, first_k),
            max: 0,
        },
        None => {
            let value = scale(first, first_k);
            SalaryRange { min: value, max: value }
        }
    }
}

fn scale(value: f64, thousands: bool) -> i64 {
    let value = if thousands { value * 1000.0 } else { value };
    value.round() as i64
}

/// Model salary fields: numbers are taken as-is, strings are parsed, and the
/// posting text is scanned when the model gave nothing.
fn coerce_salary(min: Option<&Value>, max: Option<&Value>, text: &str) -> (i64, i64) {
    let (min, max) = (present(min), present(max));

    let numeric = |v: Option<&Value>| v.and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64)));
    let all_numeric = [min, max].into_iter().flatten().all(Value::is_number);

    let range = if min.is_none() && max.is_none() {
        SalaryRange::default()
    } else if all_numeric {
        SalaryRange {
            min: numeric(min).unwrap_or(0),
            max: numeric(max).unwrap_or(0),
        }
    } else {
        let joined: Vec<String> = [min, max]
            .into_iter()
            .flatten()
            .map(|v| match v {
                Value::String(s) if s.contains('$') => s.trim().to_string(),
                Value::String(s) => format!("${}", s.trim()),
                other => format!("${}", other),
            })
            .collect();
        parse_salary(&joined.join(" - "))
    };

    if range == SalaryRange::default() {
        let scanned = parse_salary(text);
        return (scanned.min.max(0), scanned.max.max(0));
    }
    (range.min.max(0), range.max.max(0))
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    })
}

fn detect_remote_type(text: &str) -> String {
    let lower = text.to_lowercase();
    if lower.contains("hybrid") {
        "hybrid".to_string()
    } else if lower.contains("remote") {
        "remote".to_string()
    } else if lower.contains("on-site") || lower.contains("onsite") {
        "onsite".to_string()
    } else {
        String::new()
    }
}

/// Title, company and location guessed from a search result title.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TitleParts {
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
}

impl TitleParts {
    pub fn from_candidate(candidate: &SearchCandidate) -> Self {
        let mut parts = Self::parse(&candidate.title);
        if parts.title.is_empty() {
            parts.title = candidate.url.clone();
        }
        parts
    }

    pub fn parse(raw: &str) -> Self {
        let text = strip_board_suffix(raw.trim());

        // LinkedIn: "Title             Company · Location"
        if let Some((before, location)) = text.split_once('·') {
            if let Some(gap) = MULTI_SPACE_RE.find_iter(before).last() {
                let title = before[..gap.start()].trim();
                let company = before[gap.end()..].trim();
                if !title.is_empty() && !company.is_empty() {
                    return Self::new(title, Some(company), Some(location.trim()));
                }
            }
        }

        // LinkedIn search results: "Acme hiring Backend Engineer in Austin, TX"
        if let Some(idx) = text.find(" hiring ") {
            let company = text[..idx].trim();
            let rest = &text[idx + " hiring ".len()..];
            let (title, location) = match rest.rfind(" in ") {
                Some(loc) => (&rest[..loc], Some(rest[loc + 4..].trim())),
                None => (rest, None),
            };
            if !company.is_empty() && !title.trim().is_empty() {
                return Self::new(title.trim(), Some(company), location);
            }
        }

        if let Some(idx) = [" at ", " At ", " AT "].iter().filter_map(|p| text.find(p)).min() {
            let title = text[..idx].trim();
            let company = text[idx + 4..].trim();
            if !company.is_empty() {
                return Self::new(title, Some(company), None);
            }
        }

        // "Title - Company", unless the tail reads like part of the title
        if let Some(idx) = text.rfind(" - ") {
            let title = text[..idx].trim();
            let company = text[idx + 3..].trim();
            let lower = company.to_lowercase();
            if !company.is_empty() && !lower.contains("engineer") && !lower.contains("developer") {
                return Self::new(title, Some(company), None);
            }
        }

        Self::new(text, None, None)
    }

    fn new(title: &str, company: Option<&str>, location: Option<&str>) -> Self {
        let owned = |s: Option<&str>| s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            title: title.trim().to_string(),
            company: owned(company),
            location: owned(location),
        }
    }
}

fn strip_board_suffix(text: &str) -> &str {
    let mut text = text.trim();
    loop {
        let stripped = [" | ", " - ", " – "].iter().find_map(|sep| {
            let (head, tail) = text.rsplit_once(sep)?;
            BOARD_NAMES
                .contains(&tail.trim().to_lowercase().as_str())
                .then_some(head.trim())
        });
        match stripped {
            Some(head) => text = head,
            None => return text,
        }
    }
}

/// Minimal record for a posting whose page could not be read.
pub fn synthetic_job(candidate: &SearchCandidate) -> ExtractedJob {
    let parts = TitleParts::from_candidate(candidate);
    let salary = parse_salary(&candidate.snippet);
    let context = format!("{} {}", candidate.title, candidate.snippet);

    ExtractedJob {
        title: parts.title,
        company: parts.company.unwrap_or_else(|| UNKNOWN_COMPANY.to_string()),
        location: parts.location.unwrap_or_default(),
        remote_type: detect_remote_type(&context),
        salary_min: salary.min,
        salary_max: salary.max,
        currency: if salary.min > 0 { "USD".to_string() } else { String::new() },
        description: candidate.snippet.trim().to_string(),
        ..ExtractedJob::default()
    }
}
