use std::collections::HashSet;
use tracing::debug;
use url::Url;

use crate::config::PipelineConfig;
use crate::models::SearchCandidate;

/// Applicant tracking systems where every non-root path is a single posting.
const ATS_HOSTS: &[&str] = &["greenhouse.io", "lever.co", "ashbyhq.com", "myworkdayjobs.com"];

/// Path/query fragments that identify a single posting on the big boards.
const POSTING_MARKERS: &[&str] = &["/jobs/view/", "/viewjob", "jk=", "/job-listing/"];

const JOB_KEYWORDS: &[&str] = &["job", "hiring", "career", "position", "opening", "vacancy"];

/// Search, listing and alert pages. These are never a single posting.
pub fn is_listing_page(url: &str) -> bool {
    url.contains("/jobs/search")
        || url.contains("/search?")
        || url.contains("/jobs/alerts")
        || url.contains("/q-")
        || url.contains("/jobs?")
}

/// Canonical form used for deduplication: fragment dropped, host lowercased,
/// trailing slash trimmed. `None` for anything that is not an http(s) URL.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.host_str()?;

    url.set_fragment(None);
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    let mut normalized = url.to_string();
    if url.query().is_none() && normalized.ends_with('/') {
        normalized.pop();
    }
    Some(normalized)
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{}", domain))
}

/// Drops repeated URLs (after normalization), keeping the first occurrence.
pub fn dedupe_by_url(candidates: impl IntoIterator<Item = SearchCandidate>) -> Vec<SearchCandidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter_map(|mut candidate| {
            candidate.url = normalize_url(&candidate.url)?;
            seen.insert(candidate.url.clone()).then_some(candidate)
        })
        .collect()
}

/// Decides which search hits point at individual job postings.
pub struct UrlClassifier {
    boards: Vec<String>,
    disallowed_locales: Vec<String>,
    loose_cap: usize,
}

impl UrlClassifier {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            boards: config.job_board_domains.iter().map(|d| d.to_lowercase()).collect(),
            disallowed_locales: config.disallowed_locales.iter().map(|l| l.to_lowercase()).collect(),
            loose_cap: config.loose_fallback_cap,
        }
    }

    pub fn classify(&self, candidates: Vec<SearchCandidate>) -> Vec<SearchCandidate> {
        let candidates = dedupe_by_url(candidates);

        let strict: Vec<SearchCandidate> = candidates
            .iter()
            .filter(|c| self.is_posting(&c.url))
            .cloned()
            .collect();
        if !strict.is_empty() {
            debug!(total = candidates.len(), kept = strict.len(), "Classified candidates");
            return strict;
        }

        let loose: Vec<SearchCandidate> = candidates
            .into_iter()
            .filter(|c| !is_listing_page(&c.url) && !self.is_disallowed_locale(&c.url))
            .filter(|c| mentions_job(&c.title) || mentions_job(&c.snippet))
            .take(self.loose_cap)
            .collect();
        debug!(kept = loose.len(), "No strict matches, using keyword fallback");
        loose
    }

    /// Strict check: allowlisted board and a single-posting path.
    pub fn is_posting(&self, url: &str) -> bool {
        if is_listing_page(url) || self.is_disallowed_locale(url) {
            return false;
        }
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(host) = parsed.host_str().map(str::to_lowercase) else {
            return false;
        };

        if !self.boards.iter().any(|board| host_matches(&host, board)) {
            return false;
        }

        let path = parsed.path().trim_end_matches('/');
        if ATS_HOSTS.iter().any(|ats| host_matches(&host, ats)) {
            return !path.is_empty();
        }

        let tail = match parsed.query() {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        };
        POSTING_MARKERS.iter().any(|marker| tail.contains(marker))
    }

    /// A disallowed two-letter locale as first host label or first path segment.
    pub fn is_disallowed_locale(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let host_label = parsed
            .host_str()
            .and_then(|h| h.split('.').next())
            .map(str::to_lowercase);
        let first_segment = parsed
            .path_segments()
            .and_then(|mut segments| segments.next())
            .map(str::to_lowercase);

        [host_label, first_segment]
            .into_iter()
            .flatten()
            .any(|part| self.disallowed_locales.contains(&part))
    }
}

fn mentions_job(text: &str) -> bool {
    let lower = text.to_lowercase();
    JOB_KEYWORDS.iter().any(|kw| lower.contains(kw))
}
