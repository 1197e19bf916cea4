//! Retrieval of posting text, either from the search snippet or the page.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::fallback::{degrade_on_error, Outcome};
use crate::models::SearchCandidate;
use crate::text::{collapse_whitespace, truncate_chars};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];

const MAIN_SELECTORS: &[&str] = &[
    "main",
    "article",
    "[role='main']",
    ".jobs-description__content",
    ".show-more-less-html__markup",
    "#jobDescriptionText",
    "#content",
    ".content",
    "body",
];

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "svg"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
}

/// Raw HTTP GET of a posting page.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, agent)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(FetchedPage { status, body })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("access denied (HTTP {0})")]
    Denied(u16),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("empty page")]
    Empty,

    #[error("network error: {0:#}")]
    Network(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedContent {
    pub text: String,
    pub url: String,
    /// The page could not be read; `text` was built from the search result.
    pub blocked: bool,
}

pub struct ContentRetriever {
    fetcher: Arc<dyn PageFetcher>,
    snippet_threshold: usize,
    max_chars: usize,
}

impl ContentRetriever {
    pub fn new(fetcher: Arc<dyn PageFetcher>, config: &PipelineConfig) -> Self {
        Self {
            fetcher,
            snippet_threshold: config.snippet_threshold,
            max_chars: config.max_content_chars,
        }
    }

    pub async fn retrieve(&self, candidate: &SearchCandidate) -> Outcome<RetrievedContent> {
        if candidate.snippet.chars().count() > self.snippet_threshold {
            debug!(url = %candidate.url, "Using search snippet as content");
            return Outcome::Primary(RetrievedContent {
                text: format!("{}\n\n{}", candidate.title, candidate.snippet),
                url: candidate.url.clone(),
                blocked: false,
            });
        }

        degrade_on_error("fetch", self.fetch_text(&candidate.url), |e: &FetchError| RetrievedContent {
            text: synthetic_content(candidate, &e.to_string()),
            url: candidate.url.clone(),
            blocked: true,
        })
        .await
    }

    async fn fetch_text(&self, url: &str) -> Result<RetrievedContent, FetchError> {
        let page = self.fetcher.fetch(url).await.map_err(FetchError::Network)?;

        match page.status {
            401 | 403 | 429 | 451 => return Err(FetchError::Denied(page.status)),
            200..=299 => {}
            other => return Err(FetchError::Status(other)),
        }

        let text = html_to_text(&page.body, self.max_chars);
        if text.is_empty() {
            return Err(FetchError::Empty);
        }

        Ok(RetrievedContent {
            text,
            url: url.to_string(),
            blocked: false,
        })
    }
}

fn synthetic_content(candidate: &SearchCandidate, reason: &str) -> String {
    format!(
        "URL: {}\nTitle: {}\nSnippet: {}\nNote: the posting page could not be read ({}); details are limited to the search result.",
        candidate.url, candidate.title, candidate.snippet, reason
    )
}

/// Readable text from an HTML page: main content preferred, scripts and
/// styles dropped, whitespace collapsed, cut to `max_chars`.
pub fn html_to_text(html: &str, max_chars: usize) -> String {
    let document = Html::parse_document(html);

    for selector_str in MAIN_SELECTORS {
        let Ok(selector) = Selector::parse(selector_str) else {
            continue;
        };
        for element in document.select(&selector) {
            let text = visible_text(element);
            if !text.is_empty() {
                return truncate_chars(&text, max_chars).to_string();
            }
        }
    }

    // Fragments without a body element
    let text = visible_text(document.root_element());
    truncate_chars(&text, max_chars).to_string()
}

fn visible_text(element: scraper::ElementRef<'_>) -> String {
    let mut out = String::new();
    for node in element.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| SKIPPED_ELEMENTS.contains(&e.name()))
        });
        if !hidden {
            out.push_str(text);
            out.push(' ');
        }
    }
    collapse_whitespace(&out)
}
