use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::models::SearchCandidate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub result_count: u32,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub snippet: String,
}

impl From<SearchHit> for SearchCandidate {
    fn from(hit: SearchHit) -> Self {
        SearchCandidate {
            url: hit.link,
            title: hit.title,
            snippet: hit.snippet,
        }
    }
}

/// Web search used to discover posting URLs.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>>;
}

const GOOGLE_CSE_URL: &str = "https://www.googleapis.com/customsearch/v1";

/// The Custom Search JSON API returns at most ten results per request.
const GOOGLE_MAX_RESULTS: u32 = 10;

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    #[serde(default)]
    items: Vec<SearchHit>,
}

/// Google Programmable Search client.
pub struct GoogleSearch {
    api_key: String,
    engine_id: String,
    client: reqwest::Client,
}

impl GoogleSearch {
    pub fn new() -> Result<Self> {
        let api_key = env::var("GOOGLE_API_KEY").context("GOOGLE_API_KEY environment variable not set")?;
        let engine_id = env::var("GOOGLE_CSE_ID").context("GOOGLE_CSE_ID environment variable not set")?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            engine_id,
            client,
        })
    }
}

#[async_trait]
impl SearchProvider for GoogleSearch {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let num = request.result_count.clamp(1, GOOGLE_MAX_RESULTS).to_string();

        let response = self
            .client
            .get(GOOGLE_CSE_URL)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.engine_id.as_str()),
                ("q", request.query.as_str()),
                ("num", num.as_str()),
                ("gl", request.region.as_str()),
            ])
            .send()
            .await
            .context("Failed to send search request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Search API error {}: {}", status, body);
        }

        let parsed: GoogleResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;

        Ok(parsed
            .items
            .into_iter()
            .filter(|hit| !hit.link.trim().is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_google_response_tolerates_missing_fields() {
        let json = r#"{
            "items": [
                {"title": "Backend Engineer - Acme", "link": "https://boards.greenhouse.io/acme/jobs/1", "snippet": "Rust"},
                {"link": "https://jobs.lever.co/beta/2"}
            ]
        }"#;
        let parsed: GoogleResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[1].title, "");

        let empty: GoogleResponse = serde_json::from_str(r#"{"searchInformation": {}}"#).unwrap();
        assert!(empty.items.is_empty());
    }

    #[test]
    fn test_hit_converts_to_candidate() {
        let hit = SearchHit {
            title: "SRE at Beta".to_string(),
            link: "https://jobs.lever.co/beta/2".to_string(),
            snippet: "On-call".to_string(),
        };
        let candidate = SearchCandidate::from(hit);
        assert_eq!(candidate.url, "https://jobs.lever.co/beta/2");
        assert_eq!(candidate.title, "SRE at Beta");
    }
}
