//! Scripted stand-ins for the pipeline's external collaborators.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::ai::{GenerateRequest, LlmError, TextModel};
use crate::fetch::{FetchedPage, PageFetcher};
use crate::models::UserProfile;
use crate::profile::ProfileSource;
use crate::search::{SearchHit, SearchProvider, SearchRequest};

/// Record of a call made to [`ScriptedModel`].
#[derive(Debug, Clone)]
pub struct ModelCall {
    pub model_id: String,
    pub prompt: String,
}

/// Text model that answers from a script.
///
/// Rules are checked in insertion order; the first whose needle appears in
/// the prompt wins, otherwise the default response is returned.
#[derive(Default)]
pub struct ScriptedModel {
    default_response: RwLock<Option<String>>,
    rules: RwLock<Vec<(String, String)>>,
    /// Calls left that answer with a rate-limit error before the script runs.
    rate_limits_left: RwLock<usize>,
    hard_failure: RwLock<bool>,
    calls: Arc<RwLock<Vec<ModelCall>>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with(self, response: &str) -> Self {
        *self.default_response.write().unwrap() = Some(response.to_string());
        self
    }

    pub fn when_prompt_contains(self, needle: &str, response: &str) -> Self {
        self.rules
            .write()
            .unwrap()
            .push((needle.to_string(), response.to_string()));
        self
    }

    pub fn rate_limited_times(self, times: usize) -> Self {
        *self.rate_limits_left.write().unwrap() = times;
        self
    }

    pub fn always_fail(self) -> Self {
        *self.hard_failure.write().unwrap() = true;
        self
    }

    pub fn calls(&self) -> Vec<ModelCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    pub fn models_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.model_id).collect()
    }
}

#[async_trait]
impl TextModel for ScriptedModel {
    async fn generate(&self, request: GenerateRequest<'_>) -> Result<String, LlmError> {
        self.calls.write().unwrap().push(ModelCall {
            model_id: request.model_id.to_string(),
            prompt: request.prompt.to_string(),
        });

        {
            let mut left = self.rate_limits_left.write().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(LlmError::RateLimited {
                    provider: "scripted".to_string(),
                    message: "quota exceeded".to_string(),
                });
            }
        }

        if *self.hard_failure.read().unwrap() {
            return Err(LlmError::Api {
                provider: "scripted".to_string(),
                status: 500,
                message: "internal error".to_string(),
            });
        }

        let rules = self.rules.read().unwrap();
        if let Some((_, response)) = rules.iter().find(|(needle, _)| request.prompt.contains(needle.as_str())) {
            return Ok(response.clone());
        }

        self.default_response
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| LlmError::InvalidRequest("no scripted response".to_string()))
    }
}

/// Search provider answering from canned hits keyed by a query substring.
#[derive(Default)]
pub struct StubSearch {
    results: RwLock<Vec<(String, Vec<SearchHit>)>>,
    failing: RwLock<Vec<String>>,
    queries: Arc<RwLock<Vec<String>>>,
}

impl StubSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hits(self, query_contains: &str, hits: Vec<SearchHit>) -> Self {
        self.results
            .write()
            .unwrap()
            .push((query_contains.to_string(), hits));
        self
    }

    pub fn failing_on(self, query_contains: &str) -> Self {
        self.failing.write().unwrap().push(query_contains.to_string());
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.read().unwrap().clone()
    }
}

#[async_trait]
impl SearchProvider for StubSearch {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        self.queries.write().unwrap().push(request.query.clone());

        if self
            .failing
            .read()
            .unwrap()
            .iter()
            .any(|needle| request.query.contains(needle.as_str()))
        {
            return Err(anyhow!("search quota exceeded"));
        }

        Ok(self
            .results
            .read()
            .unwrap()
            .iter()
            .find(|(needle, _)| request.query.contains(needle.as_str()))
            .map(|(_, hits)| hits.clone())
            .unwrap_or_default())
    }
}

pub fn hit(title: &str, link: &str, snippet: &str) -> SearchHit {
    SearchHit {
        title: title.to_string(),
        link: link.to_string(),
        snippet: snippet.to_string(),
    }
}

/// Page fetcher serving canned pages; unknown URLs return 404.
#[derive(Default)]
pub struct StubFetcher {
    pages: RwLock<HashMap<String, FetchedPage>>,
    unreachable: RwLock<Vec<String>>,
    fetched: Arc<RwLock<Vec<String>>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, status: u16, body: &str) -> Self {
        self.pages.write().unwrap().insert(
            url.to_string(),
            FetchedPage {
                status,
                body: body.to_string(),
            },
        );
        self
    }

    pub fn unreachable(self, url: &str) -> Self {
        self.unreachable.write().unwrap().push(url.to_string());
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.read().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        self.fetched.write().unwrap().push(url.to_string());

        if self.unreachable.read().unwrap().iter().any(|u| u == url) {
            return Err(anyhow!("connection reset by peer"));
        }

        Ok(self
            .pages
            .read()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(FetchedPage {
                status: 404,
                body: String::new(),
            }))
    }
}

/// In-memory profile source.
#[derive(Default)]
pub struct StaticProfiles {
    profiles: HashMap<String, UserProfile>,
}

impl StaticProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, profile: UserProfile) -> Self {
        self.profiles.insert(profile.id.clone(), profile);
        self
    }
}

impl ProfileSource for StaticProfiles {
    fn load(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.profiles.get(user_id).cloned())
    }
}
