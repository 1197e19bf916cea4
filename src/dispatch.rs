use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::models::SearchCandidate;
use crate::search::{SearchProvider, SearchRequest};

/// Sliding-window limiter: at most `max_ops` acquisitions per `window`.
pub struct Throttle {
    max_ops: usize,
    window: Duration,
    recent: Mutex<VecDeque<Instant>>,
}

impl Throttle {
    pub fn new(max_ops: usize, window: Duration) -> Self {
        Self {
            max_ops: max_ops.max(1),
            window,
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Waits until another operation fits in the window, then records it.
    pub async fn acquire(&self) {
        let mut recent = self.recent.lock().await;
        loop {
            let now = Instant::now();
            while recent.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
                recent.pop_front();
            }
            if recent.len() < self.max_ops {
                recent.push_back(now);
                return;
            }
            if let Some(oldest) = recent.front().copied() {
                let wait = self.window.saturating_sub(now.duration_since(oldest));
                debug!(wait_ms = wait.as_millis() as u64, "Search throttle full, waiting");
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Candidates found for one preference.
#[derive(Debug, Clone)]
pub struct PreferenceResults {
    pub preference: String,
    pub candidates: Vec<SearchCandidate>,
}

pub fn build_query(preference: &str, city: Option<&str>, boards: &[String]) -> String {
    let mut query = format!("\"{}\" jobs", preference.trim());
    if let Some(city) = city {
        query.push_str(" in ");
        query.push_str(city);
    }
    if !boards.is_empty() {
        let sites: Vec<String> = boards.iter().map(|b| format!("site:{}", b)).collect();
        query.push_str(&format!(" ({})", sites.join(" OR ")));
    }
    query
}

/// Turns preferences into throttled, sequential search calls.
pub struct QueryDispatcher {
    search: Arc<dyn SearchProvider>,
    throttle: Throttle,
    config: Arc<PipelineConfig>,
}

impl QueryDispatcher {
    pub fn new(search: Arc<dyn SearchProvider>, config: Arc<PipelineConfig>) -> Self {
        let throttle = Throttle::new(config.search_max_ops, config.search_window);
        Self {
            search,
            throttle,
            config,
        }
    }

    /// One search per preference, in order. Failed searches are skipped.
    pub async fn dispatch(&self, preferences: &[String], city: Option<&str>) -> Vec<PreferenceResults> {
        let mut results = Vec::new();

        for preference in preferences.iter().take(self.config.max_preferences) {
            let request = SearchRequest {
                query: build_query(preference, city, &self.config.job_board_domains),
                result_count: self.config.results_per_query,
                region: self.config.search_region.clone(),
            };

            self.throttle.acquire().await;
            match self.search.search(&request).await {
                Ok(hits) => {
                    info!(preference = %preference, hits = hits.len(), "Search complete");
                    results.push(PreferenceResults {
                        preference: preference.clone(),
                        candidates: hits.into_iter().map(SearchCandidate::from).collect(),
                    });
                }
                Err(e) => {
                    warn!(preference = %preference, error = %e, "Search failed, skipping preference");
                }
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{hit, StubSearch};

    fn config(max_ops: usize) -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig {
            search_max_ops: max_ops,
            search_window: Duration::from_secs(60),
            job_board_domains: vec!["linkedin.com".to_string(), "lever.co".to_string()],
            ..PipelineConfig::default()
        })
    }

    #[test]
    fn test_build_query() {
        let boards = vec!["linkedin.com".to_string(), "lever.co".to_string()];
        assert_eq!(
            build_query("Backend Engineer", Some("Austin"), &boards),
            "\"Backend Engineer\" jobs in Austin (site:linkedin.com OR site:lever.co)"
        );
        assert_eq!(build_query(" SRE ", None, &[]), "\"SRE\" jobs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_preference_is_skipped() {
        let search = Arc::new(
            StubSearch::new()
                .with_hits("Backend", vec![hit("Backend Engineer", "https://jobs.lever.co/acme/1", "")])
                .failing_on("Data")
                .with_hits("SRE", vec![hit("SRE", "https://jobs.lever.co/beta/2", "")]),
        );
        let dispatcher = QueryDispatcher::new(search.clone(), config(5));

        let prefs = vec![
            "Backend Engineer".to_string(),
            "Data Engineer".to_string(),
            "SRE".to_string(),
        ];
        let results = dispatcher.dispatch(&prefs, None).await;

        assert_eq!(search.queries().len(), 3);
        let found: Vec<&str> = results.iter().map(|r| r.preference.as_str()).collect();
        assert_eq!(found, vec!["Backend Engineer", "SRE"]);
        assert_eq!(results[0].candidates[0].url, "https://jobs.lever.co/acme/1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_preferences_are_capped() {
        let search = Arc::new(StubSearch::new());
        let mut cfg = (*config(10)).clone();
        cfg.max_preferences = 2;
        let dispatcher = QueryDispatcher::new(search.clone(), Arc::new(cfg));

        let prefs: Vec<String> = (0..4).map(|i| format!("Role {}", i)).collect();
        dispatcher.dispatch(&prefs, Some("Denver")).await;

        let queries = search.queries();
        assert_eq!(queries.len(), 2);
        assert!(queries[0].contains("in Denver"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_waits_for_window() {
        let throttle = Throttle::new(2, Duration::from_secs(60));
        let start = Instant::now();

        throttle.acquire().await;
        throttle.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        throttle.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }
}
