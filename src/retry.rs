//! Rate-limit aware retries across an ordered chain of models.
//!
//! A rate-limited call is retried on the same model with exponential backoff;
//! once the retries for a model are spent the next model in the chain is
//! tried. Any other error is returned immediately.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::ai::LlmError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries per model after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Upper bound on the time spent sleeping for one model chain.
    pub fn total_budget(&self, models: usize) -> Duration {
        let per_model: Duration = (0..self.max_retries).map(|a| self.delay_for(a)).sum();
        per_model.saturating_mul(models as u32)
    }
}

/// Calls `call` with each model id in turn until one succeeds.
pub async fn call_with_models<T, F, Fut>(
    policy: &RetryPolicy,
    models: &[String],
    mut call: F,
) -> Result<T, LlmError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    if models.is_empty() {
        return Err(LlmError::InvalidRequest("no model configured".to_string()));
    }

    let mut last_error = None;

    for model in models {
        let mut attempt = 0;
        loop {
            match call(model.clone()).await {
                Ok(value) => {
                    debug!(model = %model, attempt, "Model call succeeded");
                    return Ok(value);
                }
                Err(e) if e.is_rate_limited() => {
                    if attempt >= policy.max_retries {
                        warn!(model = %model, error = %e, "Retries exhausted, switching model");
                        last_error = Some(e);
                        break;
                    }
                    let delay = policy.delay_for(attempt);
                    warn!(
                        model = %model,
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    Err(LlmError::ModelsExhausted {
        models: models.len(),
        last: Box::new(last_error.unwrap_or_else(|| LlmError::InvalidRequest("no attempt made".to_string()))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn rate_limited(model: &str) -> LlmError {
        LlmError::RateLimited {
            provider: model.to_string(),
            message: "quota exceeded".to_string(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(500));
        assert_eq!(p.delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2000));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
        assert_eq!(p.delay_for(10), Duration::from_secs(4));
        assert_eq!(p.delay_for(40), Duration::from_secs(4));
    }

    #[test]
    fn test_total_budget() {
        // 500 + 1000 + 2000 per model
        assert_eq!(policy().total_budget(2), Duration::from_millis(7000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_rate_limits_then_success() {
        let models = vec!["primary".to_string()];
        let attempts: Arc<Mutex<Vec<Instant>>> = Arc::default();

        let log = attempts.clone();
        let result = call_with_models(&policy(), &models, move |model| {
            let log = log.clone();
            async move {
                let mut log = log.lock().unwrap();
                log.push(Instant::now());
                if log.len() <= 2 {
                    Err(rate_limited(&model))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");

        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 3);
        let first = attempts[1] - attempts[0];
        let second = attempts[2] - attempts[1];
        assert_eq!(first, Duration::from_millis(500));
        assert_eq!(second, Duration::from_millis(1000));
        assert!(second >= first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switches_model_after_exhausting_retries() {
        let models = vec!["primary".to_string(), "secondary".to_string()];
        let calls: Arc<Mutex<Vec<String>>> = Arc::default();

        let log = calls.clone();
        let result = call_with_models(&policy(), &models, move |model| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(model.clone());
                if model == "primary" {
                    Err(rate_limited(&model))
                } else {
                    Ok(model)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "secondary");
        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|m| *m == "primary").count(), 4);
        assert_eq!(calls.last().map(String::as_str), Some("secondary"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_error_aborts_without_retry() {
        let models = vec!["primary".to_string(), "secondary".to_string()];
        let calls = Arc::new(Mutex::new(0));

        let count = calls.clone();
        let started = Instant::now();
        let result: Result<(), _> = call_with_models(&policy(), &models, move |model| {
            let count = count.clone();
            async move {
                *count.lock().unwrap() += 1;
                Err(LlmError::Api {
                    provider: model,
                    status: 500,
                    message: "boom".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(LlmError::Api { status: 500, .. })));
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_models_exhausted() {
        let models = vec!["a".to_string(), "b".to_string()];
        let result: Result<(), _> =
            call_with_models(&policy(), &models, |model| async move { Err(rate_limited(&model)) }).await;

        match result {
            Err(LlmError::ModelsExhausted { models, last }) => {
                assert_eq!(models, 2);
                assert!(last.is_rate_limited());
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_model_list() {
        let result: Result<(), _> = call_with_models(&policy(), &[], |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(LlmError::InvalidRequest(_))));
    }
}
