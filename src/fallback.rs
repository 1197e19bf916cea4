//! Primary/secondary capability selection.
//!
//! Page fetching, blocked-content extraction and match scoring each have a
//! preferred implementation and a cheaper one that always produces a value.
//! They all report which one ran through [`Outcome`].

use std::fmt::Display;
use std::future::Future;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Primary(T),
    Degraded(T),
}

impl<T> Outcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            Outcome::Primary(value) | Outcome::Degraded(value) => value,
        }
    }

    pub fn get(&self) -> &T {
        match self {
            Outcome::Primary(value) | Outcome::Degraded(value) => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded(_))
    }
}

/// Runs `primary`; if it fails, logs the error and returns `secondary(&err)`.
pub async fn degrade_on_error<T, E, Fut, F>(capability: &str, primary: Fut, secondary: F) -> Outcome<T>
where
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    F: FnOnce(&E) -> T,
{
    match primary.await {
        Ok(value) => Outcome::Primary(value),
        Err(e) => {
            warn!(capability, error = %e, "Primary failed, using fallback");
            Outcome::Degraded(secondary(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_primary_success_is_kept() {
        let out = degrade_on_error("score", async { Ok::<_, String>(72) }, |_| 50).await;
        assert_eq!(out, Outcome::Primary(72));
        assert!(!out.is_degraded());
    }

    #[tokio::test]
    async fn test_failure_runs_secondary_with_error() {
        let out = degrade_on_error("fetch", async { Err::<String, _>("403 Forbidden".to_string()) }, |e| {
            format!("synthetic ({e})")
        })
        .await;
        assert!(out.is_degraded());
        assert_eq!(out.into_inner(), "synthetic (403 Forbidden)");
    }
}
