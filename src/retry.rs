//! Retry domains.
//!
//! The fetch step and the score step each run inside their own `RetryDomain`.
//! A domain re-runs the same operation with the same input on retryable errors,
//! waits a deterministic exponential backoff between attempts, bounds every
//! attempt with a timeout, and keeps its own counters so that one service's
//! trouble never shows up in the other's budget.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::StepError;
use crate::orchestrator::control::Mailbox;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    /// `None` retries forever.
    pub maximum_attempts: Option<u32>,
    pub attempt_timeout: Option<Duration>,
    /// Error classes (see `StepError::class`) that fail the step at once.
    pub non_retryable: HashSet<String>,
}

impl RetryPolicy {
    /// Review source policy: slow, patient backoff for a rate-limited API.
    pub fn fetch_defaults() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            backoff_coefficient: 3.0,
            maximum_interval: Duration::from_secs(300),
            maximum_attempts: Some(15),
            attempt_timeout: Some(Duration::from_secs(10)),
            non_retryable: ["auth", "not_found", "malformed_response"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    /// Sentiment service policy: quick retries against throttling.
    pub fn score_defaults() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(30),
            maximum_attempts: Some(8),
            attempt_timeout: Some(Duration::from_secs(30)),
            non_retryable: ["invalid_input", "unauthorized", "malformed_response"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    /// Wait before attempt `failed_attempt + 1`, i.e. `initial * coefficient^(n-1)`
    /// capped at `maximum_interval`.
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        if secs.is_finite() && secs < self.maximum_interval.as_secs_f64() {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            self.maximum_interval
        }
    }

    pub fn is_retryable(&self, error: &StepError) -> bool {
        !error.is_fatal() && !self.non_retryable.contains(error.class())
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.maximum_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Counters for one domain.
#[derive(Debug, Default)]
pub struct DomainStats {
    attempts: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
    rejected: AtomicU64,
    interrupted: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStatsSnapshot {
    pub attempts: u64,
    pub retries: u64,
    pub exhausted: u64,
    pub rejected: u64,
    pub interrupted: u64,
}

impl DomainStats {
    pub fn snapshot(&self) -> DomainStatsSnapshot {
        DomainStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }
}

/// Why a domain gave up on a step.
#[derive(Debug)]
pub enum RetryError {
    /// Non-retryable error, fatal error, or attempts exhausted.
    Failed {
        error: StepError,
        attempts: u32,
        exhausted: bool,
    },
    /// A cancel arrived while waiting out a backoff.
    Interrupted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct RetryDomain {
    name: &'static str,
    policy: RetryPolicy,
    stats: Arc<DomainStats>,
}

impl RetryDomain {
    pub fn new(name: &'static str, policy: RetryPolicy) -> Self {
        Self {
            name,
            policy,
            stats: Arc::new(DomainStats::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> DomainStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run `op` until it succeeds or the policy gives up. `op` receives the
    /// 1-based attempt number. Only the backoff wait observes `mailbox`; an
    /// attempt already in flight always finishes.
    pub async fn run<T, F, Fut>(&self, mailbox: &Mailbox, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);

            let outcome = match self.policy.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(StepError::Timeout(limit)),
                },
                None => op(attempt).await,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.policy.is_retryable(&error) {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    domain = self.name,
                    attempt,
                    class = error.class(),
                    "non-retryable error: {}",
                    error
                );
                return Err(RetryError::Failed {
                    error,
                    attempts: attempt,
                    exhausted: false,
                });
            }

            if self.policy.exhausted(attempt) {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    domain = self.name,
                    attempt,
                    class = error.class(),
                    "retry attempts exhausted: {}",
                    error
                );
                return Err(RetryError::Failed {
                    error,
                    attempts: attempt,
                    exhausted: true,
                });
            }

            let delay = self.policy.delay(attempt);
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                domain = self.name,
                attempt,
                class = error.class(),
                delay_ms = delay.as_millis() as u64,
                "retrying after error: {}",
                error
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = mailbox.cancelled() => {
                    self.stats.interrupted.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(domain = self.name, attempt, "backoff interrupted by cancel");
                    return Err(RetryError::Interrupted { attempts: attempt });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{FetchError, ScoreError, StoreError};
    use crate::orchestrator::control::ControlSignal;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;

    fn fast_policy(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_millis(4),
            maximum_attempts: max_attempts,
            attempt_timeout: Some(Duration::from_millis(200)),
            non_retryable: ["not_found".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::fetch_defaults();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(6));
        assert_eq!(policy.delay(3), Duration::from_secs(18));
        assert_eq!(policy.delay(5), Duration::from_secs(162));
        assert_eq!(policy.delay(6), Duration::from_secs(300));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_score_defaults() {
        let policy = RetryPolicy::score_defaults();
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.maximum_attempts, Some(8));
        assert!(policy.non_retryable.contains("invalid_input"));
    }

    #[test]
    fn test_fatal_errors_ignore_policy() {
        let mut policy = fast_policy(None);
        policy.non_retryable.clear();
        let missing = StepError::Store(StoreError::PageMissing {
            path: PathBuf::from("/x"),
        });
        assert!(!policy.is_retryable(&missing));
        assert!(policy.is_retryable(&StepError::Fetch(FetchError::RateLimited("x".into()))));
    }

    #[tokio::test]
    async fn test_retries_until_success_with_same_input() {
        let domain = RetryDomain::new("fetch", fast_policy(Some(5)));
        let mailbox = Mailbox::new();
        let seen = std::sync::Mutex::new(Vec::new());

        let input = 7u64;
        let result = domain
            .run(&mailbox, |attempt| {
                seen.lock().unwrap().push((attempt, input));
                async move {
                    if attempt < 3 {
                        Err(FetchError::Unavailable("503".into()).into())
                    } else {
                        Ok(input * 2)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 14);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 7), (2, 7), (3, 7)]);
        let stats = domain.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.exhausted, 0);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_first_attempt() {
        let domain = RetryDomain::new("fetch", fast_policy(Some(5)));
        let mailbox = Mailbox::new();
        let err = domain
            .run(&mailbox, |_| async {
                Err::<(), _>(FetchError::NotFound("item".into()).into())
            })
            .await
            .unwrap_err();

        match err {
            RetryError::Failed {
                error,
                attempts,
                exhausted,
            } => {
                assert_eq!(error.class(), "not_found");
                assert_eq!(attempts, 1);
                assert!(!exhausted);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(domain.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let domain = RetryDomain::new("score", fast_policy(Some(3)));
        let mailbox = Mailbox::new();
        let err = domain
            .run(&mailbox, |_| async {
                Err::<(), _>(ScoreError::Throttled("slow down".into()).into())
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RetryError::Failed {
                attempts: 3,
                exhausted: true,
                ..
            }
        ));
        let stats = domain.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.exhausted, 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retryable() {
        let domain = RetryDomain::new("score", fast_policy(Some(2)));
        let mailbox = Mailbox::new();
        let calls = AtomicU32::new(0);
        let result = domain
            .run(&mailbox, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 1 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok::<_, StepError>("done")
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let mut policy = fast_policy(None);
        policy.initial_interval = Duration::from_secs(60);
        policy.maximum_interval = Duration::from_secs(60);
        let domain = RetryDomain::new("fetch", policy);
        let mailbox = Arc::new(Mailbox::new());

        let poster = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                mailbox.post(ControlSignal::Cancel);
            })
        };

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            domain.run(&mailbox, |_| async {
                Err::<(), _>(FetchError::RateLimited("429".into()).into())
            }),
        )
        .await
        .expect("backoff was not interrupted")
        .unwrap_err();

        poster.await.unwrap();
        assert!(matches!(err, RetryError::Interrupted { attempts: 1 }));
        assert_eq!(domain.stats().interrupted, 1);
    }

    #[tokio::test]
    async fn test_domains_keep_separate_counters() {
        let fetch = RetryDomain::new("fetch", fast_policy(Some(4)));
        let score = RetryDomain::new("score", fast_policy(Some(4)));
        let mailbox = Mailbox::new();

        let _ = fetch
            .run(&mailbox, |_| async {
                Err::<(), _>(FetchError::RateLimited("429".into()).into())
            })
            .await;
        score
            .run(&mailbox, |_| async { Ok::<_, StepError>(()) })
            .await
            .unwrap();

        assert_eq!(fetch.stats().attempts, 4);
        assert_eq!(fetch.stats().exhausted, 1);
        assert_eq!(score.stats().attempts, 1);
        assert_eq!(score.stats().retries, 0);
    }
}
