// Resilient Caller
// Per-attempt timeout, exponential backoff and cancellation for provider calls

use crate::models::ProviderUsage;
use crate::services::config_store::PipelineConfig;
use crate::services::providers::{EmbeddingResponse, ProviderError, RewriteResponse};
use crate::services::usage::UsageLedger;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Responses that carry the provider's token usage.
pub trait Metered {
    fn usage(&self) -> &ProviderUsage;
}

impl Metered for RewriteResponse {
    fn usage(&self) -> &ProviderUsage {
        &self.usage
    }
}

impl Metered for EmbeddingResponse {
    fn usage(&self) -> &ProviderUsage {
        &self.usage
    }
}

/// The surrounding run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            max_attempts: cfg.max_retries.max(1),
            timeout: cfg.request_timeout(),
            min_wait: cfg.min_retry_wait(),
            max_wait: cfg.max_retry_wait(),
        }
    }

    /// Wait after the given 1-based attempt: `min_wait * 2^attempt`, clamped
    /// to `[min_wait, max_wait]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.min_wait
            .saturating_mul(factor)
            .clamp(self.min_wait, self.max_wait.max(self.min_wait))
    }
}

#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },
    /// Attempts exhausted, or a non-transient error ended them early.
    FinalFailure { last_error: ProviderError, attempts: u32 },
    Cancelled,
}

/// Run `op` under `policy`. Never returns an error past its boundary: the
/// caller decides what a `FinalFailure` means.
///
/// Every attempt is written to `ledger`, including failed attempts the
/// provider still billed. Cancellation abandons the in-flight attempt and any
/// pending backoff.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    ledger: &mut UsageLedger,
    mut op: F,
) -> RetryOutcome<T>
where
    T: Metered,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error: Option<ProviderError> = None;

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return RetryOutcome::Cancelled;
        }

        let started = Instant::now();
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("[resilience] {} cancelled during attempt={}", label, attempt);
                return RetryOutcome::Cancelled;
            }
            r = tokio::time::timeout(policy.timeout, op()) => r,
        };

        let err = match res {
            Ok(Ok(value)) => {
                ledger.record_success(value.usage());
                if attempt > 1 {
                    info!(
                        "[resilience] {} ok attempt={} elapsed_ms={}",
                        label,
                        attempt,
                        started.elapsed().as_millis()
                    );
                }
                return RetryOutcome::Success { value, attempts: attempt };
            }
            Ok(Err(e)) => {
                ledger.record_failure(e.charged_usage());
                e
            }
            Err(_) => {
                ledger.record_failure(None);
                ProviderError::Timeout(policy.timeout)
            }
        };

        let transient = err.is_transient();
        warn!(
            "[resilience] {} attempt={}/{} transient={} : {}",
            label, attempt, max_attempts, transient, err
        );

        if !transient {
            return RetryOutcome::FinalFailure {
                last_error: err,
                attempts: attempt,
            };
        }
        last_error = Some(err);

        if attempt < max_attempts {
            let wait = policy.backoff(attempt);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return RetryOutcome::Cancelled,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    RetryOutcome::FinalFailure {
        last_error: last_error.unwrap_or(ProviderError::Timeout(policy.timeout)),
        attempts: max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::ContractViolation;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            timeout: Duration::from_millis(200),
            min_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(4),
        }
    }

    fn embedding(tokens: u64) -> EmbeddingResponse {
        EmbeddingResponse {
            vector: vec![1.0, 0.0],
            usage: ProviderUsage::new("text-embedding-ada-002", tokens, 0),
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_clamped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            timeout: Duration::from_secs(60),
            min_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(10),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10));
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut ledger = UsageLedger::new();
        let c = calls.clone();

        let outcome = call_with_retry(
            &fast_policy(3),
            &CancellationToken::new(),
            "embed",
            &mut ledger,
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ProviderError::RateLimited("busy".into()))
                    } else {
                        Ok(embedding(12))
                    }
                }
            },
        )
        .await;

        assert!(matches!(outcome, RetryOutcome::Success { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.calls(), 2);
        assert_eq!(ledger.failed_calls(), 1);
        assert_eq!(ledger.total_tokens(), 12);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_final_failure_with_charged_usage() {
        let mut ledger = UsageLedger::new();
        let outcome: RetryOutcome<EmbeddingResponse> = call_with_retry(
            &fast_policy(3),
            &CancellationToken::new(),
            "embed",
            &mut ledger,
            || async {
                Err(ProviderError::JsonError {
                    message: "truncated".into(),
                    usage: Some(ProviderUsage::new("gpt-3.5-turbo", 5, 5)),
                })
            },
        )
        .await;

        match outcome {
            RetryOutcome::FinalFailure { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last_error, ProviderError::JsonError { .. }));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(ledger.total_tokens(), 30);
        assert_eq!(ledger.failed_calls(), 3);
    }

    #[tokio::test]
    async fn test_contract_violation_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut ledger = UsageLedger::new();
        let c = calls.clone();

        let outcome: RetryOutcome<EmbeddingResponse> = call_with_retry(
            &fast_policy(3),
            &CancellationToken::new(),
            "classify",
            &mut ledger,
            || {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProviderError::contract(
                        ContractViolation::UnknownLabel("unknown".into()),
                        None,
                    ))
                }
            },
        )
        .await;

        assert!(matches!(outcome, RetryOutcome::FinalFailure { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_transient() {
        let mut ledger = UsageLedger::new();
        let policy = RetryPolicy {
            timeout: Duration::from_millis(10),
            ..fast_policy(2)
        };
        let outcome: RetryOutcome<EmbeddingResponse> = call_with_retry(
            &policy,
            &CancellationToken::new(),
            "slow",
            &mut ledger,
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(embedding(1))
            },
        )
        .await;

        match outcome {
            RetryOutcome::FinalFailure { last_error, attempts } => {
                assert_eq!(attempts, 2);
                assert!(matches!(last_error, ProviderError::Timeout(_)));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(ledger.total_tokens(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_abandons_in_flight_attempt() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let mut ledger = UsageLedger::new();
        let policy = RetryPolicy {
            timeout: Duration::from_secs(10),
            ..fast_policy(3)
        };
        let started = Instant::now();
        let outcome: RetryOutcome<EmbeddingResponse> =
            call_with_retry(&policy, &cancel, "slow", &mut ledger, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(embedding(1))
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ledger.calls(), 0);
    }
}
