// Provider Fallback Orchestrator
// Explicit state machine: primary → secondary → bounded primary retry

use super::validate_reading;
use crate::models::EmotionReading;
use crate::services::providers::{ClassifierResponse, EmotionClassifier, ProviderError};
use crate::services::resilience::{call_with_retry, RetryOutcome, RetryPolicy};
use crate::services::usage::UsageLedger;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Hard ceiling on fallback cycles.
pub const MAX_FALLBACK_CYCLES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackState {
    TryPrimary,
    TrySecondary { cycle: u32 },
    RetryPrimaryBounded { cycle: u32 },
    Done,
    Failed,
}

#[derive(Debug)]
pub enum ClassificationOutcome {
    Classified {
        reading: EmotionReading,
        provider: String,
        /// Every state visited, ending in `Done`.
        path: Vec<FallbackState>,
    },
    Failed {
        last_error: ProviderError,
        path: Vec<FallbackState>,
    },
    Cancelled,
}

/// Drives classification across two providers. Holds no per-call state, so
/// one instance is shared by every chunk task; each `classify` call walks its
/// own state machine.
pub struct FallbackOrchestrator {
    primary: Arc<dyn EmotionClassifier>,
    secondary: Option<Arc<dyn EmotionClassifier>>,
    policy: RetryPolicy,
    max_cycles: u32,
    strict_labels: bool,
}

impl FallbackOrchestrator {
    pub fn new(
        primary: Arc<dyn EmotionClassifier>,
        secondary: Option<Arc<dyn EmotionClassifier>>,
        policy: RetryPolicy,
        max_cycles: u32,
        strict_labels: bool,
    ) -> Self {
        Self {
            primary,
            secondary,
            policy,
            max_cycles: max_cycles.clamp(1, MAX_FALLBACK_CYCLES),
            strict_labels,
        }
    }

    pub fn max_cycles(&self) -> u32 {
        self.max_cycles
    }

    /// Next state after the provider of `state` exhausted its attempts.
    /// Cycles count primary visits.
    fn on_exhausted(&self, state: FallbackState) -> FallbackState {
        let next_primary = |cycle: u32| {
            if cycle < self.max_cycles {
                FallbackState::RetryPrimaryBounded { cycle: cycle + 1 }
            } else {
                FallbackState::Failed
            }
        };

        match state {
            FallbackState::TryPrimary => match self.secondary {
                Some(_) => FallbackState::TrySecondary { cycle: 1 },
                None => next_primary(1),
            },
            FallbackState::TrySecondary { cycle } => next_primary(cycle),
            FallbackState::RetryPrimaryBounded { cycle } => {
                if cycle >= self.max_cycles {
                    FallbackState::Failed
                } else {
                    match self.secondary {
                        Some(_) => FallbackState::TrySecondary { cycle },
                        None => next_primary(cycle),
                    }
                }
            }
            FallbackState::Done | FallbackState::Failed => state,
        }
    }

    fn provider_for(&self, state: FallbackState) -> Option<&Arc<dyn EmotionClassifier>> {
        match state {
            FallbackState::TryPrimary | FallbackState::RetryPrimaryBounded { .. } => {
                Some(&self.primary)
            }
            FallbackState::TrySecondary { .. } => self.secondary.as_ref(),
            FallbackState::Done | FallbackState::Failed => None,
        }
    }

    /// Classify one text. Usage of every attempt lands in `ledger`.
    pub async fn classify(
        &self,
        text: &str,
        chunk_label: &str,
        cancel: &CancellationToken,
        ledger: &mut UsageLedger,
    ) -> ClassificationOutcome {
        let mut state = FallbackState::TryPrimary;
        let mut path = vec![state];
        let mut last_error: Option<ProviderError> = None;
        let strict = self.strict_labels;

        while let Some(provider) = self.provider_for(state) {
            let op_label = format!("{} provider={}", chunk_label, provider.name());
            let outcome = call_with_retry(&self.policy, cancel, &op_label, ledger, || {
                let provider = provider.clone();
                async move {
                    let response = provider.analyze(text).await?;
                    validated(response, strict)
                }
            })
            .await;

            match outcome {
                RetryOutcome::Success { value, attempts } => {
                    path.push(FallbackState::Done);
                    if path.len() > 2 || attempts > 1 {
                        info!(
                            "[fallback] {} classified via {} attempts={} path={:?}",
                            chunk_label,
                            provider.name(),
                            attempts,
                            path
                        );
                    }
                    return ClassificationOutcome::Classified {
                        reading: value.0,
                        provider: provider.name().to_string(),
                        path,
                    };
                }
                RetryOutcome::FinalFailure { last_error: e, attempts } => {
                    let next = self.on_exhausted(state);
                    warn!(
                        "[fallback] {} provider={} exhausted after {} attempts ({}), {:?} -> {:?}",
                        chunk_label,
                        provider.name(),
                        attempts,
                        e,
                        state,
                        next
                    );
                    last_error = Some(e);
                    state = next;
                    path.push(state);
                }
                RetryOutcome::Cancelled => return ClassificationOutcome::Cancelled,
            }
        }

        ClassificationOutcome::Failed {
            last_error: last_error
                .unwrap_or_else(|| ProviderError::MissingApiKey("classifier".to_string())),
            path,
        }
    }
}

/// Classifier response after the label/score contract check.
struct Validated(EmotionReading, ClassifierResponse);

impl crate::services::resilience::Metered for Validated {
    fn usage(&self) -> &crate::models::ProviderUsage {
        &self.1.usage
    }
}

fn validated(response: ClassifierResponse, strict: bool) -> Result<Validated, ProviderError> {
    match validate_reading(&response, strict) {
        Ok(reading) => Ok(Validated(reading, response)),
        Err(violation) => {
            warn!(
                "[fallback] contract violation from classifier: {} (label={:?} score={})",
                violation, response.label, response.score
            );
            Err(ProviderError::contract(violation, Some(response.usage)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmotionLabel;
    use crate::services::providers::mock::{ClassifierStep, MockFailure, ScriptedClassifier};
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            timeout: Duration::from_millis(200),
            min_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(2),
        }
    }

    fn orchestrator(
        primary: Arc<ScriptedClassifier>,
        secondary: Option<Arc<ScriptedClassifier>>,
        cycles: u32,
    ) -> FallbackOrchestrator {
        FallbackOrchestrator::new(
            primary,
            secondary.map(|s| s as Arc<dyn EmotionClassifier>),
            policy(),
            cycles,
            true,
        )
    }

    #[tokio::test]
    async fn test_primary_success_needs_no_fallback() {
        let primary = Arc::new(ScriptedClassifier::constant("primary", "喜悦", 3.0));
        let secondary = Arc::new(ScriptedClassifier::constant("secondary", "悲伤", 2.0));
        let orch = orchestrator(primary.clone(), Some(secondary.clone()), 2);
        let mut ledger = UsageLedger::new();

        let outcome = orch
            .classify("今天真是太开心了！", "chunk=0", &CancellationToken::new(), &mut ledger)
            .await;

        match outcome {
            ClassificationOutcome::Classified { reading, provider, path } => {
                assert_eq!(reading.emotion, EmotionLabel::Joy);
                assert_eq!(provider, "primary");
                assert_eq!(path, vec![FallbackState::TryPrimary, FallbackState::Done]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_label_switches_to_secondary_without_retry() {
        let primary = Arc::new(ScriptedClassifier::constant("primary", "unknown", 1.0));
        let secondary = Arc::new(ScriptedClassifier::constant("secondary", "忧虑", 3.0));
        let orch = orchestrator(primary.clone(), Some(secondary.clone()), 2);
        let mut ledger = UsageLedger::new();

        let outcome = orch
            .classify("我心里充满忧虑。", "chunk=0", &CancellationToken::new(), &mut ledger)
            .await;

        match outcome {
            ClassificationOutcome::Classified { reading, provider, path } => {
                assert_eq!(reading.emotion, EmotionLabel::Worry);
                assert_eq!(provider, "secondary");
                assert_eq!(path[1], FallbackState::TrySecondary { cycle: 1 });
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        // Contract violations are never retried on the same provider.
        assert_eq!(primary.calls(), 1);
        // The rejected response was still billed.
        assert_eq!(ledger.failed_calls(), 1);
        assert!(ledger.total_tokens() > 0);
    }

    #[tokio::test]
    async fn test_bounded_cycles_end_in_failed() {
        let primary = Arc::new(ScriptedClassifier::failing("primary", MockFailure::ServerError));
        let secondary = Arc::new(ScriptedClassifier::failing("secondary", MockFailure::RateLimited));
        let orch = orchestrator(primary.clone(), Some(secondary.clone()), 2);
        let mut ledger = UsageLedger::new();

        let outcome = orch
            .classify("测试文本内容。", "chunk=0", &CancellationToken::new(), &mut ledger)
            .await;

        match outcome {
            ClassificationOutcome::Failed { path, .. } => {
                assert_eq!(
                    path,
                    vec![
                        FallbackState::TryPrimary,
                        FallbackState::TrySecondary { cycle: 1 },
                        FallbackState::RetryPrimaryBounded { cycle: 2 },
                        FallbackState::Failed,
                    ]
                );
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        // Two primary visits and one secondary visit, two attempts each.
        assert_eq!(primary.calls(), 4);
        assert_eq!(secondary.calls(), 2);
        assert_eq!(ledger.failed_calls(), 6);
    }

    #[tokio::test]
    async fn test_recovers_on_bounded_primary_retry() {
        let primary = Arc::new(
            ScriptedClassifier::constant("primary", "期待", 2.0)
                .then(ClassifierStep::Fail(MockFailure::Unauthorized)),
        );
        let secondary = Arc::new(ScriptedClassifier::constant("secondary", "未知", 0.0));
        let orch = orchestrator(primary.clone(), Some(secondary), 2);
        let mut ledger = UsageLedger::new();

        let outcome = orch
            .classify("明天会更好。", "chunk=0", &CancellationToken::new(), &mut ledger)
            .await;

        match outcome {
            ClassificationOutcome::Classified { reading, path, .. } => {
                assert_eq!(reading.emotion, EmotionLabel::Anticipation);
                assert_eq!(path[2], FallbackState::RetryPrimaryBounded { cycle: 2 });
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_without_secondary_single_cycle_fails_fast() {
        let primary = Arc::new(ScriptedClassifier::failing("primary", MockFailure::Unauthorized));
        let orch = orchestrator(primary.clone(), None, 1);
        let mut ledger = UsageLedger::new();

        let outcome = orch
            .classify("测试文本内容。", "chunk=0", &CancellationToken::new(), &mut ledger)
            .await;

        assert!(matches!(outcome, ClassificationOutcome::Failed { .. }));
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let primary = Arc::new(ScriptedClassifier::constant("primary", "喜悦", 3.0));
        let orch = orchestrator(primary.clone(), None, 2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut ledger = UsageLedger::new();

        let outcome = orch.classify("测试文本内容。", "chunk=0", &cancel, &mut ledger).await;
        assert!(matches!(outcome, ClassificationOutcome::Cancelled));
        assert_eq!(primary.calls(), 0);
    }
}
