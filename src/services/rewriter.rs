// Text Rewriter Boundary
// Detect scripture references, rewrite, then verify the references survived

use crate::models::Segment;
use crate::services::providers::{ContractViolation, ProviderError, RewriteResponse, TextRewriter};
use crate::services::resilience::{call_with_retry, Cancelled, RetryOutcome, RetryPolicy};
use crate::services::scripture::find_references;
use crate::services::usage::UsageLedger;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Change description meaning "nothing was changed".
pub const NO_CHANGES: &str = "无需修改";

#[derive(Debug, Clone, Default)]
pub struct RewriteBatch {
    pub segments: Vec<Segment>,
    /// Segments that kept their original text after a failed or rejected rewrite.
    pub fallbacks: usize,
}

/// Split a change description into list items. `无需修改` and blank
/// descriptions yield no items.
pub fn parse_changes(description: &str) -> Vec<String> {
    let trimmed = description.trim();
    if trimmed.is_empty() || trimmed == NO_CHANGES {
        return Vec::new();
    }
    trimmed
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| {
                    c.is_ascii_digit() || matches!(c, '-' | '*' | '•' | '.' | '、' | ')' | '）')
                })
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty() && line != NO_CHANGES)
        .collect()
}

/// First reference from `references` missing in `rewritten`.
pub fn dropped_reference<'a>(references: &'a [String], rewritten: &str) -> Option<&'a String> {
    references.iter().find(|r| !rewritten.contains(r.as_str()))
}

#[derive(Clone)]
pub struct SegmentRewriter {
    rewriter: Arc<dyn TextRewriter>,
    policy: RetryPolicy,
    max_concurrency: usize,
}

impl SegmentRewriter {
    pub fn new(rewriter: Arc<dyn TextRewriter>, policy: RetryPolicy, max_concurrency: usize) -> Self {
        Self {
            rewriter,
            policy,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Enrich one segment. Returns the segment and whether it fell back to the
    /// original text, or `Err(Cancelled)`.
    pub async fn rewrite_segment(
        &self,
        mut segment: Segment,
        label: &str,
        cancel: &CancellationToken,
        ledger: &mut UsageLedger,
    ) -> Result<(Segment, bool), Cancelled> {
        // Detection runs on the unmodified text.
        let references = find_references(&segment.text);
        segment.biblical_references = references.clone();

        let rewriter = self.rewriter.clone();
        let text = segment.text.clone();
        let emotion = segment.emotion;
        let outcome = call_with_retry(&self.policy, cancel, label, ledger, || {
            let rewriter = rewriter.clone();
            let text = text.clone();
            let references = references.clone();
            async move {
                let response = rewriter.improve(&text, emotion.emotion, emotion.score).await?;
                check_rewrite(response, &references)
            }
        })
        .await;

        match outcome {
            RetryOutcome::Success { value, .. } => {
                segment.changes = parse_changes(&value.changes_description);
                segment.text = value.improved_text;
                Ok((segment, false))
            }
            RetryOutcome::FinalFailure { last_error, attempts } => {
                warn!(
                    "[rewriter] {} keeping original text after {} attempts: {}",
                    label, attempts, last_error
                );
                segment.changes.clear();
                segment
                    .notes
                    .push(format!("rewrite_fallback: {}", describe_failure(&last_error)));
                Ok((segment, true))
            }
            RetryOutcome::Cancelled => Err(Cancelled),
        }
    }

    /// Rewrite every segment concurrently; output order equals input order.
    pub async fn rewrite_all(
        &self,
        segments: Vec<Segment>,
        run_label: &str,
        cancel: &CancellationToken,
        ledger: &mut UsageLedger,
    ) -> Result<RewriteBatch, Cancelled> {
        let total = segments.len();
        let mut slots: Vec<Option<(Segment, bool)>> = vec![None; total];
        let mut ledgers: Vec<Option<UsageLedger>> = vec![None; total];
        let originals = segments.clone();

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set: JoinSet<(usize, Result<(Segment, bool), Cancelled>, UsageLedger)> =
            JoinSet::new();

        for (idx, segment) in segments.into_iter().enumerate() {
            let worker = self.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let label = format!("{} segment={}", run_label, idx);
            join_set.spawn(async move {
                let mut ledger = UsageLedger::new();
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (idx, Err(Cancelled), ledger);
                };
                let res = worker.rewrite_segment(segment, &label, &cancel, &mut ledger).await;
                (idx, res, ledger)
            });
        }

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(Cancelled);
                }
                joined = join_set.join_next() => joined,
            };
            let Some(res) = joined else { break };
            match res {
                Ok((idx, Ok(done), task_ledger)) => {
                    slots[idx] = Some(done);
                    ledgers[idx] = Some(task_ledger);
                }
                Ok((_, Err(Cancelled), _)) => return Err(Cancelled),
                Err(e) => warn!("[rewriter] {} rewrite task failed: {}", run_label, e),
            }
        }

        for task_ledger in ledgers.into_iter().flatten() {
            ledger.merge(task_ledger);
        }

        let mut batch = RewriteBatch::default();
        for (slot, original) in slots.into_iter().zip(originals) {
            match slot {
                Some((segment, fell_back)) => {
                    if fell_back {
                        batch.fallbacks += 1;
                    }
                    batch.segments.push(segment);
                }
                // Task panicked: keep the unmodified segment.
                None => {
                    let mut segment = original;
                    segment.biblical_references = find_references(&segment.text);
                    segment.notes.push("rewrite_fallback: task aborted".to_string());
                    batch.fallbacks += 1;
                    batch.segments.push(segment);
                }
            }
        }

        info!(
            "[rewriter] {} rewrote {} segments (fallbacks={})",
            run_label, total, batch.fallbacks
        );
        Ok(batch)
    }
}

/// Reject rewrites that are empty or lost a detected reference.
fn check_rewrite(
    response: RewriteResponse,
    references: &[String],
) -> Result<RewriteResponse, ProviderError> {
    let violation = if response.improved_text.trim().is_empty() {
        ContractViolation::MalformedPayload("empty improved_text".to_string())
    } else if let Some(missing) = dropped_reference(references, &response.improved_text) {
        ContractViolation::ReferenceDropped(missing.clone())
    } else {
        return Ok(response);
    };
    Err(ProviderError::contract(violation, Some(response.usage)))
}

fn describe_failure(err: &ProviderError) -> String {
    match err {
        ProviderError::Contract { violation, .. } => violation.to_string(),
        other => other.to_string(),
    }
}
