// Similarity Deduplication Service
// Embedding-based near-duplicate removal, first occurrence wins

use crate::models::{DedupStatus, Segment};
use crate::services::providers::{EmbeddingProvider, EmbeddingResponse, ProviderError};
use crate::services::resilience::{call_with_retry, Cancelled, RetryOutcome, RetryPolicy};
use crate::services::usage::UsageLedger;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("embedding failed for segment {index}: {source}")]
    Embedding {
        index: usize,
        #[source]
        source: ProviderError,
    },
    #[error("segment {index} has a zero or non-finite embedding")]
    DegenerateVector { index: usize },
    #[error("segment {index} embedding has {found} dims, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("embedding task for segment {0} did not complete")]
    TaskFailed(usize),
}

/// Scale `v` to unit length. `None` for zero or non-finite vectors.
pub fn normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if !norm.is_finite() || norm == 0.0 {
        return None;
    }
    Some(v.iter().map(|x| (*x as f64 / norm) as f32).collect())
}

/// Dot product; equals cosine similarity for unit vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum()
}

/// Greedy single pass: keep index `i` unless it is more similar than
/// `threshold` to an already-kept vector. Vectors must be unit length.
pub fn select_unique(unit_vectors: &[Vec<f32>], threshold: f64) -> Vec<usize> {
    let mut kept: Vec<usize> = Vec::new();
    for (i, v) in unit_vectors.iter().enumerate() {
        if kept.iter().all(|&k| dot(&unit_vectors[k], v) <= threshold) {
            kept.push(i);
        }
    }
    kept
}

/// Drop segments whose text exactly repeats an earlier one.
pub fn exact_dedup(segments: Vec<Segment>) -> (Vec<Segment>, usize) {
    let mut seen: HashSet<String> = HashSet::new();
    let before = segments.len();
    let kept: Vec<Segment> = segments
        .into_iter()
        .filter(|s| seen.insert(s.text.trim().to_string()))
        .collect();
    let removed = before - kept.len();
    (kept, removed)
}

#[derive(Debug, Clone)]
pub struct DedupReport {
    pub segments: Vec<Segment>,
    pub removed: usize,
    pub status: DedupStatus,
}

pub struct SimilarityDeduper {
    embedder: Arc<dyn EmbeddingProvider>,
    policy: RetryPolicy,
    threshold: f64,
    max_concurrency: usize,
}

impl SimilarityDeduper {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        policy: RetryPolicy,
        threshold: f64,
        max_concurrency: usize,
    ) -> Self {
        Self {
            embedder,
            policy,
            threshold,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Embed every segment, unit-normalized, in segment order.
    async fn embed_all(
        &self,
        segments: &[Segment],
        run_label: &str,
        cancel: &CancellationToken,
        ledger: &mut UsageLedger,
    ) -> Result<Result<Vec<Vec<f32>>, DedupError>, Cancelled> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set: JoinSet<(usize, RetryOutcome<EmbeddingResponse>, UsageLedger)> = JoinSet::new();

        for (idx, segment) in segments.iter().enumerate() {
            let embedder = self.embedder.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let policy = self.policy;
            let text = segment.text.clone();
            let label = format!("{} embed={}", run_label, idx);
            join_set.spawn(async move {
                let mut ledger = UsageLedger::new();
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (idx, RetryOutcome::Cancelled, ledger);
                };
                let outcome = call_with_retry(&policy, &cancel, &label, &mut ledger, || {
                    let embedder = embedder.clone();
                    let text = text.clone();
                    async move { embedder.embed(&text).await }
                })
                .await;
                (idx, outcome, ledger)
            });
        }

        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; segments.len()];
        let mut ledgers: Vec<Option<UsageLedger>> = vec![None; segments.len()];
        let mut first_error: Option<DedupError> = None;

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
            let Ok((idx, outcome, task_ledger)) = res else {
                warn!("[dedup] {} embedding task failed to join", run_label);
                continue;
            };
            ledgers[idx] = Some(task_ledger);
            match outcome {
                RetryOutcome::Success { value, .. } => vectors[idx] = Some(value.vector),
                RetryOutcome::FinalFailure { last_error, .. } => {
                    if first_error.is_none() {
                        first_error = Some(DedupError::Embedding {
                            index: idx,
                            source: last_error,
                        });
                    }
                }
                RetryOutcome::Cancelled => return Err(Cancelled),
            }
        }

        for task_ledger in ledgers.into_iter().flatten() {
            ledger.merge(task_ledger);
        }
        if let Some(err) = first_error {
            return Ok(Err(err));
        }

        let mut unit_vectors = Vec::with_capacity(vectors.len());
        let mut dims: Option<usize> = None;
        for (index, v) in vectors.into_iter().enumerate() {
            let Some(v) = v else {
                return Ok(Err(DedupError::TaskFailed(index)));
            };
            let expected = *dims.get_or_insert(v.len());
            if v.len() != expected {
                return Ok(Err(DedupError::DimensionMismatch {
                    index,
                    expected,
                    found: v.len(),
                }));
            }
            match normalize(&v) {
                Some(unit) => unit_vectors.push(unit),
                None => return Ok(Err(DedupError::DegenerateVector { index })),
            }
        }
        Ok(Ok(unit_vectors))
    }

    /// Remove near-duplicates, then exact duplicates. If embedding fails the
    /// segments come back unfiltered with a `Skipped` status.
    pub async fn dedupe(
        &self,
        segments: Vec<Segment>,
        run_label: &str,
        cancel: &CancellationToken,
        ledger: &mut UsageLedger,
    ) -> Result<DedupReport, Cancelled> {
        if segments.len() < 2 {
            return Ok(DedupReport {
                segments,
                removed: 0,
                status: DedupStatus::Applied,
            });
        }

        let unit_vectors = match self.embed_all(&segments, run_label, cancel, ledger).await? {
            Ok(v) => v,
            Err(e) => {
                warn!("[dedup] {} skipped, returning segments unfiltered: {}", run_label, e);
                return Ok(DedupReport {
                    segments,
                    removed: 0,
                    status: DedupStatus::Skipped(e.to_string()),
                });
            }
        };

        let total = segments.len();
        let keep: HashSet<usize> = select_unique(&unit_vectors, self.threshold)
            .into_iter()
            .collect();
        let similar: Vec<Segment> = segments
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .map(|(_, s)| s)
            .collect();
        let (kept, exact_removed) = exact_dedup(similar);
        let removed = total - kept.len();

        info!(
            "[dedup] {} kept {}/{} segments (exact_removed={} threshold={})",
            run_label,
            kept.len(),
            total,
            exact_removed,
            self.threshold
        );
        Ok(DedupReport {
            segments: kept,
            removed,
            status: DedupStatus::Applied,
        })
    }
}
