// Emotion Segmenter
// Classifies chunks concurrently and merges them into emotion-coherent segments

use super::fallback::{ClassificationOutcome, FallbackOrchestrator};
use crate::models::{Chunk, EmotionReading, Segment};
use crate::services::sentence_segmenter::{contains_transition_marker, join_fragments};
use crate::services::text_processor::estimate_tokens;
use crate::services::usage::UsageLedger;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("no chunk survived classification ({total} chunks, {skipped} skipped, {failed} failed)")]
    NoChunksClassified {
        total: usize,
        skipped: usize,
        failed: usize,
    },
    #[error("segmentation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct SegmenterOutcome {
    pub segments: Vec<Segment>,
    pub skipped_chunks: usize,
    pub failed_chunks: usize,
}

/// Whether `next` must start a new segment instead of extending `cur`.
pub fn merge_break(
    cur: &EmotionReading,
    next: &EmotionReading,
    chunk_text: &str,
    score_delta_threshold: f64,
) -> bool {
    let (c, n) = (cur.emotion, next.emotion);
    c != n
        || (cur.score - next.score).abs() > score_delta_threshold
        || (c.is_positive() && n.is_negative())
        || (n.is_positive() && c.is_negative())
        || (!c.is_neutral() && n.is_neutral())
        || contains_transition_marker(chunk_text)
}

enum ChunkVerdict {
    Classified(EmotionReading),
    Failed,
    Cancelled,
}

pub struct EmotionSegmenter {
    orchestrator: Arc<FallbackOrchestrator>,
    max_tokens: usize,
    max_concurrency: usize,
    score_delta_threshold: f64,
    tokenizer_model: String,
}

impl EmotionSegmenter {
    pub fn new(
        orchestrator: Arc<FallbackOrchestrator>,
        max_tokens: usize,
        max_concurrency: usize,
        score_delta_threshold: f64,
        tokenizer_model: &str,
    ) -> Self {
        Self {
            orchestrator,
            max_tokens,
            max_concurrency: max_concurrency.max(1),
            score_delta_threshold,
            tokenizer_model: tokenizer_model.to_string(),
        }
    }

    /// Classify `chunks` and merge them in chunk order.
    ///
    /// Oversized and failed chunks are skipped and counted; only a partition
    /// where no chunk is classified at all is an error.
    pub async fn segment(
        &self,
        chunks: &[Chunk],
        run_label: &str,
        cancel: &CancellationToken,
        ledger: &mut UsageLedger,
    ) -> Result<SegmenterOutcome, SegmentError> {
        let started = Instant::now();
        let mut outcome = SegmenterOutcome::default();
        let mut readings: Vec<Option<EmotionReading>> = vec![None; chunks.len()];
        let mut ledgers: Vec<Option<UsageLedger>> = vec![None; chunks.len()];

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set: JoinSet<(usize, ChunkVerdict, UsageLedger)> = JoinSet::new();
        let mut spawned = 0usize;

        for (slot, chunk) in chunks.iter().enumerate() {
            let estimate = estimate_tokens(&chunk.text, &self.tokenizer_model);
            if estimate > self.max_tokens {
                warn!(
                    "[segmenter] {} chunk={} skipped: estimate {} exceeds max_tokens {}",
                    run_label, chunk.index, estimate, self.max_tokens
                );
                outcome.skipped_chunks += 1;
                continue;
            }

            let orchestrator = self.orchestrator.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let text = chunk.text.clone();
            let chunk_label = format!("{} chunk={}", run_label, chunk.index);
            spawned += 1;

            join_set.spawn(async move {
                let mut ledger = UsageLedger::new();
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (slot, ChunkVerdict::Failed, ledger);
                };
                let verdict = match orchestrator
                    .classify(&text, &chunk_label, &cancel, &mut ledger)
                    .await
                {
                    ClassificationOutcome::Classified { reading, .. } => {
                        ChunkVerdict::Classified(reading)
                    }
                    ClassificationOutcome::Failed { last_error, path } => {
                        warn!(
                            "[segmenter] {} failed after {:?}: {}",
                            chunk_label, path, last_error
                        );
                        ChunkVerdict::Failed
                    }
                    ClassificationOutcome::Cancelled => ChunkVerdict::Cancelled,
                };
                (slot, verdict, ledger)
            });
        }

        let mut done = 0usize;
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    join_set.abort_all();
                    return Err(SegmentError::Cancelled);
                }
                joined = join_set.join_next() => joined,
            };
            let Some(res) = joined else { break };
            done += 1;
            if spawned > 0 && (done == spawned || done % 5 == 0) {
                info!(
                    "[segmenter] {} progress: {}/{} (elapsed_ms={})",
                    run_label,
                    done,
                    spawned,
                    started.elapsed().as_millis()
                );
            }

            match res {
                Ok((slot, verdict, task_ledger)) => {
                    ledgers[slot] = Some(task_ledger);
                    match verdict {
                        ChunkVerdict::Classified(reading) => readings[slot] = Some(reading),
                        ChunkVerdict::Failed => outcome.failed_chunks += 1,
                        ChunkVerdict::Cancelled => return Err(SegmentError::Cancelled),
                    }
                }
                Err(e) => {
                    warn!("[segmenter] {} classification task failed: {}", run_label, e);
                    outcome.failed_chunks += 1;
                }
            }
        }

        // Usage is folded in chunk order regardless of completion order.
        for task_ledger in ledgers.into_iter().flatten() {
            ledger.merge(task_ledger);
        }

        let mut current: Option<(String, EmotionReading)> = None;
        for (chunk, reading) in chunks.iter().zip(readings) {
            let Some(reading) = reading else { continue };
            current = match current.take() {
                None => Some((chunk.text.clone(), reading)),
                Some((text, cur)) => {
                    if merge_break(&cur, &reading, &chunk.text, self.score_delta_threshold) {
                        outcome.segments.push(Segment::raw(text, cur));
                        Some((chunk.text.clone(), reading))
                    } else {
                        Some((join_fragments(&text, &chunk.text), cur))
                    }
                }
            };
        }
        if let Some((text, reading)) = current {
            outcome.segments.push(Segment::raw(text, reading));
        }

        if outcome.segments.is_empty() {
            return Err(SegmentError::NoChunksClassified {
                total: chunks.len(),
                skipped: outcome.skipped_chunks,
                failed: outcome.failed_chunks,
            });
        }

        info!(
            "[segmenter] {} {} chunks -> {} segments (skipped={} failed={} elapsed_ms={})",
            run_label,
            chunks.len(),
            outcome.segments.len(),
            outcome.skipped_chunks,
            outcome.failed_chunks,
            started.elapsed().as_millis()
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmotionLabel;
    use crate::services::providers::mock::{MockFailure, ScriptedClassifier};
    use crate::services::resilience::RetryPolicy;
    use std::time::Duration;

    fn reading(label: EmotionLabel, score: f64) -> EmotionReading {
        EmotionReading::new(label, score)
    }

    fn chunk(index: usize, text: &str) -> Chunk {
        Chunk {
            index,
            text: text.to_string(),
            unit_count: 1,
            token_estimate: estimate_tokens(text, "gpt-3.5-turbo"),
            oversized: false,
        }
    }

    fn segmenter(classifier: ScriptedClassifier, max_tokens: usize) -> EmotionSegmenter {
        let policy = RetryPolicy {
            max_attempts: 2,
            timeout: Duration::from_millis(200),
            min_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(2),
        };
        let orch = FallbackOrchestrator::new(Arc::new(classifier), None, policy, 1, true);
        EmotionSegmenter::new(Arc::new(orch), max_tokens, 3, 0.5, "gpt-3.5-turbo")
    }

    #[test]
    fn test_merge_break_rules() {
        let joy3 = reading(EmotionLabel::Joy, 3.0);
        assert!(!merge_break(&joy3, &reading(EmotionLabel::Joy, 3.0), "我们出发吧。", 0.5));
        assert!(!merge_break(&joy3, &reading(EmotionLabel::Joy, 3.5), "我们出发吧。", 0.5));
        // score delta
        assert!(merge_break(&joy3, &reading(EmotionLabel::Joy, 4.0), "我们出发吧。", 0.5));
        // label change / polarity crossing
        assert!(merge_break(&joy3, &reading(EmotionLabel::Worry, 3.0), "我们出发吧。", 0.5));
        // positive into neutral
        assert!(merge_break(&joy3, &reading(EmotionLabel::Calm, 3.0), "我们出发吧。", 0.5));
        // transition marker in the incoming chunk
        assert!(merge_break(&joy3, &reading(EmotionLabel::Joy, 3.0), "不过我们出发吧。", 0.5));
    }

    #[tokio::test]
    async fn test_consecutive_equal_emotions_merge() {
        let classifier = ScriptedClassifier::keywords(
            "primary",
            &[("开心", EmotionLabel::Joy, 3.0), ("忧虑", EmotionLabel::Worry, 3.0)],
            (EmotionLabel::Joy, 3.0),
        );
        let seg = segmenter(classifier, 16000);
        let chunks = vec![
            chunk(0, "今天真是太开心了！"),
            chunk(1, "阳光明媚心情好。"),
            chunk(2, "但是想到前方的困难，我心里也充满忧虑。"),
        ];
        let mut ledger = UsageLedger::new();

        let out = seg
            .segment(&chunks, "run=test", &CancellationToken::new(), &mut ledger)
            .await
            .unwrap();

        assert_eq!(out.segments.len(), 2);
        assert_eq!(out.segments[0].text, "今天真是太开心了！阳光明媚心情好。");
        assert_eq!(out.segments[0].emotion.emotion, EmotionLabel::Joy);
        assert_eq!(out.segments[1].emotion.emotion, EmotionLabel::Worry);
        assert!(out.segments[1].text.starts_with("但是"));
        assert_eq!(ledger.calls(), 3);
    }

    #[tokio::test]
    async fn test_segments_follow_chunk_order_when_replies_arrive_reversed() {
        let classifier = ScriptedClassifier::keywords(
            "primary",
            &[("晴朗", EmotionLabel::Joy, 3.0), ("担心", EmotionLabel::Worry, 3.0)],
            (EmotionLabel::Calm, 1.0),
        )
        .with_delay(|text| match text.chars().next() {
            Some('一') => Duration::from_millis(90),
            Some('二') => Duration::from_millis(45),
            _ => Duration::ZERO,
        });
        let seg = segmenter(classifier, 16000);
        let chunks = vec![
            chunk(0, "一早天气晴朗。"),
            chunk(1, "二来又有些担心。"),
            chunk(2, "三是天色晴朗如初。"),
        ];
        let mut ledger = UsageLedger::new();

        let out = seg
            .segment(&chunks, "run=test", &CancellationToken::new(), &mut ledger)
            .await
            .unwrap();

        let texts: Vec<&str> = out.segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["一早天气晴朗。", "二来又有些担心。", "三是天色晴朗如初。"]);
        let labels: Vec<EmotionLabel> = out.segments.iter().map(|s| s.emotion.emotion).collect();
        assert_eq!(labels, vec![EmotionLabel::Joy, EmotionLabel::Worry, EmotionLabel::Joy]);
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_skipped_not_fatal() {
        let classifier = ScriptedClassifier::constant("primary", "满意", 2.0);
        let seg = segmenter(classifier, 20);
        let long = "长".repeat(40);
        let chunks = vec![chunk(0, "结果令人满意。"), chunk(1, &long), chunk(2, "一切都很顺利。")];
        let mut ledger = UsageLedger::new();

        let out = seg
            .segment(&chunks, "run=test", &CancellationToken::new(), &mut ledger)
            .await
            .unwrap();

        assert_eq!(out.skipped_chunks, 1);
        assert_eq!(out.segments.len(), 1);
        assert!(!out.segments[0].text.contains(&long));
        assert_eq!(ledger.calls(), 2);
    }

    #[tokio::test]
    async fn test_all_chunks_failing_is_an_error() {
        let classifier = ScriptedClassifier::failing("primary", MockFailure::Unauthorized);
        let seg = segmenter(classifier, 16000);
        let chunks = vec![chunk(0, "第一段文字内容。"), chunk(1, "第二段文字内容。")];
        let mut ledger = UsageLedger::new();

        let err = seg
            .segment(&chunks, "run=test", &CancellationToken::new(), &mut ledger)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SegmentError::NoChunksClassified {
                total: 2,
                skipped: 0,
                failed: 2
            }
        );
        assert_eq!(ledger.failed_calls(), 2);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let classifier = ScriptedClassifier::constant("primary", "喜悦", 3.0);
        let seg = segmenter(classifier, 16000);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut ledger = UsageLedger::new();

        let err = seg
            .segment(&[chunk(0, "今天真是太开心了！")], "run=test", &cancel, &mut ledger)
            .await
            .unwrap_err();
        assert_eq!(err, SegmentError::Cancelled);
    }
}
