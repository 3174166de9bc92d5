// Pipeline Coordinator
// Validate → normalize → split → chunk → classify/merge → rewrite → dedup → account

use crate::models::{
    DedupStatus, ProcessingResult, ProcessingStatus, ProcessingSummary, Segment,
};
use crate::services::config_store::{AppConfig, ConfigError, PipelineConfig};
use crate::services::deduplication::SimilarityDeduper;
use crate::services::emotion::{EmotionSegmenter, FallbackOrchestrator, SegmentError};
use crate::services::history_logger::HistoryLogger;
use crate::services::providers::ProviderSet;
use crate::services::resilience::RetryPolicy;
use crate::services::rewriter::SegmentRewriter;
use crate::services::sentence_segmenter::{assemble_chunks, split_sentences};
use crate::services::text_processor::{
    self, decode_input, normalize_text, partition_on_hard_marker, validate_input, ValidationError,
};
use crate::services::usage::{RateTable, UsageLedger};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("no usable segments: {0}")]
    NoUsableSegments(String),
    #[error("processing cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Default)]
struct Degradations {
    skipped_chunks: usize,
    failed_chunks: usize,
    failed_partitions: usize,
}

/// Runs the whole pipeline. Configuration and providers are shared read-only;
/// every `process` call owns its ledger and retry state.
pub struct PipelineCoordinator {
    config: Arc<PipelineConfig>,
    segmenter: EmotionSegmenter,
    rewriter: SegmentRewriter,
    deduper: SimilarityDeduper,
    rates: Arc<RateTable>,
    history: Option<HistoryLogger>,
}

impl PipelineCoordinator {
    pub fn new(config: PipelineConfig, providers: ProviderSet) -> Result<Self, PipelineError> {
        config.validate()?;
        let config = Arc::new(config);
        let policy = RetryPolicy::from_config(&config);

        let orchestrator = Arc::new(FallbackOrchestrator::new(
            providers.primary,
            providers.secondary,
            policy,
            config.fallback_cycles(),
            config.strict_labels,
        ));
        let segmenter = EmotionSegmenter::new(
            orchestrator,
            config.max_tokens,
            config.max_concurrency,
            config.score_delta_threshold,
            &config.tokenizer_model,
        );
        let rewriter = SegmentRewriter::new(providers.rewriter, policy, config.max_concurrency);
        let deduper = SimilarityDeduper::new(
            providers.embedder,
            policy,
            config.similarity_threshold,
            config.max_concurrency,
        );

        Ok(Self {
            config,
            segmenter,
            rewriter,
            deduper,
            rates: Arc::new(RateTable::default()),
            history: None,
        })
    }

    /// Build from a full application config: rate overrides and history
    /// settings included.
    pub fn from_app_config(app: &AppConfig, providers: ProviderSet) -> Result<Self, PipelineError> {
        let mut coordinator =
            Self::new(app.pipeline.clone(), providers)?.with_rates(RateTable::with_overrides(&app.rates));
        if app.history.enabled {
            match app.history.resolve_dir() {
                Some(dir) => coordinator = coordinator.with_history(HistoryLogger::new(dir)),
                None => warn!("[history] no data dir available, history disabled"),
            }
        }
        Ok(coordinator)
    }

    pub fn with_rates(mut self, rates: RateTable) -> Self {
        self.rates = Arc::new(rates);
        self
    }

    pub fn with_history(mut self, logger: HistoryLogger) -> Self {
        self.history = Some(logger);
        self
    }

    pub fn without_history(mut self) -> Self {
        self.history = None;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Token estimate for `text` under `model_id`'s tokenizer.
    pub fn estimate_tokens(&self, text: &str, model_id: &str) -> usize {
        text_processor::estimate_tokens(text, model_id)
    }

    pub async fn process(&self, raw_text: &str) -> Result<ProcessingResult, PipelineError> {
        self.process_with_cancel(raw_text, CancellationToken::new()).await
    }

    /// Entry point for undecoded input; invalid UTF-8 is a validation error.
    pub async fn process_bytes(&self, bytes: &[u8]) -> Result<ProcessingResult, PipelineError> {
        let text = decode_input(bytes)?;
        self.process(text).await
    }

    pub async fn process_with_cancel_bytes(
        &self,
        bytes: &[u8],
        cancel: CancellationToken,
    ) -> Result<ProcessingResult, PipelineError> {
        let text = decode_input(bytes)?;
        self.process_with_cancel(text, cancel).await
    }

    /// Process `raw_text`, abandoning all outstanding provider calls once
    /// `cancel` fires. A cancelled run returns `Cancelled` and writes no history.
    pub async fn process_with_cancel(
        &self,
        raw_text: &str,
        cancel: CancellationToken,
    ) -> Result<ProcessingResult, PipelineError> {
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let run_label = format!("run={}", &run_id[..8]);

        validate_input(raw_text, self.config.min_input_chars)?;
        let normalized = normalize_text(raw_text);
        let partitions = partition_on_hard_marker(&normalized);
        info!(
            "[pipeline] {} start chars={} partitions={}",
            run_label,
            raw_text.chars().count(),
            partitions.len()
        );

        let mut ledger = UsageLedger::new();
        let mut degradations = Degradations::default();
        let mut segments: Vec<Segment> = Vec::new();

        for (p_idx, partition) in partitions.iter().enumerate() {
            let units = split_sentences(partition);
            let chunks = assemble_chunks(&units, self.config.chunk_size, &self.config.tokenizer_model);
            let part_label = format!("{} part={}", run_label, p_idx);
            if chunks.is_empty() {
                warn!("[pipeline] {} has no usable sentence units", part_label);
                degradations.failed_partitions += 1;
                continue;
            }

            match self
                .segmenter
                .segment(&chunks, &part_label, &cancel, &mut ledger)
                .await
            {
                Ok(out) => {
                    degradations.skipped_chunks += out.skipped_chunks;
                    degradations.failed_chunks += out.failed_chunks;
                    segments.extend(out.segments);
                }
                Err(SegmentError::NoChunksClassified { total, skipped, failed }) => {
                    warn!(
                        "[pipeline] {} produced no segments ({} chunks, {} skipped, {} failed)",
                        part_label, total, skipped, failed
                    );
                    degradations.skipped_chunks += skipped;
                    degradations.failed_chunks += failed;
                    degradations.failed_partitions += 1;
                }
                Err(SegmentError::Cancelled) => return Err(self.cancelled(&run_label)),
            }
        }

        if segments.is_empty() {
            return Err(PipelineError::NoUsableSegments(format!(
                "{} partitions failed, {} chunks skipped, {} chunks failed",
                degradations.failed_partitions, degradations.skipped_chunks, degradations.failed_chunks
            )));
        }

        let rewritten = self
            .rewriter
            .rewrite_all(segments, &run_label, &cancel, &mut ledger)
            .await
            .map_err(|_| self.cancelled(&run_label))?;

        let dedup = self
            .deduper
            .dedupe(rewritten.segments, &run_label, &cancel, &mut ledger)
            .await
            .map_err(|_| self.cancelled(&run_label))?;

        if cancel.is_cancelled() {
            return Err(self.cancelled(&run_label));
        }

        let usage = ledger.finish(&self.rates);
        let degraded = degradations.skipped_chunks > 0
            || degradations.failed_chunks > 0
            || degradations.failed_partitions > 0
            || rewritten.fallbacks > 0
            || matches!(dedup.status, DedupStatus::Skipped(_));

        let summary = ProcessingSummary {
            run_id,
            original_length: raw_text.chars().count(),
            processed_length: dedup.segments.iter().map(|s| s.text.chars().count()).sum(),
            segment_count: dedup.segments.len(),
            had_duplicates: dedup.removed > 0,
            status: if degraded {
                ProcessingStatus::Degraded
            } else {
                ProcessingStatus::Complete
            },
            dedup: dedup.status,
            skipped_chunks: degradations.skipped_chunks,
            failed_chunks: degradations.failed_chunks,
            failed_partitions: degradations.failed_partitions,
            rewrite_fallbacks: rewritten.fallbacks,
        };

        let mut result = ProcessingResult {
            segments: dedup.segments,
            usage,
            summary,
            log_files: None,
        };

        if let Some(logger) = &self.history {
            match logger.log_run(raw_text, &result) {
                Ok(files) => result.log_files = Some(files),
                Err(e) => warn!("[history] {} failed to write run history: {}", run_label, e),
            }
        }

        info!(
            "[pipeline] {} done segments={} tokens={} cost={} status={:?} elapsed_ms={}",
            run_label,
            result.summary.segment_count,
            result.usage.total_tokens,
            result.usage.cost_estimate,
            result.summary.status,
            started.elapsed().as_millis()
        );
        Ok(result)
    }

    fn cancelled(&self, run_label: &str) -> PipelineError {
        info!("[pipeline] {} cancelled", run_label);
        PipelineError::Cancelled
    }
}
