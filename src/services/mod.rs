// Speech Processor Services
// Pipeline stages, providers and supporting infrastructure

pub mod text_processor;
pub mod sentence_segmenter;
pub mod resilience;
pub mod providers;
pub mod emotion;
pub mod scripture;
pub mod rewriter;
pub mod deduplication;
pub mod usage;
pub mod history_logger;
pub mod config_store;
pub mod pipeline;

pub use config_store::{AppConfig, ConfigError, ConfigStore, PipelineConfig};
pub use pipeline::{PipelineCoordinator, PipelineError};
pub use providers::{
    EmbeddingProvider, EmotionClassifier, ProviderError, ProviderSet, TextRewriter,
};
pub use text_processor::{estimate_tokens, normalize_text, ValidationError};
