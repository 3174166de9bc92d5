use speech_processor_lib::models::{DedupStatus, EmotionLabel, ProcessingStatus};
use speech_processor_lib::services::config_store::PipelineConfig;
use speech_processor_lib::services::history_logger::HistoryLogger;
use speech_processor_lib::services::providers::mock::{
    ClassifierStep, MapEmbedder, MockFailure, ScriptedClassifier, ScriptedRewriter,
};
use speech_processor_lib::services::providers::{EmotionClassifier, ProviderSet};
use speech_processor_lib::services::text_processor::ValidationError;
use speech_processor_lib::{PipelineCoordinator, PipelineError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const JOY_THEN_WORRY: &str = "今天真是太开心了！但是想到前方的困难，我心里也充满忧虑。";
const SCRIPTURE: &str = "应当一无挂虑，只要凡事借着祷告和祈求，将你们所要的告诉神（腓立比书4:6）。";

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        min_retry_wait: 0.001,
        max_retry_wait: 0.002,
        request_timeout: 1.0,
        ..PipelineConfig::default()
    }
}

fn keyword_classifier(name: &str) -> ScriptedClassifier {
    ScriptedClassifier::keywords(
        name,
        &[
            ("开心", EmotionLabel::Joy, 4.0),
            ("忧虑", EmotionLabel::Worry, 3.0),
            ("挂虑", EmotionLabel::Anticipation, 3.0),
        ],
        (EmotionLabel::Satisfaction, 2.0),
    )
}

fn providers_with(
    primary: ScriptedClassifier,
    secondary: Option<ScriptedClassifier>,
    rewriter: ScriptedRewriter,
    embedder: MapEmbedder,
) -> ProviderSet {
    ProviderSet {
        primary: Arc::new(primary),
        secondary: secondary.map(|s| Arc::new(s) as Arc<dyn EmotionClassifier>),
        rewriter: Arc::new(rewriter),
        embedder: Arc::new(embedder),
    }
}

fn default_providers() -> ProviderSet {
    providers_with(
        keyword_classifier("primary"),
        None,
        ScriptedRewriter::echo(),
        MapEmbedder::new(),
    )
}

#[tokio::test]
async fn test_hard_transition_yields_joy_then_worry() {
    let pipeline = PipelineCoordinator::new(fast_config(), default_providers()).unwrap();
    let result = pipeline.process(JOY_THEN_WORRY).await.unwrap();

    assert_eq!(result.segments.len(), 2);
    assert_eq!(result.segments[0].emotion.emotion, EmotionLabel::Joy);
    assert_eq!(result.segments[1].emotion.emotion, EmotionLabel::Worry);
    assert!(result.segments[1].text.starts_with("但是"));
    assert_eq!(result.summary.status, ProcessingStatus::Complete);
    assert_eq!(result.summary.dedup, DedupStatus::Applied);
    assert!(!result.summary.had_duplicates);
}

#[tokio::test]
async fn test_short_input_never_reaches_providers() {
    let classifier = Arc::new(keyword_classifier("primary"));
    let providers = ProviderSet {
        primary: classifier.clone(),
        ..default_providers()
    };
    let pipeline = PipelineCoordinator::new(fast_config(), providers).unwrap();

    let err = pipeline.process("今天很开心").await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Validation(ValidationError::TooShort { len: 5, .. })
    ));
    assert_eq!(classifier.calls(), 0);
}

#[tokio::test]
async fn test_near_duplicate_segments_keep_first() {
    let embedder = MapEmbedder::new()
        .with_vector("我们今天很开心。", vec![1.0, 0.0, 0.0])
        .with_vector("但是我们今天非常开心。", vec![0.95, 0.312_25, 0.0]);
    let providers = providers_with(
        keyword_classifier("primary"),
        None,
        ScriptedRewriter::echo(),
        embedder,
    );
    let pipeline = PipelineCoordinator::new(fast_config(), providers).unwrap();

    let result = pipeline
        .process("我们今天很开心。但是我们今天非常开心。")
        .await
        .unwrap();

    assert_eq!(result.segments.len(), 1);
    assert_eq!(result.segments[0].text, "我们今天很开心。");
    assert!(result.summary.had_duplicates);
    assert_eq!(result.summary.segment_count, 1);
}

#[tokio::test]
async fn test_unknown_label_falls_back_to_secondary() {
    let primary = Arc::new(ScriptedClassifier::constant("primary", "unknown", 3.0));
    let secondary = Arc::new(keyword_classifier("secondary"));
    let providers = ProviderSet {
        primary: primary.clone(),
        secondary: Some(secondary.clone() as Arc<dyn EmotionClassifier>),
        ..default_providers()
    };
    let pipeline = PipelineCoordinator::new(fast_config(), providers).unwrap();

    let result = pipeline.process("今天真是太开心了，一切都很顺利！").await.unwrap();

    assert_eq!(result.segments.len(), 1);
    assert_eq!(result.segments[0].emotion.emotion, EmotionLabel::Joy);
    // A contract violation is not retried on the same provider.
    assert_eq!(primary.calls(), 1);
    assert_eq!(secondary.calls(), 1);
    assert!(result.usage.failed_calls >= 1);
}

#[tokio::test]
async fn test_queued_unknown_then_valid_reply_from_primary() {
    let primary = ScriptedClassifier::constant("primary", "喜悦", 4.0)
        .then(ClassifierStep::reply("none", 2.0));
    let providers = providers_with(primary, None, ScriptedRewriter::echo(), MapEmbedder::new());
    let pipeline = PipelineCoordinator::new(fast_config(), providers).unwrap();

    // No secondary: the bounded primary retry picks up the second answer.
    let result = pipeline.process("今天真是太开心了，一切都很顺利！").await.unwrap();
    assert_eq!(result.segments[0].emotion.emotion, EmotionLabel::Joy);
}

#[tokio::test]
async fn test_scripture_reference_survives_rewrite() {
    let providers = providers_with(
        keyword_classifier("primary"),
        None,
        ScriptedRewriter::transform(|t| t.replace("应当", "你们应当")),
        MapEmbedder::new(),
    );
    let pipeline = PipelineCoordinator::new(fast_config(), providers).unwrap();

    let result = pipeline.process(SCRIPTURE).await.unwrap();

    assert_eq!(result.segments.len(), 1);
    let seg = &result.segments[0];
    assert!(seg.text.contains("（腓立比书4:6）"));
    assert!(seg.text.starts_with("你们应当"));
    assert_eq!(seg.biblical_references, vec!["（腓立比书4:6）".to_string()]);
    assert!(seg.notes.is_empty());
}

#[tokio::test]
async fn test_rewrite_dropping_reference_keeps_original() {
    let providers = providers_with(
        keyword_classifier("primary"),
        None,
        ScriptedRewriter::transform(|t| t.replace("（腓立比书4:6）", "")),
        MapEmbedder::new(),
    );
    let pipeline = PipelineCoordinator::new(fast_config(), providers).unwrap();

    let result = pipeline.process(SCRIPTURE).await.unwrap();

    let seg = &result.segments[0];
    assert_eq!(seg.text, SCRIPTURE);
    assert!(seg.changes.is_empty());
    assert!(seg.notes[0].starts_with("rewrite_fallback"));
    assert_eq!(result.summary.rewrite_fallbacks, 1);
    assert_eq!(result.summary.status, ProcessingStatus::Degraded);
}

#[tokio::test]
async fn test_usage_adds_up_including_charged_failures() {
    let providers = providers_with(
        ScriptedClassifier::failing("primary", MockFailure::Malformed { charged: 7 }),
        Some(keyword_classifier("secondary")),
        ScriptedRewriter::echo(),
        MapEmbedder::new(),
    );
    let config = fast_config();
    let retries = config.max_retries as u64;
    let pipeline = PipelineCoordinator::new(config, providers).unwrap();

    let result = pipeline.process(JOY_THEN_WORRY).await.unwrap();
    assert_eq!(result.segments.len(), 2);

    // Per segment: charged primary failures, secondary (chars + 5),
    // rewrite (chars + 8), embedding (chars).
    let expected: u64 = result
        .segments
        .iter()
        .map(|s| {
            let chars = s.text.chars().count() as u64;
            retries * 7 + (chars + 5) + (chars + 8) + chars
        })
        .sum();
    assert_eq!(result.usage.total_tokens, expected);
    assert_eq!(
        result.usage.total_tokens,
        result.usage.prompt_tokens + result.usage.completion_tokens
    );
    let model_total: u64 = result.usage.by_model.values().map(|m| m.total_tokens).sum();
    assert_eq!(model_total, result.usage.total_tokens);
    assert_eq!(result.usage.failed_calls as u64, retries * 2);
}

#[tokio::test]
async fn test_cancellation_writes_no_history() {
    let history_dir = tempfile::tempdir().unwrap();
    let providers = providers_with(
        ScriptedClassifier::failing("primary", MockFailure::Hang(Duration::from_secs(30))),
        None,
        ScriptedRewriter::echo(),
        MapEmbedder::new(),
    );
    let config = PipelineConfig {
        request_timeout: 60.0,
        ..fast_config()
    };
    let pipeline = PipelineCoordinator::new(config, providers)
        .unwrap()
        .with_history(HistoryLogger::new(history_dir.path().to_path_buf()));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = pipeline
        .process_with_cancel(JOY_THEN_WORRY, cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(std::fs::read_dir(history_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_history_written_on_success() {
    let history_dir = tempfile::tempdir().unwrap();
    let pipeline = PipelineCoordinator::new(fast_config(), default_providers())
        .unwrap()
        .with_history(HistoryLogger::new(history_dir.path().to_path_buf()));

    let result = pipeline.process(JOY_THEN_WORRY).await.unwrap();

    let files = result.log_files.expect("history files");
    let usage: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&files.usage_log).unwrap()).unwrap();
    assert_eq!(usage["totalTokens"], result.usage.total_tokens);
    assert_eq!(usage["runId"], result.summary.run_id.as_str());
    assert!(std::path::Path::new(&files.processing_log).exists());
}

#[tokio::test]
async fn test_embedding_outage_degrades_but_returns_segments() {
    let providers = providers_with(
        keyword_classifier("primary"),
        None,
        ScriptedRewriter::echo(),
        MapEmbedder::failing(MockFailure::Unauthorized),
    );
    let pipeline = PipelineCoordinator::new(fast_config(), providers).unwrap();

    let result = pipeline.process(JOY_THEN_WORRY).await.unwrap();

    assert_eq!(result.segments.len(), 2);
    assert!(matches!(result.summary.dedup, DedupStatus::Skipped(_)));
    assert_eq!(result.summary.status, ProcessingStatus::Degraded);
}

#[tokio::test]
async fn test_all_chunks_failing_is_no_usable_segments() {
    let providers = providers_with(
        ScriptedClassifier::failing("primary", MockFailure::Unauthorized),
        Some(ScriptedClassifier::failing("secondary", MockFailure::Unauthorized)),
        ScriptedRewriter::echo(),
        MapEmbedder::new(),
    );
    let pipeline = PipelineCoordinator::new(fast_config(), providers).unwrap();

    let err = pipeline.process(JOY_THEN_WORRY).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoUsableSegments(_)));
}

#[tokio::test]
async fn test_traditional_input_is_normalized() {
    let pipeline = PipelineCoordinator::new(fast_config(), default_providers()).unwrap();
    let result = pipeline
        .process("我們今天真是太開心了，這個時候大家都在一起！")
        .await
        .unwrap();
    assert_eq!(result.segments[0].text, "我们今天真是太开心了，这个时候大家都在一起！");
}
