// Emotion Classification
// Response validation, provider fallback and emotion-continuity segmentation

pub mod fallback;
pub mod segmenter;

pub use fallback::{ClassificationOutcome, FallbackOrchestrator, FallbackState};
pub use segmenter::{merge_break, EmotionSegmenter, SegmentError, SegmenterOutcome};

use crate::models::{EmotionLabel, EmotionReading};
use crate::services::providers::{ClassifierResponse, ContractViolation};

const SENTINEL_LABELS: &[&str] = &["unknown", "未知", "none", "n/a"];
pub const MAX_SCORE: f64 = 5.0;

/// Check a raw classifier verdict against the accepted label set and score
/// range. `strict` limits labels to the nine-label set with integer scores.
pub fn validate_reading(
    response: &ClassifierResponse,
    strict: bool,
) -> Result<EmotionReading, ContractViolation> {
    let raw = response.label.trim();
    if raw.is_empty() || SENTINEL_LABELS.contains(&raw.to_lowercase().as_str()) {
        return Err(ContractViolation::UnknownLabel(raw.to_string()));
    }

    let label: EmotionLabel = raw
        .parse()
        .map_err(|_| ContractViolation::LabelOutsideSet(raw.to_string()))?;
    if strict && !label.is_strict() {
        return Err(ContractViolation::LabelOutsideSet(raw.to_string()));
    }

    let score = response.score;
    if !score.is_finite() || !(0.0..=MAX_SCORE).contains(&score) {
        return Err(ContractViolation::ScoreOutOfRange(score));
    }
    if strict && score.fract() != 0.0 {
        return Err(ContractViolation::NonIntegerScore(score));
    }

    Ok(EmotionReading::new(label, score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderUsage;

    fn response(label: &str, score: f64) -> ClassifierResponse {
        ClassifierResponse {
            label: label.to_string(),
            score,
            explanation: None,
            usage: ProviderUsage::new("gpt-3.5-turbo", 10, 5),
        }
    }

    #[test]
    fn test_accepts_closed_set() {
        let reading = validate_reading(&response("喜悦", 3.0), true).unwrap();
        assert_eq!(reading.emotion, EmotionLabel::Joy);
        assert_eq!(reading.score, 3.0);

        let english = validate_reading(&response("worry", 2.0), true).unwrap();
        assert_eq!(english.emotion, EmotionLabel::Worry);
    }

    #[test]
    fn test_unknown_is_contract_violation() {
        for raw in ["unknown", "Unknown", "未知", "  "] {
            assert!(matches!(
                validate_reading(&response(raw, 1.0), false),
                Err(ContractViolation::UnknownLabel(_))
            ));
        }
    }

    #[test]
    fn test_strict_mode_rejects_legacy_labels_and_fractions() {
        assert_eq!(
            validate_reading(&response("平静", 1.0), true),
            Err(ContractViolation::LabelOutsideSet("平静".to_string()))
        );
        assert_eq!(
            validate_reading(&response("喜悦", 2.5), true),
            Err(ContractViolation::NonIntegerScore(2.5))
        );

        let legacy = validate_reading(&response("平静", 2.5), false).unwrap();
        assert_eq!(legacy.emotion, EmotionLabel::Calm);
    }

    #[test]
    fn test_out_of_set_and_out_of_range() {
        assert!(matches!(
            validate_reading(&response("开心", 3.0), false),
            Err(ContractViolation::LabelOutsideSet(_))
        ));
        assert_eq!(
            validate_reading(&response("喜悦", 6.0), true),
            Err(ContractViolation::ScoreOutOfRange(6.0))
        );
        assert!(validate_reading(&response("喜悦", f64::NAN), false).is_err());
    }
}
