// Speech Processor Data Models
// Shared by the segmentation pipeline and its serialized results

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============ Emotion ============

/// Emotion label reported by a classifier.
///
/// The first nine variants form the closed set accepted in strict mode.
/// `Disappointment`, `Calm` and `Neutral` are only accepted in legacy mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmotionLabel {
    #[serde(rename = "喜悦")]
    Joy,
    #[serde(rename = "愤怒")]
    Anger,
    #[serde(rename = "悲伤")]
    Sadness,
    #[serde(rename = "惊讶")]
    Surprise,
    #[serde(rename = "忧虑")]
    Worry,
    #[serde(rename = "恐惧")]
    Fear,
    #[serde(rename = "期待")]
    Anticipation,
    #[serde(rename = "满意")]
    Satisfaction,
    #[serde(rename = "焦虑")]
    Anxiety,
    #[serde(rename = "失望")]
    Disappointment,
    #[serde(rename = "平静")]
    Calm,
    #[serde(rename = "中性")]
    Neutral,
}

impl EmotionLabel {
    pub const STRICT: [EmotionLabel; 9] = [
        EmotionLabel::Joy,
        EmotionLabel::Anger,
        EmotionLabel::Sadness,
        EmotionLabel::Surprise,
        EmotionLabel::Worry,
        EmotionLabel::Fear,
        EmotionLabel::Anticipation,
        EmotionLabel::Satisfaction,
        EmotionLabel::Anxiety,
    ];

    pub fn as_zh(&self) -> &'static str {
        match self {
            Self::Joy => "喜悦",
            Self::Anger => "愤怒",
            Self::Sadness => "悲伤",
            Self::Surprise => "惊讶",
            Self::Worry => "忧虑",
            Self::Fear => "恐惧",
            Self::Anticipation => "期待",
            Self::Satisfaction => "满意",
            Self::Anxiety => "焦虑",
            Self::Disappointment => "失望",
            Self::Calm => "平静",
            Self::Neutral => "中性",
        }
    }

    pub fn is_strict(&self) -> bool {
        Self::STRICT.contains(self)
    }

    pub fn is_positive(&self) -> bool {
        matches!(
            self,
            Self::Joy | Self::Surprise | Self::Anticipation | Self::Satisfaction
        )
    }

    pub fn is_negative(&self) -> bool {
        matches!(
            self,
            Self::Worry
                | Self::Sadness
                | Self::Fear
                | Self::Anger
                | Self::Disappointment
                | Self::Anxiety
        )
    }

    pub fn is_neutral(&self) -> bool {
        matches!(self, Self::Calm | Self::Neutral)
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_zh())
    }
}

/// Label text that did not name any known emotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrecognizedLabel(pub String);

impl FromStr for EmotionLabel {
    type Err = UnrecognizedLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase();
        let label = match key.as_str() {
            "喜悦" | "joy" => Self::Joy,
            "愤怒" | "anger" => Self::Anger,
            "悲伤" | "sadness" => Self::Sadness,
            "惊讶" | "surprise" => Self::Surprise,
            "忧虑" | "worry" => Self::Worry,
            "恐惧" | "fear" => Self::Fear,
            "期待" | "anticipation" => Self::Anticipation,
            "满意" | "satisfaction" => Self::Satisfaction,
            "焦虑" | "anxiety" => Self::Anxiety,
            "失望" | "disappointment" => Self::Disappointment,
            "平静" | "calm" => Self::Calm,
            "中性" | "neutral" => Self::Neutral,
            _ => return Err(UnrecognizedLabel(s.trim().to_string())),
        };
        Ok(label)
    }
}

/// Validated classifier verdict: label plus intensity in [0, 5].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmotionReading {
    pub emotion: EmotionLabel,
    pub score: f64,
}

impl EmotionReading {
    pub fn new(emotion: EmotionLabel, score: f64) -> Self {
        Self { emotion, score }
    }
}

// ============ Text Units ============

/// Sentence-like fragment. Offsets are UTF-8 byte offsets into the
/// partition it was split from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentenceUnit {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Token-bounded group of consecutive sentence units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub unit_count: usize,
    pub token_estimate: usize,
    /// A single unit that alone exceeds the chunk budget.
    pub oversized: bool,
}

// ============ Segment ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub text: String,
    pub emotion: EmotionReading,
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default)]
    pub biblical_references: Vec<String>,
    /// Degradations that affected this segment (rewrite fallback, etc).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Segment {
    pub fn raw(text: String, emotion: EmotionReading) -> Self {
        Self {
            text,
            emotion,
            changes: Vec::new(),
            biblical_references: Vec::new(),
            notes: Vec::new(),
        }
    }
}

// ============ Usage ============

/// Token usage reported by one external call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub model_name: String,
}

impl ProviderUsage {
    pub fn new(model_name: &str, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            model_name: model_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub calls: u32,
    pub cost_estimate: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub model_name: String,
    pub cost_estimate: f64,
    pub calls: u32,
    pub failed_calls: u32,
    #[serde(default)]
    pub by_model: BTreeMap<String, ModelUsage>,
}

// ============ Result ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Complete,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum DedupStatus {
    Applied,
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSummary {
    pub run_id: String,
    pub original_length: usize,
    pub processed_length: usize,
    pub segment_count: usize,
    pub had_duplicates: bool,
    pub status: ProcessingStatus,
    pub dedup: DedupStatus,
    #[serde(default)]
    pub skipped_chunks: usize,
    #[serde(default)]
    pub failed_chunks: usize,
    #[serde(default)]
    pub failed_partitions: usize,
    #[serde(default)]
    pub rewrite_fallbacks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFiles {
    pub usage_log: String,
    pub processing_log: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub segments: Vec<Segment>,
    pub usage: UsageRecord,
    pub summary: ProcessingSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_files: Option<LogFiles>,
}
