// Text Processing Service
// Input validation, normalization, token estimation and hard-marker partitioning

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Marker used for the legacy top-level partitioning pass.
pub const HARD_TRANSITION_MARKER: &str = "但是";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("input text is empty")]
    Empty,
    #[error("input text too short: {len} chars (minimum {min})")]
    TooShort { len: usize, min: usize },
    #[error("input is not valid UTF-8: {0}")]
    InvalidUnicode(String),
}

/// Reject empty or too-short input. Length is counted in Unicode scalars
/// after trimming.
pub fn validate_input(text: &str, min_chars: usize) -> Result<(), ValidationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }
    let len = trimmed.chars().count();
    if len < min_chars {
        return Err(ValidationError::TooShort { len, min: min_chars });
    }
    Ok(())
}

/// Decode raw bytes, surfacing invalid UTF-8 as a validation error.
pub fn decode_input(bytes: &[u8]) -> Result<&str, ValidationError> {
    std::str::from_utf8(bytes).map_err(|e| ValidationError::InvalidUnicode(e.to_string()))
}

// ============================================================================
// Normalization
// ============================================================================

/// Symbol ranges that normalization never touches.
const RESERVED_RANGES: &[(char, char)] = &[
    ('\u{2460}', '\u{24FF}'), // Enclosed Alphanumerics
    ('\u{3200}', '\u{32FF}'), // Enclosed CJK Letters and Months (㈠㈡㈢...)
    ('\u{E000}', '\u{F8FF}'), // Private Use Area
];

/// Traditional → simplified lookup. No value appears as a key, which keeps
/// the mapping idempotent.
const VARIANT_TABLE: &[(char, char)] = &[
    ('們', '们'), ('這', '这'), ('個', '个'), ('說', '说'), ('時', '时'),
    ('來', '来'), ('會', '会'), ('對', '对'), ('為', '为'), ('裡', '里'),
    ('開', '开'), ('聽', '听'), ('見', '见'), ('過', '过'),
    ('還', '还'), ('讓', '让'), ('從', '从'), ('給', '给'), ('進', '进'),
    ('點', '点'), ('樣', '样'), ('愛', '爱'), ('與', '与'), ('禱', '祷'),
    ('願', '愿'), ('淚', '泪'), ('憂', '忧'), ('慮', '虑'), ('懼', '惧'),
    ('驚', '惊'), ('訝', '讶'), ('悅', '悦'), ('滿', '满'), ('歡', '欢'),
    ('樂', '乐'), ('傷', '伤'), ('難', '难'), ('經', '经'), ('書', '书'),
    ('聖', '圣'), ('約', '约'), ('記', '记'), ('詩', '诗'),
    ('門', '门'), ('問', '问'), ('間', '间'), ('關', '关'), ('應', '应'),
    ('當', '当'), ('無', '无'), ('謝', '谢'), ('將', '将'),
    ('禮', '礼'), ('靈', '灵'), ('語', '语'), ('話', '话'), ('認', '认'),
    ('識', '识'), ('學', '学'), ('習', '习'), ('氣', '气'), ('實', '实'),
    ('現', '现'), ('發', '发'), ('頭', '头'), ('長', '长'), ('東', '东'),
    ('車', '车'), ('電', '电'), ('馬', '马'), ('魚', '鱼'), ('鳥', '鸟'),
    ('麼', '么'), ('嗎', '吗'), ('緊', '紧'), ('張', '张'), ('懷', '怀'),
    ('戰', '战'), ('勝', '胜'), ('艱', '艰'), ('後', '后'), ('裏', '里'),
];

fn is_reserved(c: char) -> bool {
    RESERVED_RANGES.iter().any(|(lo, hi)| c >= *lo && c <= *hi)
}

fn map_variant(c: char) -> char {
    if is_reserved(c) {
        return c;
    }
    if let Some((_, simplified)) = VARIANT_TABLE.iter().find(|(t, _)| *t == c) {
        return *simplified;
    }
    match c {
        // Full-width digits and Latin letters fold to ASCII; full-width
        // punctuation (including the colon used in scripture references) stays.
        '０'..='９' | 'Ａ'..='Ｚ' | 'ａ'..='ｚ' => {
            char::from_u32(c as u32 - 0xFEE0).unwrap_or(c)
        }
        '\u{3000}' | '\u{00A0}' => ' ',
        _ => c,
    }
}

/// Normalize input text. Idempotent: `normalize(normalize(t)) == normalize(t)`.
pub fn normalize_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut s: String = text
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .map(map_variant)
        .collect();

    // Collapse horizontal whitespace
    static WS_RE: OnceLock<Regex> = OnceLock::new();
    let ws_re = WS_RE.get_or_init(|| Regex::new(r"[ \t\x0C\x0B]+").unwrap());
    s = ws_re.replace_all(&s, " ").to_string();

    // Strip each line
    s = s.lines().map(|ln| ln.trim()).collect::<Vec<_>>().join("\n");

    s.trim().to_string()
}

// ============================================================================
// Token estimation
// ============================================================================

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TokenizerProfile {
    /// cl100k-style byte-pair vocabulary (gpt-3.5 / gpt-4 / ada-002).
    Cl100k,
    /// DeepSeek vocabulary, denser for CJK text.
    DeepSeek,
}

impl TokenizerProfile {
    /// Unknown model ids fall back to `Cl100k`.
    pub fn for_model(model_id: &str) -> Self {
        let id = model_id.trim().to_lowercase();
        if id.starts_with("deepseek") {
            Self::DeepSeek
        } else {
            Self::Cl100k
        }
    }

    /// Tokens contributed by CJK ideographs, in tenths of a token.
    fn cjk_tenths(&self) -> usize {
        match self {
            Self::Cl100k => 15,
            Self::DeepSeek => 6,
        }
    }
}

/// Estimate token count of `text` for the tokenizer behind `model_id`.
///
/// Every piece contributes a non-negative amount, so appending text never
/// lowers the estimate.
pub fn estimate_tokens(text: &str, model_id: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let profile = TokenizerProfile::for_model(model_id);

    static PIECE_RE: OnceLock<Regex> = OnceLock::new();
    let re = PIECE_RE.get_or_init(|| {
        Regex::new(r"[A-Za-z]+|[0-9]+|[\u{3400}-\u{4dbf}\u{4e00}-\u{9fff}]|\S").unwrap()
    });

    let mut cjk = 0usize;
    let mut other = 0usize;
    for m in re.find_iter(text) {
        let piece = m.as_str();
        let first = piece.chars().next().unwrap_or(' ');
        if first.is_ascii_alphabetic() {
            other += piece.len().div_ceil(4);
        } else if first.is_ascii_digit() {
            other += piece.len().div_ceil(3);
        } else if matches!(first, '\u{3400}'..='\u{4dbf}' | '\u{4e00}'..='\u{9fff}') {
            cjk += 1;
        } else {
            other += 1;
        }
    }

    (cjk * profile.cjk_tenths()).div_ceil(10) + other
}

// ============================================================================
// Partitioning
// ============================================================================

/// Split on the literal hard marker, keeping the marker at the start of the
/// following partition. Whitespace-only partitions are dropped.
pub fn partition_on_hard_marker(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut last = 0usize;
    for (idx, _) in text.match_indices(HARD_TRANSITION_MARKER) {
        if idx > last {
            parts.push(&text[last..idx]);
        }
        last = idx;
    }
    parts.push(&text[last..]);

    parts
        .into_iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}
