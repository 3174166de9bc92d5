// Sentence Segmenter
// 分句（终止标点 + 转折词）并按 token 预算合块

use crate::models::{Chunk, SentenceUnit};
use crate::services::text_processor::estimate_tokens;

/// Words that usually announce an emotional pivot. Ordered longest-first
/// where one marker is a prefix of another.
pub const TRANSITION_MARKERS: &[&str] = &[
    "但是", "然而", "不过", "可是", "只是", "反而", "相反", "偏偏", "可惜", "没想到", "却",
];

/// Units with fewer meaningful (alphanumeric / CJK) chars than this are dropped.
const MIN_UNIT_CHARS: usize = 2;
/// Both halves of a marker split must be longer than this (in chars).
const MIN_MARKER_SPLIT_CHARS: usize = 3;

fn is_terminal(c: char) -> bool {
    matches!(c, '。' | '！' | '？' | '!' | '?' | '…' | '.')
}

fn is_closing(c: char) -> bool {
    matches!(
        c,
        '”' | '’' | '」' | '』' | '）' | ')' | '】' | '》' | '"' | '\''
    )
}

fn meaningful_chars(s: &str) -> usize {
    s.chars().filter(|c| c.is_alphanumeric()).count()
}

/// Returns true if `text` contains any transition marker.
pub fn contains_transition_marker(text: &str) -> bool {
    TRANSITION_MARKERS.iter().any(|m| text.contains(m))
}

/// Join two fragments, inserting a space only between two ASCII words.
pub fn join_fragments(left: &str, right: &str) -> String {
    if left.is_empty() {
        return right.to_string();
    }
    let needs_space = left
        .chars()
        .last()
        .map(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ',' | '!' | '?' | ';' | ':'))
        .unwrap_or(false)
        && right
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false);

    let mut out = String::with_capacity(left.len() + right.len() + 1);
    out.push_str(left);
    if needs_space {
        out.push(' ');
    }
    out.push_str(right);
    out
}

/// Byte spans ending at terminal-punctuation runs. The spans cover `text`
/// completely and in order.
fn terminal_spans(text: &str) -> Vec<(usize, usize)> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let (_, ch) = chars[i];
        if !is_terminal(ch) {
            i += 1;
            continue;
        }

        // Decimal numbers are not sentence ends.
        if ch == '.' && i > 0 && i + 1 < chars.len() {
            if chars[i - 1].1.is_ascii_digit() && chars[i + 1].1.is_ascii_digit() {
                i += 1;
                continue;
            }
        }

        // Absorb the whole run (！！！, ……, ...) and any closing quotes.
        let mut j = i + 1;
        while j < chars.len() && is_terminal(chars[j].1) {
            j += 1;
        }
        while j < chars.len() && is_closing(chars[j].1) {
            j += 1;
        }

        let end = chars.get(j).map(|(b, _)| *b).unwrap_or(text.len());
        spans.push((start, end));
        start = end;
        i = j;
    }

    if start < text.len() {
        spans.push((start, text.len()));
    }
    spans
}

/// Trim whitespace off a byte span, returning the narrowed span.
fn trim_span(text: &str, start: usize, end: usize) -> (usize, usize) {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if lead == slice.len() {
        return (start, start);
    }
    (start + lead, end - trail)
}

/// Earliest marker position (byte offset relative to `span`) that leaves both
/// halves long enough.
fn find_marker_split(span: &str) -> Option<usize> {
    let mut candidates: Vec<(usize, usize)> = TRANSITION_MARKERS
        .iter()
        .flat_map(|m| span.match_indices(m).map(|(pos, found)| (pos, found.len())))
        .filter(|(pos, _)| *pos > 0)
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    candidates.into_iter().map(|(pos, _)| pos).find(|&pos| {
        let left = span[..pos].trim();
        let right = span[pos..].trim();
        left.chars().count() > MIN_MARKER_SPLIT_CHARS
            && right.chars().count() > MIN_MARKER_SPLIT_CHARS
    })
}

/// Split `text` into sentence units.
///
/// Units end at terminal punctuation runs; a unit containing a transition
/// marker is split again before the marker when both halves stay long
/// enough. Degenerate fragments are dropped, not merged into neighbours.
pub fn split_sentences(text: &str) -> Vec<SentenceUnit> {
    let mut units = Vec::new();

    for (span_start, span_end) in terminal_spans(text) {
        let (mut s, e) = trim_span(text, span_start, span_end);
        if s == e {
            continue;
        }

        let mut pieces: Vec<(usize, usize)> = Vec::new();
        while let Some(rel) = find_marker_split(&text[s..e]) {
            pieces.push(trim_span(text, s, s + rel));
            s += rel;
        }
        pieces.push(trim_span(text, s, e));

        for (ps, pe) in pieces {
            let piece = &text[ps..pe];
            if meaningful_chars(piece) < MIN_UNIT_CHARS {
                tracing::debug!("[segmenter] dropping degenerate fragment {:?}", piece);
                continue;
            }
            units.push(SentenceUnit {
                text: piece.to_string(),
                start: ps,
                end: pe,
            });
        }
    }

    units
}

/// Greedily pack units into chunks whose estimate stays within `max_tokens`.
///
/// A single unit over budget still becomes its own chunk and is flagged
/// `oversized`; units are never split.
pub fn assemble_chunks(units: &[SentenceUnit], max_tokens: usize, model_id: &str) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current = String::new();
    let mut current_units = 0usize;

    let flush = |chunks: &mut Vec<Chunk>, text: &mut String, count: &mut usize| {
        if *count == 0 {
            return;
        }
        let token_estimate = estimate_tokens(text, model_id);
        chunks.push(Chunk {
            index: chunks.len(),
            text: std::mem::take(text),
            unit_count: *count,
            token_estimate,
            oversized: *count == 1 && token_estimate > max_tokens,
        });
        *count = 0;
    };

    for unit in units {
        if current_units == 0 {
            current = unit.text.clone();
            current_units = 1;
            continue;
        }

        let candidate = join_fragments(&current, &unit.text);
        if estimate_tokens(&candidate, model_id) <= max_tokens {
            current = candidate;
            current_units += 1;
        } else {
            flush(&mut chunks, &mut current, &mut current_units);
            current = unit.text.clone();
            current_units = 1;
        }
    }
    flush(&mut chunks, &mut current, &mut current_units);

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(units: &[SentenceUnit]) -> Vec<&str> {
        units.iter().map(|u| u.text.as_str()).collect()
    }

    fn strip_ws(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn test_split_on_terminal_punctuation() {
        let units = split_sentences("这是第一句。这是第二句！这是第三句？");
        assert_eq!(texts(&units), vec!["这是第一句。", "这是第二句！", "这是第三句？"]);
    }

    #[test]
    fn test_split_keeps_runs_and_closing_quotes_together() {
        let units = split_sentences("他说：「我们走吧。」真的吗？？我不知道……也许吧");
        assert_eq!(
            texts(&units),
            vec!["他说：「我们走吧。」", "真的吗？？", "我不知道……", "也许吧"]
        );
    }

    #[test]
    fn test_split_does_not_break_decimals() {
        let units = split_sentences("温度是36.5度。明天再说。");
        assert_eq!(texts(&units), vec!["温度是36.5度。", "明天再说。"]);
    }

    #[test]
    fn test_marker_split_reattaches_marker_to_second_half() {
        let units = split_sentences("我完成了这个项目，然而前方还有很多困难。");
        assert_eq!(
            texts(&units),
            vec!["我完成了这个项目，", "然而前方还有很多困难。"]
        );
    }

    #[test]
    fn test_marker_split_skipped_when_half_too_short() {
        // Left half "我却" is too short to stand alone.
        let units = split_sentences("我却不这么认为，事情会好起来。");
        assert_eq!(units.len(), 1);
    }

    #[test]
    fn test_marker_at_start_is_not_split() {
        let units = split_sentences("但是想到前方的困难，我心里也充满忧虑。");
        assert_eq!(units.len(), 1);
        assert!(units[0].text.starts_with("但是"));
    }

    #[test]
    fn test_degenerate_fragments_are_dropped() {
        let units = split_sentences("好！今天天气不错。");
        assert_eq!(texts(&units), vec!["今天天气不错。"]);
    }

    #[test]
    fn test_reconstruction_modulo_whitespace() {
        let text = "今天真是太开心了！我终于完成了这个项目。 这个项目让我学到了很多，不过也很辛苦。\n让我们继续努力……";
        let units = split_sentences(text);
        let joined: String = units.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(strip_ws(&joined), strip_ws(text));
        for u in &units {
            assert_eq!(&text[u.start..u.end], u.text);
        }
    }

    #[test]
    fn test_assemble_respects_budget() {
        let units = split_sentences(&"这是一个测试句子。".repeat(10));
        // Each unit is 8 CJK chars (12 tokens) + 1 punctuation token.
        let chunks = assemble_chunks(&units, 30, "gpt-3.5-turbo");
        assert_eq!(chunks.len(), 5);
        for c in &chunks {
            assert!(c.token_estimate <= 30);
            assert_eq!(c.unit_count, 2);
            assert!(!c.oversized);
        }
        let rebuilt: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rebuilt, "这是一个测试句子。".repeat(10));
    }

    #[test]
    fn test_assemble_keeps_oversized_unit_whole() {
        let long = format!("{}。", "长".repeat(40));
        let units = split_sentences(&format!("短句一二。{}短句三四。", long));
        let chunks = assemble_chunks(&units, 20, "gpt-3.5-turbo");
        assert_eq!(chunks.len(), 3);
        assert!(chunks[1].oversized);
        assert_eq!(chunks[1].text, long);
        for c in &chunks {
            assert!(c.token_estimate <= 20 || (c.unit_count == 1 && c.oversized));
        }
    }

    #[test]
    fn test_join_fragments_spacing() {
        assert_eq!(join_fragments("你好。", "世界。"), "你好。世界。");
        assert_eq!(join_fragments("Hello.", "World"), "Hello. World");
        assert_eq!(join_fragments("", "世界"), "世界");
    }
}
