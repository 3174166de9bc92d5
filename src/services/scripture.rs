// Biblical Reference Detector
// 和合本书卷名 / 简称 + 章:节 识别（仅检测，不改写）

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Canonical book name followed by accepted short forms.
const BIBLE_BOOKS: &[(&str, &[&str])] = &[
    ("创世记", &["创世纪", "创"]),
    ("出埃及记", &["出埃及", "出"]),
    ("利未记", &["利未", "利"]),
    ("民数记", &["民数", "民"]),
    ("申命记", &["申命", "申"]),
    ("约书亚记", &["约书亚", "书"]),
    ("士师记", &["士师", "士"]),
    ("路得记", &["路得", "得"]),
    ("撒母耳记上", &["撒上"]),
    ("撒母耳记下", &["撒下"]),
    ("列王纪上", &["王上"]),
    ("列王纪下", &["王下"]),
    ("历代志上", &["代上"]),
    ("历代志下", &["代下"]),
    ("以斯拉记", &["以斯拉", "拉"]),
    ("尼希米记", &["尼希米", "尼"]),
    ("以斯帖记", &["以斯帖", "斯"]),
    ("约伯记", &["约伯", "伯"]),
    ("诗篇", &["诗"]),
    ("箴言", &["箴"]),
    ("传道书", &["传道", "传"]),
    ("雅歌", &["歌"]),
    ("以赛亚书", &["以赛亚", "赛"]),
    ("耶利米书", &["耶利米", "耶"]),
    ("耶利米哀歌", &["哀歌", "哀"]),
    ("以西结书", &["以西结", "结"]),
    ("但以理书", &["但以理", "但"]),
    ("何西阿书", &["何西阿", "何"]),
    ("约珥书", &["约珥", "珥"]),
    ("阿摩司书", &["阿摩司", "摩"]),
    ("俄巴底亚书", &["俄巴底亚", "俄"]),
    ("约拿书", &["约拿", "拿"]),
    ("弥迦书", &["弥迦", "弥"]),
    ("那鸿书", &["那鸿", "鸿"]),
    ("哈巴谷书", &["哈巴谷", "哈"]),
    ("西番雅书", &["西番雅", "番"]),
    ("哈该书", &["哈该", "该"]),
    ("撒迦利亚书", &["撒迦利亚", "亚"]),
    ("玛拉基书", &["玛拉基", "玛"]),
    ("马太福音", &["马太", "太"]),
    ("马可福音", &["马可", "可"]),
    ("路加福音", &["路加", "路"]),
    ("约翰福音", &["约翰", "约"]),
    ("使徒行传", &["使徒", "徒"]),
    ("罗马书", &["罗马", "罗"]),
    ("哥林多前书", &["林前"]),
    ("哥林多后书", &["林后"]),
    ("加拉太书", &["加拉太", "加"]),
    ("以弗所书", &["以弗所", "弗"]),
    ("腓立比书", &["腓立比", "腓"]),
    ("歌罗西书", &["歌罗西", "西"]),
    ("帖撒罗尼迦前书", &["帖前"]),
    ("帖撒罗尼迦后书", &["帖后"]),
    ("提摩太前书", &["提前"]),
    ("提摩太后书", &["提后"]),
    ("提多书", &["提多", "多"]),
    ("腓利门书", &["腓利门", "门"]),
    ("希伯来书", &["希伯来", "来"]),
    ("雅各书", &["雅各", "雅"]),
    ("彼得前书", &["彼前"]),
    ("彼得后书", &["彼后"]),
    ("约翰一书", &["约一"]),
    ("约翰二书", &["约二"]),
    ("约翰三书", &["约三"]),
    ("犹大书", &["犹大", "犹"]),
    ("启示录", &["启示", "启"]),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptureReference {
    /// Exact matched text, including any surrounding parentheses.
    pub surface: String,
    pub book: String,
    pub chapter: u32,
    pub verse: u32,
}

fn reference_regex() -> &'static Regex {
    static REFERENCE_RE: OnceLock<Regex> = OnceLock::new();
    REFERENCE_RE.get_or_init(|| {
        let mut names: Vec<&str> = BIBLE_BOOKS
            .iter()
            .flat_map(|(book, short)| std::iter::once(*book).chain(short.iter().copied()))
            .collect();
        // Longest first so 约翰福音 wins over 约
        names.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));
        names.dedup();
        let alternation = names
            .iter()
            .map(|n| regex::escape(n))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = format!(
            r"[（(]?(?P<book>{})\s*(?P<chapter>[0-9]+)[:：](?P<verse>[0-9]+)[）)]?",
            alternation
        );
        Regex::new(&pattern).expect("scripture reference pattern is valid")
    })
}

/// Canonical book name for a full name or short form.
pub fn canonical_book(name: &str) -> Option<&'static str> {
    BIBLE_BOOKS
        .iter()
        .find(|(book, short)| *book == name || short.contains(&name))
        .map(|(book, _)| *book)
}

/// Every reference in `text`, in order of appearance.
pub fn detect_references(text: &str) -> Vec<ScriptureReference> {
    reference_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let surface = caps.get(0)?.as_str().to_string();
            let short = caps.name("book")?.as_str();
            Some(ScriptureReference {
                surface,
                book: canonical_book(short).unwrap_or(short).to_string(),
                chapter: caps.name("chapter")?.as_str().parse().ok()?,
                verse: caps.name("verse")?.as_str().parse().ok()?,
            })
        })
        .collect()
}

/// Matched reference strings, in order of appearance.
pub fn find_references(text: &str) -> Vec<String> {
    detect_references(text).into_iter().map(|r| r.surface).collect()
}

pub fn contains_references(text: &str) -> bool {
    reference_regex().is_match(text)
}
