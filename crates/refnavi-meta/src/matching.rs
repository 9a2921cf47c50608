//! Title normalization and similarity scoring.
//!
//! Normalized titles are the cache key and the similarity-comparison input:
//! two titles a human would consider identical must normalize identically.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Regex: bracketed citation markers like `[12]`.
static CITATION_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[0-9]+\]").unwrap());

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").unwrap());

/// Normalize a title for comparison and cache keying.
///
/// Steps (order matters):
/// 1. Unicode canonical composition (NFC)
/// 2. Lowercase
/// 3. Map typographic quotes (`’ ‘ “ ”`) to ASCII `'` / `"`
/// 4. Map en/em dashes to `-`
/// 5. Collapse whitespace runs to a single space, trim
///
/// Total and idempotent: `normalize_title(normalize_title(t)) == normalize_title(t)`.
pub fn normalize_title(title: &str) -> String {
    let composed: String = title.nfc().collect();
    let unified: String = composed
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201c}' | '\u{201d}' => '"',
            '\u{2013}' | '\u{2014}' => '-',
            c => c,
        })
        .collect();
    WHITESPACE_RUN
        .replace_all(unified.trim(), " ")
        .into_owned()
}

/// Character-level similarity ratio between two normalized titles.
///
/// Bounded [0, 1], symmetric, 1.0 for identical inputs. A sequence-alignment
/// ratio rather than token-set overlap: word order matters for titles, and
/// cross-provider differences are mostly punctuation/case/OCR noise.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    rapidfuzz::fuzz::ratio(a.chars(), b.chars())
}

/// Reduce a raw title or reference string to its informative query words.
///
/// Strips bracketed citation markers and punctuation, drops words of one or
/// two characters, and keeps the first `max_words` survivors. Providers with
/// their own fuzzy search get better recall from this than from the raw,
/// possibly noisy string.
pub fn query_words(text: &str, max_words: usize) -> String {
    let stripped = CITATION_MARKER.replace_all(text, "");
    let stripped = NON_WORD.replace_all(&stripped, "");
    stripped
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}
