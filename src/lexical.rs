//! Lexical fallback search over the document cache.
//!
//! Used when semantic search comes back empty (or embeddings are disabled).
//! Both searches visit documents in path order and return `None`, never an
//! empty list, when no document matches.
//!
//! - [`exact_search`]: case-insensitive literal match of the whole query.
//! - [`loose_search`]: earliest occurrence of any query keyword longer than
//!   two characters.
//!
//! Windows are measured in characters, never split a UTF-8 sequence, and
//! have newlines flattened to spaces.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};

use crate::cache::DocumentSnapshot;

/// Case-insensitive literal search for `query`.
///
/// Each hit is `From {path}: ...{snippet}...`, where the snippet is the
/// `context_chars` characters starting at the first match.
pub fn exact_search(
    snapshot: &DocumentSnapshot,
    query: &str,
    context_chars: usize,
) -> Option<Vec<String>> {
    if query.trim().is_empty() {
        return None;
    }
    let pattern = RegexBuilder::new(&regex::escape(query))
        .case_insensitive(true)
        .build()
        .ok()?;

    let results: Vec<String> = snapshot
        .iter()
        .filter_map(|(path, text)| {
            let m = pattern.find(text)?;
            let end = advance_chars(text, m.start(), context_chars);
            Some(format!(
                "From {}: ...{}...",
                path,
                flatten(&text[m.start()..end])
            ))
        })
        .collect();

    (!results.is_empty()).then_some(results)
}

/// Keyword search around the earliest match in each document.
///
/// Keywords are the `\w+` tokens of the lowercased query longer than two
/// characters. Each hit is `...{snippet}...`, the snippet spanning
/// `context_chars` characters either side of the match.
pub fn loose_search(
    snapshot: &DocumentSnapshot,
    query: &str,
    context_chars: usize,
) -> Option<Vec<String>> {
    let keywords = keywords(query);
    if keywords.is_empty() {
        return None;
    }
    let alternation = keywords
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    let pattern = RegexBuilder::new(&alternation)
        .case_insensitive(true)
        .build()
        .ok()?;

    let results: Vec<String> = snapshot
        .iter()
        .filter_map(|(_, text)| {
            let idx = pattern.find(text)?.start();
            let start = retreat_chars(text, idx, context_chars);
            let end = advance_chars(text, idx, context_chars);
            Some(format!("...{}...", flatten(&text[start..end])))
        })
        .collect();

    (!results.is_empty()).then_some(results)
}

/// Query keywords used by [`loose_search`], deduplicated, in query order.
pub fn keywords(query: &str) -> Vec<String> {
    static WORD: OnceLock<Regex> = OnceLock::new();
    let word = WORD.get_or_init(|| Regex::new(r"\w+").expect("valid regex"));

    let lower = query.to_lowercase();
    let mut out: Vec<String> = Vec::new();
    for m in word.find_iter(&lower) {
        let w = m.as_str();
        if w.chars().count() > 2 && !out.iter().any(|k| k == w) {
            out.push(w.to_string());
        }
    }
    out
}

fn flatten(s: &str) -> String {
    s.replace(['\r', '\n'], " ").trim().to_string()
}

/// Byte offset `n` characters after `from`, clamped to the end of `text`.
fn advance_chars(text: &str, from: usize, n: usize) -> usize {
    text[from..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| from + i)
        .unwrap_or(text.len())
}

/// Byte offset `n` characters before `from`, clamped to the start of `text`.
fn retreat_chars(text: &str, from: usize, n: usize) -> usize {
    if n == 0 {
        return from;
    }
    text[..from]
        .char_indices()
        .rev()
        .nth(n - 1)
        .map(|(i, _)| i)
        .unwrap_or(0)
}
