//! Overlapping word-window text chunker.
//!
//! Splits document text into windows of `window` whitespace-separated words.
//! Consecutive windows share `overlap` words, so each window after the first
//! starts `window - overlap` words after the previous one. `overlap` must be
//! strictly smaller than `window`; this keeps the step positive and the loop
//! finite even for a single-word document.

/// Splits `text` into overlapping word windows, in reading order.
///
/// Returns no chunks for text without words. The last window may hold fewer
/// than `window` words. No window starts past the end of the text.
///
/// # Panics
///
/// Panics if `window == 0` or `overlap >= window`. Configuration loading
/// rejects both, so this only fires on programmer error.
pub fn chunk_words(text: &str, window: usize, overlap: usize) -> Vec<String> {
    assert!(window > 0, "chunk window must be > 0");
    assert!(overlap < window, "chunk overlap must be < window");

    let words: Vec<&str> = text.split_whitespace().collect();
    let step = window - overlap;
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < words.len() {
        let end = (start + window).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }

    chunks
}

/// The part of each chunk that does not repeat the previous chunk.
///
/// Concatenating the returned spans gives back the document's word
/// sequence exactly once.
pub fn unique_spans(chunks: &[String], overlap: usize) -> Vec<Vec<&str>> {
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let words: Vec<&str> = chunk.split_whitespace().collect();
            let skip = if i == 0 { 0 } else { overlap.min(words.len()) };
            words[skip..].to_vec()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered_words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(chunk_words("", 100, 20).is_empty());
        assert!(chunk_words("   \n\t ", 100, 20).is_empty());
    }

    #[test]
    fn test_single_word_document() {
        assert_eq!(chunk_words("hello", 100, 20), vec!["hello"]);
        assert_eq!(chunk_words("hello", 2, 1), vec!["hello"]);
    }

    #[test]
    fn test_windows_overlap() {
        let chunks = chunk_words("a b c d e f g", 4, 2);
        assert_eq!(chunks, vec!["a b c d", "c d e f", "e f g"]);
    }

    #[test]
    fn test_no_trailing_window_past_end() {
        // 10 words, step 8: the second window starts at word 8.
        let chunks = chunk_words(&numbered_words(10), 8, 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], "w8 w9");
    }

    #[test]
    fn test_whitespace_is_normalized() {
        let chunks = chunk_words("The  quick\nfox\tjumps.", 100, 20);
        assert_eq!(chunks, vec!["The quick fox jumps."]);
    }

    #[test]
    fn test_deterministic() {
        let text = numbered_words(537);
        assert_eq!(chunk_words(&text, 100, 20), chunk_words(&text, 100, 20));
    }

    #[test]
    fn test_unique_spans_reconstruct_document() {
        for n in [1usize, 2, 3, 7, 19, 20, 21, 100, 101, 250] {
            let text = numbered_words(n);
            let expected: Vec<&str> = text.split_whitespace().collect();
            for (window, overlap) in [(1, 0), (2, 1), (5, 4), (10, 3), (100, 20), (7, 0)] {
                let chunks = chunk_words(&text, window, overlap);
                let rebuilt: Vec<&str> = unique_spans(&chunks, overlap).into_iter().flatten().collect();
                assert_eq!(
                    rebuilt, expected,
                    "n={} window={} overlap={}",
                    n, window, overlap
                );
                for c in &chunks {
                    assert!(c.split_whitespace().count() <= window);
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "overlap")]
    fn test_overlap_equal_to_window_is_rejected() {
        chunk_words("a b c", 3, 3);
    }
}
