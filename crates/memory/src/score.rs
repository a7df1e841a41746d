//! Character-bigram overlap used by both memory search and rule relevance.

use std::collections::HashSet;

pub(crate) fn char_bigrams(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = text.chars().collect();
    chars.windows(2).map(|pair| (pair[0], pair[1])).collect()
}

/// Overlap bonus: 0.3 per shared bigram, capped at 3.0 so long documents do
/// not drown out exact matches.
pub(crate) fn bigram_bonus(query: &str, content: &str) -> f64 {
    let query_bigrams = char_bigrams(query);
    if query_bigrams.is_empty() {
        return 0.0;
    }
    let content_bigrams = char_bigrams(content);
    let overlap = query_bigrams.intersection(&content_bigrams).count();
    (overlap as f64 * 0.3).min(3.0)
}
