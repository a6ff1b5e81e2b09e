//! Small string-similarity helpers used by the validator's fuzzy field
//! suggestions and the query builder's prior-query reuse check. No crate in
//! the dependency stack does fuzzy string matching, so this is hand-rolled
//! rather than reaching for an unvetted dependency.

use std::collections::HashSet;

/// Levenshtein edit distance between two strings, in characters.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());
    if n == 0 {
        return m;
    }
    if m == 0 {
        return n;
    }

    let mut prev: Vec<usize> = (0..=m).collect();
    let mut curr = vec![0usize; m + 1];

    for i in 1..=n {
        curr[0] = i;
        for j in 1..=m {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[m]
}

/// Normalized similarity ratio in `[0.0, 1.0]`, 1.0 meaning identical.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

/// Nearest-match suggestions over a candidate set, mirroring
/// `difflib.get_close_matches`: ranks by edit-distance ratio, falls back to
/// substring containment when nothing clears the ratio cutoff.
pub fn close_matches<'a>(query: &str, candidates: impl Iterator<Item = &'a str>, limit: usize) -> Vec<String> {
    let query_lower = query.to_lowercase();
    let mut scored: Vec<(f64, &str)> = candidates
        .map(|c| (similarity_ratio(&query_lower, &c.to_lowercase()), c))
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut out: Vec<String> = scored
        .iter()
        .filter(|(ratio, _)| *ratio >= 0.6)
        .take(limit)
        .map(|(_, c)| c.to_string())
        .collect();

    if out.is_empty() {
        out = scored
            .iter()
            .filter(|(_, c)| c.to_lowercase().contains(&query_lower) || query_lower.contains(&c.to_lowercase()))
            .take(limit)
            .map(|(_, c)| c.to_string())
            .collect();
    }

    out
}

/// Jaccard similarity over lowercased whitespace-tokenized sets. Used to
/// decide whether a new user query is "close enough" to a prior one to
/// justify reusing its query draft.
pub fn jaccard_token_similarity(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> HashSet<String> {
        s.to_lowercase()
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            .filter(|t| !t.is_empty())
            .collect()
    };
    let a = tokens(a);
    let b = tokens(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    if union == 0 { 0.0 } else { intersection as f64 / union as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_have_zero_distance() {
        assert_eq!(levenshtein("sales", "sales"), 0);
        assert_eq!(similarity_ratio("sales", "sales"), 1.0);
    }

    #[test]
    fn close_typo_scores_high_similarity() {
        let ratio = similarity_ratio("profi", "profit");
        assert!(ratio > 0.8, "expected high similarity, got {}", ratio);
    }

    #[test]
    fn close_matches_prefers_ratio_then_falls_back_to_substring() {
        let candidates = ["Profit", "Sales", "Region", "Profit Ratio"];
        let matches = close_matches("profi", candidates.into_iter(), 3);
        assert!(matches.contains(&"Profit".to_string()));
    }

    #[test]
    fn jaccard_identical_queries_is_one() {
        assert_eq!(jaccard_token_similarity("show sales by region", "show sales by region"), 1.0);
    }

    #[test]
    fn jaccard_unrelated_queries_is_low() {
        let sim = jaccard_token_similarity("show sales by region", "what is the weather today");
        assert!(sim < 0.2, "expected low similarity, got {}", sim);
    }

    #[test]
    fn jaccard_reuse_threshold_boundary() {
        let sim = jaccard_token_similarity("break down sales by region", "break down sales by category");
        assert!((0.3..0.9).contains(&sim));
    }
}
