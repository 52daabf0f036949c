//! Content normalization and similarity scoring for near-duplicate lookup.
//!
//! Digests are lowercased, punctuation-free, whitespace-collapsed text.
//! Similarity is the Jaccard index over the digest's word sets, which is
//! cheap, symmetric and insensitive to reflowed whitespace or quoting.

use std::collections::HashSet;

/// Upper bound on digest length. Long bodies are truncated before
/// tokenizing so a single huge email cannot dominate lookup cost.
pub const MAX_DIGEST_CHARS: usize = 4096;

/// Normalize raw content into a comparable digest.
pub fn normalize(content: &str) -> String {
    let mut out = String::with_capacity(content.len().min(MAX_DIGEST_CHARS));
    let mut emitted = 0usize;
    let mut pending_space = false;

    for ch in content.chars() {
        if emitted >= MAX_DIGEST_CHARS {
            break;
        }
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
                emitted += 1;
            }
            pending_space = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
                emitted += 1;
            }
        } else {
            pending_space = true;
        }
    }
    out
}

/// Word set of a normalized digest.
pub fn tokens(digest: &str) -> HashSet<String> {
    digest.split(' ').filter(|w| !w.is_empty()).map(str::to_owned).collect()
}

/// Jaccard similarity of two token sets, in `0.0..=1.0`.
///
/// Two empty sets are treated as dissimilar: empty content carries no
/// signal worth serving a cached answer for.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let intersection = small.iter().filter(|t| large.contains(*t)).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Upper bound on the Jaccard index given only set sizes. Used to skip
/// candidates that cannot possibly reach the threshold.
pub fn jaccard_upper_bound(len_a: usize, len_b: usize) -> f64 {
    let (lo, hi) = if len_a <= len_b { (len_a, len_b) } else { (len_b, len_a) };
    if hi == 0 {
        return 0.0;
    }
    lo as f64 / hi as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_case_and_punctuation() {
        assert_eq!(normalize("  Hello,   WORLD!\n\n> quoted "), "hello world quoted");
        assert_eq!(normalize("..."), "");
    }

    #[test]
    fn test_normalize_truncates() {
        let long = "word ".repeat(5000);
        assert!(normalize(&long).len() <= MAX_DIGEST_CHARS + 4);
    }

    #[test]
    fn test_normalize_truncates_by_chars_not_bytes() {
        let accented = "é".repeat(MAX_DIGEST_CHARS * 2);
        assert_eq!(normalize(&accented).chars().count(), MAX_DIGEST_CHARS);

        let cyrillic = "срочно ".repeat(2000);
        let digest = normalize(&cyrillic);
        assert!(digest.chars().count() >= MAX_DIGEST_CHARS);
        assert!(digest.chars().count() <= MAX_DIGEST_CHARS + 1);
    }

    #[test]
    fn test_jaccard_identical_and_disjoint() {
        let a = tokens(&normalize("please review the invoice today"));
        let b = tokens(&normalize("Please review the invoice today!"));
        let c = tokens(&normalize("lunch plans"));
        assert_eq!(jaccard(&a, &b), 1.0);
        assert_eq!(jaccard(&a, &c), 0.0);
    }

    #[test]
    fn test_jaccard_partial_overlap() {
        let a = tokens("a b c d");
        let b = tokens("a b c e");
        // 3 shared / 5 total
        assert!((jaccard(&a, &b) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_empty_sets_never_match() {
        let empty = HashSet::new();
        assert_eq!(jaccard(&empty, &empty), 0.0);
    }

    #[test]
    fn test_upper_bound_dominates_real_score() {
        let a = tokens("a b c d e f");
        let b = tokens("a b");
        assert!(jaccard(&a, &b) <= jaccard_upper_bound(a.len(), b.len()));
    }
}
