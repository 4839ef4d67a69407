// Picks one generated comment that does not repeat what was recently sent
// to the same target.

use std::collections::HashSet;

/// Candidates at or above this overlap with any recent comment are avoided.
pub const SIMILARITY_THRESHOLD: f64 = 0.72;
/// How many historical comments per target are compared against.
pub const HISTORY_WINDOW: usize = 40;

#[derive(Debug, Clone, PartialEq)]
pub struct RankedComment {
    pub text: String,
    /// Highest overlap against the history window.
    pub max_similarity: f64,
    /// `false` when every candidate was too similar and the least similar was taken.
    pub below_threshold: bool,
}

/// First candidate below the threshold, else the least similar one.
/// `None` only when there are no non-blank candidates.
pub fn select(candidates: &[String], history: &[String]) -> Option<RankedComment> {
    let history: Vec<HashSet<String>> = history
        .iter()
        .take(HISTORY_WINDOW)
        .map(|h| tokens(h))
        .collect();

    let mut least: Option<RankedComment> = None;
    for candidate in candidates {
        let text = candidate.trim();
        if text.is_empty() {
            continue;
        }
        let toks = tokens(text);
        let max_similarity = history
            .iter()
            .map(|h| jaccard(&toks, h))
            .fold(0.0_f64, f64::max);

        if max_similarity < SIMILARITY_THRESHOLD {
            return Some(RankedComment {
                text: text.to_string(),
                max_similarity,
                below_threshold: true,
            });
        }
        if least
            .as_ref()
            .map_or(true, |l| max_similarity < l.max_similarity)
        {
            least = Some(RankedComment {
                text: text.to_string(),
                max_similarity,
                below_threshold: false,
            });
        }
    }
    least
}

/// Token overlap (Jaccard) between two texts.
pub fn similarity(a: &str, b: &str) -> f64 {
    jaccard(&tokens(a), &tokens(b))
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|t| t.trim_matches('\'').to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}
