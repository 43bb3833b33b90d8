//! Score normalization and fusion for hybrid retrieval.
//!
//! The lexical branch produces BM25 ranks where lower is better; the
//! semantic branch produces similarity scores where higher is better.
//! Both are min-max normalized into [0, 1] so they can be blended with a
//! single weight. A branch with one distinct value maps every candidate
//! to 1.0, an empty branch stays empty, and ids missing from a branch
//! contribute 0 to the blend.

use std::collections::HashMap;

use crate::config::ConfigError;

/// Invert BM25 ranks into higher-is-better scores in [0, 1].
pub fn normalize_keyword_ranks(ranks: &HashMap<i64, f64>) -> HashMap<i64, f64> {
    if ranks.is_empty() {
        return HashMap::new();
    }
    let min = ranks.values().cloned().fold(f64::INFINITY, f64::min);
    let max = ranks.values().cloned().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    ranks
        .iter()
        .map(|(&id, &rank)| {
            let score = if span <= f64::EPSILON {
                1.0
            } else {
                (max - rank) / span
            };
            (id, score)
        })
        .collect()
}

/// Min-max normalize similarity scores into [0, 1].
pub fn normalize_semantic_scores(scores: &HashMap<i64, f64>) -> HashMap<i64, f64> {
    if scores.is_empty() {
        return HashMap::new();
    }
    let min = scores.values().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.values().cloned().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    scores
        .iter()
        .map(|(&id, &score)| {
            let normalized = if span <= f64::EPSILON {
                1.0
            } else {
                (score - min) / span
            };
            (id, normalized)
        })
        .collect()
}

/// Blend two normalized branches over the union of their candidate ids.
pub fn fuse_normalized_scores(
    lexical: &HashMap<i64, f64>,
    semantic: &HashMap<i64, f64>,
    alpha: f64,
) -> Result<HashMap<i64, f64>, ConfigError> {
    if !(0.0..=1.0).contains(&alpha) {
        return Err(ConfigError::AlphaOutOfRange(alpha));
    }
    let mut fused: HashMap<i64, f64> = HashMap::new();
    for (&id, &score) in lexical {
        *fused.entry(id).or_insert(0.0) += (1.0 - alpha) * score;
    }
    for (&id, &score) in semantic {
        *fused.entry(id).or_insert(0.0) += alpha * score;
    }
    Ok(fused)
}

/// Sort descending by score with ascending chunk id as the tie-break.
pub fn order_fused_scores(fused: &HashMap<i64, f64>) -> Vec<(i64, f64)> {
    let mut ordered: Vec<(i64, f64)> = fused.iter().map(|(&id, &score)| (id, score)).collect();
    ordered.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ordered
}

/// Drop candidates below the relevance floor.
pub fn filter_relevant_scores(
    ordered: Vec<(i64, f64)>,
    min_score: f64,
) -> Result<Vec<(i64, f64)>, ConfigError> {
    if min_score < 0.0 {
        return Err(ConfigError::NegativeMinScore(min_score));
    }
    Ok(ordered
        .into_iter()
        .filter(|(_, score)| *score >= min_score)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(i64, f64)]) -> HashMap<i64, f64> {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn keyword_ranks_invert_so_best_rank_scores_one() {
        let scores = normalize_keyword_ranks(&map(&[(1, -10.0), (2, -4.0), (3, -1.0)]));
        assert!((scores[&1] - 1.0).abs() < 1e-9);
        assert!((scores[&2] - 2.0 / 3.0).abs() < 1e-9);
        assert!((scores[&3] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn single_distinct_value_maps_to_one() {
        let keyword = normalize_keyword_ranks(&map(&[(7, -3.0), (8, -3.0)]));
        assert!((keyword[&7] - 1.0).abs() < 1e-9);
        assert!((keyword[&8] - 1.0).abs() < 1e-9);

        let semantic = normalize_semantic_scores(&map(&[(9, 0.42)]));
        assert!((semantic[&9] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_branches_stay_empty() {
        assert!(normalize_keyword_ranks(&HashMap::new()).is_empty());
        assert!(normalize_semantic_scores(&HashMap::new()).is_empty());
    }

    #[test]
    fn semantic_scores_normalize_to_unit_range() {
        let scores = normalize_semantic_scores(&map(&[(1, 0.2), (2, 0.6), (3, 1.0)]));
        assert!((scores[&1] - 0.0).abs() < 1e-9);
        assert!((scores[&2] - 0.5).abs() < 1e-9);
        assert!((scores[&3] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fusion_weights_branches_over_the_union() {
        let lexical = map(&[(1, 1.0), (2, 0.5)]);
        let semantic = map(&[(2, 1.0), (3, 0.8)]);
        let fused = fuse_normalized_scores(&lexical, &semantic, 0.7).unwrap();

        assert!((fused[&1] - 0.3).abs() < 1e-9);
        assert!((fused[&2] - (0.3 * 0.5 + 0.7)).abs() < 1e-9);
        assert!((fused[&3] - 0.56).abs() < 1e-9);
    }

    #[test]
    fn alpha_zero_and_one_select_single_branches() {
        let lexical = map(&[(1, 0.9)]);
        let semantic = map(&[(2, 0.8)]);

        let lexical_only = fuse_normalized_scores(&lexical, &semantic, 0.0).unwrap();
        assert!((lexical_only[&1] - 0.9).abs() < 1e-9);
        assert!((lexical_only[&2] - 0.0).abs() < 1e-9);

        let semantic_only = fuse_normalized_scores(&lexical, &semantic, 1.0).unwrap();
        assert!((semantic_only[&1] - 0.0).abs() < 1e-9);
        assert!((semantic_only[&2] - 0.8).abs() < 1e-9);
    }

    #[test]
    fn alpha_out_of_range_is_rejected() {
        let err = fuse_normalized_scores(&HashMap::new(), &HashMap::new(), 1.5).unwrap_err();
        assert_eq!(err, ConfigError::AlphaOutOfRange(1.5));
        assert!(fuse_normalized_scores(&HashMap::new(), &HashMap::new(), -0.1).is_err());
    }

    #[test]
    fn ordering_breaks_score_ties_by_chunk_id() {
        let ordered = order_fused_scores(&map(&[(5, 0.4), (2, 0.4), (9, 0.7)]));
        assert_eq!(ordered, vec![(9, 0.7), (2, 0.4), (5, 0.4)]);
    }

    #[test]
    fn relevance_floor_drops_weak_candidates() {
        let ordered = vec![(1, 0.9), (2, 0.2), (3, 0.19)];
        let kept = filter_relevant_scores(ordered, 0.2).unwrap();
        assert_eq!(kept, vec![(1, 0.9), (2, 0.2)]);

        assert!(filter_relevant_scores(Vec::new(), -0.5).is_err());
    }
}
