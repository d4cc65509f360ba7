//! Retrieval Utility Score.
//!
//! Combines three views of one retrieval, all computed over the retrieved
//! chunks in rank order:
//! - normalized DCR: is the relevance concentrated at the top ranks?
//! - scaled Spearman correlation: does similarity order predict relevance order?
//! - wasted similarity: how much similarity mass went to chunks that were not used?

use crate::error::EvalError;
use crate::models::RusMetrics;

const DCR_WEIGHT: f64 = 0.5;
const CORRELATION_WEIGHT: f64 = 0.4;
const WASTE_WEIGHT: f64 = 0.1;

/// Scaled correlation used when the rank correlation is undefined (fewer than
/// two chunks, or a constant input). Equivalent to zero correlation.
pub const NEUTRAL_SCALED_CORRELATION: f64 = 0.5;

/// Discounted cumulative relevance: `sum(score_i / log2(i + 1))` with
/// 1-indexed positions.
pub fn dcr(scores: &[f64]) -> f64 {
    scores
        .iter()
        .enumerate()
        .map(|(position, score)| score / ((position + 2) as f64).log2())
        .sum()
}

pub fn normalized_dcr(relevance: &[f64]) -> f64 {
    let mut ideal = relevance.to_vec();
    ideal.sort_by(|left, right| right.total_cmp(left));

    let ideal_dcr = dcr(&ideal);
    if ideal_dcr == 0.0 {
        return 0.0;
    }
    dcr(relevance) / ideal_dcr
}

/// Spearman rank correlation with average ranks for ties. `None` when the
/// correlation is undefined.
pub fn spearman(left: &[f64], right: &[f64]) -> Option<f64> {
    if left.len() != right.len() || left.len() < 2 {
        return None;
    }
    pearson(&average_ranks(left), &average_ranks(right))
}

pub fn wasted_similarity_penalty(similarity: &[f64], relevance: &[f64]) -> f64 {
    let total: f64 = similarity.iter().sum();
    if total == 0.0 {
        return 0.0;
    }
    let wasted: f64 = similarity
        .iter()
        .zip(relevance.iter())
        .filter(|(_, relevance)| **relevance == 0.0)
        .map(|(similarity, _)| similarity)
        .sum();
    wasted / total
}

/// `similarity` and `relevance` are parallel arrays in retrieved-rank order;
/// relevance is a fraction (percentage / 100).
pub fn compute(similarity: &[f64], relevance: &[f64]) -> Result<RusMetrics, EvalError> {
    if similarity.len() != relevance.len() {
        return Err(EvalError::DimensionMismatch {
            expected: similarity.len(),
            actual: relevance.len(),
        });
    }

    let normalized_dcr = normalized_dcr(relevance);
    let correlation = spearman(similarity, relevance);
    let scaled_correlation = correlation
        .map(|value| (value + 1.0) / 2.0)
        .unwrap_or(NEUTRAL_SCALED_CORRELATION);
    let wasted_similarity_penalty = wasted_similarity_penalty(similarity, relevance);

    Ok(RusMetrics {
        rus: DCR_WEIGHT * normalized_dcr + CORRELATION_WEIGHT * scaled_correlation
            - WASTE_WEIGHT * wasted_similarity_penalty,
        normalized_dcr,
        scaled_correlation,
        wasted_similarity_penalty,
        correlation_defined: correlation.is_some(),
    })
}

fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order = (0..values.len()).collect::<Vec<_>>();
    order.sort_by(|left, right| values[*left].total_cmp(&values[*right]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && values[order[end + 1]] == values[order[start]] {
            end += 1;
        }
        // 1-based ranks; ties share the mean of the positions they span.
        let rank = (start + end) as f64 / 2.0 + 1.0;
        for position in start..=end {
            ranks[order[position]] = rank;
        }
        start = end + 1;
    }
    ranks
}

fn pearson(left: &[f64], right: &[f64]) -> Option<f64> {
    let n = left.len() as f64;
    let mean_left = left.iter().sum::<f64>() / n;
    let mean_right = right.iter().sum::<f64>() / n;

    let mut covariance = 0.0;
    let mut variance_left = 0.0;
    let mut variance_right = 0.0;
    for (x, y) in left.iter().zip(right.iter()) {
        let dx = x - mean_left;
        let dy = y - mean_right;
        covariance += dx * dy;
        variance_left += dx * dx;
        variance_right += dy * dy;
    }

    let denom = (variance_left * variance_right).sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return None;
    }
    Some((covariance / denom).clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-9
    }

    #[test]
    fn dcr_discounts_by_log_position() {
        // 1/log2(2) + 1/log2(3)
        let expected = 1.0 + 1.0 / 3f64.log2();
        assert!(close(dcr(&[1.0, 1.0]), expected));
    }

    #[test]
    fn perfect_ranking_has_unit_normalized_dcr() {
        let similarity = [0.9, 0.7, 0.4];
        let relevance = [0.6, 0.3, 0.1];
        let metrics = compute(&similarity, &relevance).unwrap();

        assert!(close(metrics.normalized_dcr, 1.0));
        assert!(close(metrics.scaled_correlation, 1.0));
        assert!(close(metrics.wasted_similarity_penalty, 0.0));
        assert!(close(metrics.rus, 0.9));
    }

    #[test]
    fn reversed_ranking_scores_low() {
        let metrics = compute(&[0.9, 0.7, 0.4], &[0.1, 0.3, 0.6]).unwrap();
        assert!(metrics.normalized_dcr < 1.0);
        assert!(close(metrics.scaled_correlation, 0.0));
    }

    #[test]
    fn all_zero_relevance_wastes_all_similarity() {
        let metrics = compute(&[0.8, 0.5], &[0.0, 0.0]).unwrap();
        assert!(close(metrics.wasted_similarity_penalty, 1.0));
        assert!(close(metrics.normalized_dcr, 0.0));
        assert!(!metrics.correlation_defined);
        assert!(close(metrics.scaled_correlation, NEUTRAL_SCALED_CORRELATION));
    }

    #[test]
    fn partial_waste_is_proportional() {
        let penalty = wasted_similarity_penalty(&[0.6, 0.4], &[1.0, 0.0]);
        assert!(close(penalty, 0.4));
        assert_eq!(wasted_similarity_penalty(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn spearman_handles_ties_with_average_ranks() {
        let correlation = spearman(&[1.0, 2.0, 2.0, 3.0], &[1.0, 2.0, 2.0, 3.0]).unwrap();
        assert!(close(correlation, 1.0));
        assert!(spearman(&[1.0, 2.0], &[5.0, 5.0]).is_none());
        assert!(spearman(&[1.0], &[1.0]).is_none());
    }

    #[test]
    fn single_chunk_uses_neutral_correlation() {
        let metrics = compute(&[0.7], &[1.0]).unwrap();
        assert!(close(metrics.normalized_dcr, 1.0));
        assert!(close(metrics.rus, 0.5 + 0.4 * NEUTRAL_SCALED_CORRELATION));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        assert!(matches!(
            compute(&[0.1, 0.2], &[1.0]),
            Err(EvalError::DimensionMismatch { .. })
        ));
    }
}
