use crate::error::EvalError;
use crate::models::SimilarityMetric;

/// A chunk selected for generation context.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedChunk {
    /// 0-based position in the processed document.
    pub index: usize,
    pub text: String,
    pub score: f64,
}

impl RankedChunk {
    pub fn chunk_number(&self) -> usize {
        self.index + 1
    }
}

/// Scores every chunk vector against the query, preserving chunk order.
pub fn score(
    query: &[f32],
    chunk_vectors: &[Vec<f32>],
    metric: SimilarityMetric,
) -> Result<Vec<f64>, EvalError> {
    chunk_vectors
        .iter()
        .map(|vector| {
            if vector.len() != query.len() {
                return Err(EvalError::DimensionMismatch {
                    expected: query.len(),
                    actual: vector.len(),
                });
            }
            Ok(match metric {
                SimilarityMetric::Cosine => cosine_similarity(query, vector),
                SimilarityMetric::DotProduct => dot_product(query, vector),
                SimilarityMetric::Euclidean => euclidean_similarity(query, vector),
            })
        })
        .collect()
}

/// Returns 0.0 when either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f64::EPSILON {
        return 0.0;
    }

    dot / denom
}

pub fn dot_product(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| *x as f64 * *y as f64).sum()
}

/// `1 / (1 + distance)`: 1.0 for identical vectors, approaching 0 with distance.
pub fn euclidean_similarity(a: &[f32], b: &[f32]) -> f64 {
    let distance = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let delta = *x as f64 - *y as f64;
            delta * delta
        })
        .sum::<f64>()
        .sqrt();
    1.0 / (1.0 + distance)
}

/// Highest scores first, ties broken by ascending original index. `k` is
/// clamped to the number of chunks.
pub fn top_k(chunks: &[String], scores: &[f64], k: usize) -> Result<Vec<RankedChunk>, EvalError> {
    if k == 0 {
        return Err(EvalError::Configuration(
            "top_k must be greater than 0".to_string(),
        ));
    }
    if chunks.len() != scores.len() {
        return Err(EvalError::DimensionMismatch {
            expected: chunks.len(),
            actual: scores.len(),
        });
    }

    let mut order = (0..chunks.len()).collect::<Vec<_>>();
    order.sort_by(|left, right| {
        sortable(scores[*right])
            .total_cmp(&sortable(scores[*left]))
            .then_with(|| left.cmp(right))
    });

    Ok(order
        .into_iter()
        .take(k)
        .map(|index| RankedChunk {
            index,
            text: chunks[index].clone(),
            score: scores[index],
        })
        .collect())
}

fn sortable(score: f64) -> f64 {
    if score.is_nan() {
        f64::NEG_INFINITY
    } else {
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(count: usize) -> Vec<String> {
        (0..count).map(|index| format!("chunk {index}")).collect()
    }

    #[test]
    fn cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn euclidean_similarity_is_one_for_identical_vectors() {
        assert!((euclidean_similarity(&[0.5, 0.5], &[0.5, 0.5]) - 1.0).abs() < 1e-9);
        assert!((euclidean_similarity(&[0.0, 0.0], &[3.0, 4.0]) - 1.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn score_preserves_order_per_metric() {
        let query = vec![1.0, 0.0];
        let chunks = vec![vec![0.0, 1.0], vec![2.0, 0.0]];

        let dot = score(&query, &chunks, SimilarityMetric::DotProduct).unwrap();
        assert_eq!(dot, vec![0.0, 2.0]);

        let cosine = score(&query, &chunks, SimilarityMetric::Cosine).unwrap();
        assert!((cosine[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn score_rejects_mismatched_dimensions() {
        let result = score(&[1.0, 0.0], &[vec![1.0]], SimilarityMetric::Cosine);
        assert!(matches!(result, Err(EvalError::DimensionMismatch { .. })));
    }

    #[test]
    fn top_k_sorts_descending_with_index_tiebreak() {
        let scores = vec![0.2, 0.9, 0.5, 0.9];
        let ranked = top_k(&texts(4), &scores, 3).unwrap();
        let indices = ranked.iter().map(|chunk| chunk.index).collect::<Vec<_>>();
        assert_eq!(indices, vec![1, 3, 2]);
        assert!(ranked.windows(2).all(|pair| pair[0].score >= pair[1].score));
        assert_eq!(ranked[0].chunk_number(), 2);
    }

    #[test]
    fn top_k_clamps_to_available_chunks() {
        let ranked = top_k(&texts(2), &[0.1, 0.3], 10).unwrap();
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn top_k_rejects_zero() {
        assert!(matches!(
            top_k(&texts(2), &[0.1, 0.3], 0),
            Err(EvalError::Configuration(_))
        ));
    }

    #[test]
    fn nan_scores_rank_last() {
        let ranked = top_k(&texts(3), &[f64::NAN, 0.1, 0.2], 3).unwrap();
        assert_eq!(ranked[2].index, 0);
    }
}
