use crate::error::EvalError;
use crate::models::{ArtifactRef, ProjectionTechnique};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;

const POWER_ITERATIONS: usize = 200;

const TSNE_ITERATIONS: usize = 1000;
const TSNE_EXAGGERATION_ITERATIONS: usize = 250;
const TSNE_EARLY_EXAGGERATION: f64 = 12.0;
const TSNE_LEARNING_RATE: f64 = 50.0;
const TSNE_MIN_GAIN: f64 = 0.01;
const PERPLEXITY_SEARCH_STEPS: usize = 64;
const PERPLEXITY_TOLERANCE: f64 = 1e-5;

pub struct ProjectionRequest<'a> {
    pub session_id: &'a str,
    pub configuration_id: &'a str,
    pub document_id: &'a str,
    pub question_id: &'a str,
    pub technique: ProjectionTechnique,
    pub chunk_vectors: &'a [Vec<f32>],
    pub query_vector: &'a [f32],
    pub answer_vector: &'a [f32],
    /// 0-based chunk indices to highlight.
    pub highlighted: &'a [usize],
}

/// Reduces chunk, query and answer vectors to a 2-D artifact. The returned
/// reference is opaque to the pipeline.
#[async_trait]
pub trait Projector: Send + Sync {
    async fn project(&self, request: ProjectionRequest<'_>) -> Result<ArtifactRef, EvalError>;
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PointRole {
    Chunk,
    Highlighted,
    Query,
    Answer,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProjectedPoint {
    pub role: PointRole,
    pub label: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Serialize)]
struct ScatterArtifact<'a> {
    technique: ProjectionTechnique,
    configuration_id: &'a str,
    document_id: &'a str,
    question_id: &'a str,
    points: Vec<ProjectedPoint>,
}

/// Writes PCA or t-SNE scatter data as JSON under
/// `<output_dir>/<session_id>/<technique>_<configuration>_<document>_<question>.json`.
pub struct ScatterProjector {
    output_dir: PathBuf,
}

impl ScatterProjector {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl Projector for ScatterProjector {
    async fn project(&self, request: ProjectionRequest<'_>) -> Result<ArtifactRef, EvalError> {
        let rows = stacked_rows(&request);
        let coordinates = match request.technique {
            ProjectionTechnique::Pca => pca_2d(&rows),
            ProjectionTechnique::Tsne => tokio::task::spawn_blocking(move || tsne_2d(&rows))
                .await
                .map_err(|error| EvalError::Io(std::io::Error::other(error.to_string())))?,
        };
        let points = label_points(&request, coordinates);

        let directory = self.output_dir.join(request.session_id);
        tokio::fs::create_dir_all(&directory).await?;
        let path = directory.join(format!(
            "{}_{}_{}_{}.json",
            request.technique.as_str(),
            request.configuration_id,
            request.document_id,
            request.question_id
        ));

        let artifact = ScatterArtifact {
            technique: request.technique,
            configuration_id: request.configuration_id,
            document_id: request.document_id,
            question_id: request.question_id,
            points,
        };
        tokio::fs::write(&path, serde_json::to_vec_pretty(&artifact)?).await?;

        Ok(ArtifactRef {
            technique: request.technique,
            location: path.to_string_lossy().to_string(),
        })
    }
}

/// Chunks first, then the query, then the answer.
fn stacked_rows(request: &ProjectionRequest<'_>) -> Vec<Vec<f64>> {
    let mut rows = request
        .chunk_vectors
        .iter()
        .map(|vector| to_f64(vector))
        .collect::<Vec<_>>();
    rows.push(to_f64(request.query_vector));
    rows.push(to_f64(request.answer_vector));
    rows
}

fn label_points(request: &ProjectionRequest<'_>, coordinates: Vec<(f64, f64)>) -> Vec<ProjectedPoint> {
    let chunk_count = request.chunk_vectors.len();

    coordinates
        .into_iter()
        .enumerate()
        .map(|(index, (x, y))| {
            let (role, label) = if index == chunk_count {
                (PointRole::Query, "query".to_string())
            } else if index == chunk_count + 1 {
                (PointRole::Answer, "answer".to_string())
            } else if request.highlighted.contains(&index) {
                (PointRole::Highlighted, format!("Chunk {}", index + 1))
            } else {
                (PointRole::Chunk, format!("Chunk {}", index + 1))
            };
            ProjectedPoint { role, label, x, y }
        })
        .collect()
}

fn to_f64(vector: &[f32]) -> Vec<f64> {
    vector.iter().map(|value| *value as f64).collect()
}

/// Projects rows onto their first two principal components, found by power
/// iteration with deflation. Rows must share one dimension.
pub fn pca_2d(rows: &[Vec<f64>]) -> Vec<(f64, f64)> {
    let dims = rows.first().map(Vec::len).unwrap_or(0);
    if rows.is_empty() || dims == 0 || rows.iter().any(|row| row.len() != dims) {
        return vec![(0.0, 0.0); rows.len()];
    }

    let n = rows.len() as f64;
    let mut mean = vec![0.0; dims];
    for row in rows {
        for (total, value) in mean.iter_mut().zip(row) {
            *total += value / n;
        }
    }
    let centered = rows
        .iter()
        .map(|row| row.iter().zip(&mean).map(|(value, mu)| value - mu).collect::<Vec<_>>())
        .collect::<Vec<_>>();

    let first = principal_component(&centered, dims, None);
    let second = principal_component(&centered, dims, first.as_deref());

    centered
        .iter()
        .map(|row| {
            let x = first.as_deref().map(|axis| dot(row, axis)).unwrap_or(0.0);
            let y = second.as_deref().map(|axis| dot(row, axis)).unwrap_or(0.0);
            (x, y)
        })
        .collect()
}

fn principal_component(centered: &[Vec<f64>], dims: usize, orthogonal_to: Option<&[f64]>) -> Option<Vec<f64>> {
    // Deterministic, non-symmetric start so the first step is not degenerate.
    let mut axis = (0..dims).map(|i| 1.0 + (i % 7) as f64 * 0.1).collect::<Vec<_>>();
    if let Some(previous) = orthogonal_to {
        remove_component(&mut axis, previous);
    }
    normalize(&mut axis)?;

    for _ in 0..POWER_ITERATIONS {
        // axis <- X^T (X axis)
        let mut next = vec![0.0; dims];
        for row in centered {
            let weight = dot(row, &axis);
            for (slot, value) in next.iter_mut().zip(row) {
                *slot += weight * value;
            }
        }
        if let Some(previous) = orthogonal_to {
            remove_component(&mut next, previous);
        }
        normalize(&mut next)?;
        axis = next;
    }
    Some(axis)
}

/// Exact t-SNE into two dimensions. Perplexity follows the row count,
/// `min(30, max(5, n / 4))`, clamped so every row has enough neighbours.
/// Starts from a scaled-down PCA layout, so the result is deterministic.
pub fn tsne_2d(rows: &[Vec<f64>]) -> Vec<(f64, f64)> {
    let n = rows.len();
    let dims = rows.first().map(Vec::len).unwrap_or(0);
    if n < 2 || dims == 0 || rows.iter().any(|row| row.len() != dims) {
        return vec![(0.0, 0.0); n];
    }

    let distances = rows
        .iter()
        .map(|a| rows.iter().map(|b| squared_distance(a, b)).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    if distances.iter().flatten().all(|distance| *distance < 1e-12) {
        return vec![(0.0, 0.0); n];
    }

    let perplexity = tsne_perplexity(n);
    let conditional = (0..n)
        .map(|i| conditional_row(&distances[i], i, perplexity.ln()))
        .collect::<Vec<_>>();
    let joint = (0..n)
        .map(|i| {
            (0..n)
                .map(|j| ((conditional[i][j] + conditional[j][i]) / (2.0 * n as f64)).max(1e-12))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let mut layout = initial_layout(rows);
    let mut velocity = vec![[0.0; 2]; n];
    let mut gains = vec![[1.0_f64; 2]; n];
    let mut affinity = vec![vec![0.0; n]; n];

    for iteration in 0..TSNE_ITERATIONS {
        let (exaggeration, momentum) = if iteration < TSNE_EXAGGERATION_ITERATIONS {
            (TSNE_EARLY_EXAGGERATION, 0.5)
        } else {
            (1.0, 0.8)
        };

        let mut total = 0.0;
        for i in 0..n {
            for j in 0..n {
                affinity[i][j] = if i == j {
                    0.0
                } else {
                    let dx = layout[i][0] - layout[j][0];
                    let dy = layout[i][1] - layout[j][1];
                    1.0 / (1.0 + dx * dx + dy * dy)
                };
                total += affinity[i][j];
            }
        }
        let total = total.max(1e-12);

        for i in 0..n {
            let mut gradient = [0.0; 2];
            for j in 0..n {
                if i == j {
                    continue;
                }
                let strength =
                    4.0 * (exaggeration * joint[i][j] - affinity[i][j] / total) * affinity[i][j];
                gradient[0] += strength * (layout[i][0] - layout[j][0]);
                gradient[1] += strength * (layout[i][1] - layout[j][1]);
            }
            for axis in 0..2 {
                gains[i][axis] = if (gradient[axis] > 0.0) != (velocity[i][axis] > 0.0) {
                    gains[i][axis] + 0.2
                } else {
                    (gains[i][axis] * 0.8).max(TSNE_MIN_GAIN)
                };
                velocity[i][axis] = momentum * velocity[i][axis]
                    - TSNE_LEARNING_RATE * gains[i][axis] * gradient[axis];
            }
        }

        for (point, step) in layout.iter_mut().zip(&velocity) {
            point[0] += step[0];
            point[1] += step[1];
        }
        center(&mut layout);
    }

    layout.into_iter().map(|[x, y]| (x, y)).collect()
}

fn tsne_perplexity(rows: usize) -> f64 {
    let preferred = (rows / 4).clamp(5, 30) as f64;
    preferred.min((rows - 1) as f64 / 3.0).max(1.0)
}

/// Row `i` of the conditional affinities, with the Gaussian bandwidth found by
/// bisection so the row's entropy matches `target_entropy`.
fn conditional_row(distances: &[f64], i: usize, target_entropy: f64) -> Vec<f64> {
    let nearest = distances
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != i)
        .map(|(_, distance)| *distance)
        .fold(f64::INFINITY, f64::min);

    let mut beta = 1.0;
    let (mut low, mut high) = (0.0, f64::INFINITY);
    let mut row = vec![0.0; distances.len()];

    for _ in 0..PERPLEXITY_SEARCH_STEPS {
        let mut sum = 0.0;
        let mut weighted = 0.0;
        for (j, distance) in distances.iter().enumerate() {
            // Shifting by the nearest distance keeps the largest term at 1.
            let shifted = distance - nearest;
            row[j] = if j == i { 0.0 } else { (-beta * shifted).exp() };
            sum += row[j];
            weighted += row[j] * shifted;
        }
        let entropy = sum.ln() + beta * weighted / sum;
        for value in row.iter_mut() {
            *value /= sum;
        }

        let excess = entropy - target_entropy;
        if excess.abs() < PERPLEXITY_TOLERANCE {
            break;
        }
        if excess > 0.0 {
            low = beta;
            beta = if high.is_finite() { (beta + high) / 2.0 } else { beta * 2.0 };
        } else {
            high = beta;
            beta = (beta + low) / 2.0;
        }
    }
    row
}

fn initial_layout(rows: &[Vec<f64>]) -> Vec<[f64; 2]> {
    let projected = pca_2d(rows);
    let spread = (projected.iter().map(|(x, _)| x * x).sum::<f64>() / projected.len() as f64).sqrt();
    if spread < 1e-12 {
        return (0..rows.len())
            .map(|i| [1e-4 * (i as f64).cos(), 1e-4 * (i as f64).sin()])
            .collect();
    }
    let scale = 1e-4 / spread;
    projected.into_iter().map(|(x, y)| [x * scale, y * scale]).collect()
}

fn center(layout: &mut [[f64; 2]]) {
    let n = layout.len() as f64;
    let mean_x = layout.iter().map(|point| point[0]).sum::<f64>() / n;
    let mean_y = layout.iter().map(|point| point[1]).sum::<f64>() / n;
    for point in layout.iter_mut() {
        point[0] -= mean_x;
        point[1] -= mean_y;
    }
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn remove_component(vector: &mut [f64], axis: &[f64]) {
    let projection = dot(vector, axis);
    for (value, direction) in vector.iter_mut().zip(axis) {
        *value -= projection * direction;
    }
}

fn normalize(vector: &mut [f64]) -> Option<()> {
    let norm = dot(vector, vector).sqrt();
    if norm < 1e-12 {
        return None;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
    Some(())
}
