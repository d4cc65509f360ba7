use crate::error::EvalError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub extension: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    #[serde(alias = "tokens")]
    Token,
    Sentence,
    Paragraph,
    Page,
}

impl ChunkingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Sentence => "sentence",
            Self::Paragraph => "paragraph",
            Self::Page => "page",
        }
    }
}

impl fmt::Display for ChunkingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkingStrategy {
    type Err = EvalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "token" | "tokens" => Ok(Self::Token),
            "sentence" | "sentences" => Ok(Self::Sentence),
            "paragraph" | "paragraphs" => Ok(Self::Paragraph),
            "page" | "pages" => Ok(Self::Page),
            other => Err(EvalError::Configuration(format!(
                "unknown chunking strategy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    Cosine,
    DotProduct,
    Euclidean,
}

impl SimilarityMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::DotProduct => "dot_product",
            Self::Euclidean => "euclidean",
        }
    }
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimilarityMetric {
    type Err = EvalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "dot" | "dot_product" | "dot-product" | "inner_product" => Ok(Self::DotProduct),
            "euclidean" | "l2" => Ok(Self::Euclidean),
            other => Err(EvalError::Configuration(format!(
                "unknown similarity metric '{other}'"
            ))),
        }
    }
}

/// Size parameters for every strategy. Only the one matching the
/// configuration's strategy is read by the splitter.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChunkSizes {
    #[serde(default)]
    pub token_size: Option<usize>,
    #[serde(default)]
    pub sentence_size: Option<usize>,
    #[serde(default)]
    pub paragraph_size: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Configuration {
    pub id: String,
    pub chunking_strategy: ChunkingStrategy,
    #[serde(flatten)]
    pub sizes: ChunkSizes,
    pub embedding_model: String,
    pub similarity_metric: SimilarityMetric,
    pub top_k: usize,
}

impl Configuration {
    /// The size parameter for the selected strategy.
    pub fn chunk_size(&self) -> Result<NonZeroUsize, EvalError> {
        let (name, value) = match self.chunking_strategy {
            ChunkingStrategy::Token => ("token_size", self.sizes.token_size),
            ChunkingStrategy::Sentence => ("sentence_size", self.sizes.sentence_size),
            ChunkingStrategy::Paragraph => ("paragraph_size", self.sizes.paragraph_size),
            ChunkingStrategy::Page => ("page_size", self.sizes.page_size),
        };

        let value = value.ok_or_else(|| {
            EvalError::Configuration(format!(
                "{name} is required for {} chunking",
                self.chunking_strategy
            ))
        })?;

        NonZeroUsize::new(value)
            .ok_or_else(|| EvalError::Configuration(format!("{name} must be greater than 0")))
    }

    pub fn validate(&self) -> Result<(), EvalError> {
        self.chunk_size()?;
        if self.top_k == 0 {
            return Err(EvalError::Configuration(
                "top_k must be greater than 0".to_string(),
            ));
        }
        if self.embedding_model.trim().is_empty() {
            return Err(EvalError::Configuration(
                "embedding_model must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub session_id: String,
}

/// Structural inputs that identify a processed document. Session ids are not
/// part of it, so entries are shared across sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DocumentFingerprint {
    pub file_name: String,
    pub chunking_strategy: ChunkingStrategy,
    pub embedding_model: String,
    #[serde(flatten)]
    pub sizes: ChunkSizes,
}

impl DocumentFingerprint {
    pub fn new(document: &Document, configuration: &Configuration) -> Self {
        Self {
            file_name: document.name.clone(),
            chunking_strategy: configuration.chunking_strategy,
            embedding_model: configuration.embedding_model.clone(),
            sizes: configuration.sizes,
        }
    }

    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.file_name.as_bytes());
        hasher.update([0]);
        hasher.update(self.chunking_strategy.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.embedding_model.as_bytes());
        for size in [
            self.sizes.token_size,
            self.sizes.sentence_size,
            self.sizes.paragraph_size,
            self.sizes.page_size,
        ] {
            match size {
                Some(value) => {
                    hasher.update([1]);
                    hasher.update((value as u64).to_le_bytes());
                }
                None => hasher.update([0]),
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedDocument {
    pub key: String,
    pub fingerprint: DocumentFingerprint,
    pub full_text: String,
    pub pages: Vec<String>,
    pub chunks: Vec<String>,
    pub embeddings: Vec<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// A retrieved chunk as recorded in a response. `chunk_number` is the
/// 1-indexed position within the processed document, `rank` the 1-indexed
/// position among the retrieved chunks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_number: usize,
    pub rank: usize,
    pub text: String,
    pub similarity_score: f64,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RusMetrics {
    pub rus: f64,
    pub normalized_dcr: f64,
    pub scaled_correlation: f64,
    pub wasted_similarity_penalty: f64,
    /// False when the rank correlation was undefined and the neutral
    /// fallback was used.
    pub correlation_defined: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelevanceWarning {
    MissingChunk { chunk_number: usize },
    SumMismatch { total: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRef {
    pub technique: ProjectionTechnique,
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    Failed { stage: Stage, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmResponse {
    pub configuration_id: String,
    pub document_id: String,
    pub question_id: String,
    pub question: String,
    pub answer: String,
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub visualizations: Vec<ArtifactRef>,
    pub metrics: Option<RusMetrics>,
    #[serde(default)]
    pub warnings: Vec<RelevanceWarning>,
    pub status: ResponseStatus,
    pub created_at: DateTime<Utc>,
}

impl LlmResponse {
    pub fn failed(triple: &Triple, question: &str, stage: Stage, error: &EvalError) -> Self {
        Self {
            configuration_id: triple.configuration_id.clone(),
            document_id: triple.document_id.clone(),
            question_id: triple.question_id.clone(),
            question: question.to_string(),
            answer: String::new(),
            chunks: Vec::new(),
            visualizations: Vec::new(),
            metrics: None,
            warnings: Vec::new(),
            status: ResponseStatus::Failed {
                stage,
                message: error.to_string(),
            },
            created_at: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, ResponseStatus::Completed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(default)]
    pub configurations: Vec<Configuration>,
    #[serde(default)]
    pub responses: Vec<LlmResponse>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            documents: Vec::new(),
            questions: Vec::new(),
            configurations: Vec::new(),
            responses: Vec::new(),
            last_run_at: None,
        }
    }
}

/// One cell of the configuration x document x question matrix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Triple {
    pub configuration_id: String,
    pub document_id: String,
    pub question_id: String,
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(configuration={}, document={}, question={})",
            self.configuration_id, self.document_id, self.question_id
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    Process,
    EmbedQuery,
    Similarity,
    TopK,
    Generate,
    Score,
    Visualize,
    Record,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Process => "process",
            Self::EmbedQuery => "embed_query",
            Self::Similarity => "similarity",
            Self::TopK => "top_k",
            Self::Generate => "generate",
            Self::Score => "score",
            Self::Visualize => "visualize",
            Self::Record => "record",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionTechnique {
    Pca,
    Tsne,
}

impl ProjectionTechnique {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pca => "pca",
            Self::Tsne => "tsne",
        }
    }
}

impl fmt::Display for ProjectionTechnique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectionTechnique {
    type Err = EvalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pca" => Ok(Self::Pca),
            "tsne" | "t-sne" | "t_sne" => Ok(Self::Tsne),
            other => Err(EvalError::Configuration(format!(
                "unknown projection technique '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the whole run on the first failing triple.
    FailFast,
    /// Record a failed response for the triple and keep going.
    Continue,
}

#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub max_concurrency: usize,
    pub call_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub failure_policy: FailurePolicy,
    pub projections: Vec<ProjectionTechnique>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            call_timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            failure_policy: FailurePolicy::FailFast,
            projections: vec![ProjectionTechnique::Pca, ProjectionTechnique::Tsne],
        }
    }
}
