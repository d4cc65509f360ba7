use crate::models::{Stage, Triple};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("provider {provider} failed: {details}")]
    Provider {
        provider: String,
        details: String,
        transient: bool,
    },

    #[error("invalid response from {provider}: {details}")]
    Parse { provider: String, details: String },

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("cache unavailable: {0}")]
    Cache(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("external call timed out after {0:?}")]
    Timeout(Duration),

    #[error("run cancelled")]
    Cancelled,

    #[error("tokenizer unavailable: {0}")]
    Tokenizer(String),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl EvalError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn parse(provider: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Parse {
            provider: provider.into(),
            details: details.into(),
        }
    }

    /// Only network-class failures are worth another attempt. A malformed
    /// response will be just as malformed the second time.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider { transient, .. } => *transient,
            Self::Timeout(_) => true,
            Self::Http(error) => error.is_timeout() || error.is_connect() || error.is_request(),
            _ => false,
        }
    }
}

/// The first failure of a pipeline run, naming the stage and the triple it
/// happened in.
#[derive(Debug, Error)]
#[error(
    "{stage} stage failed{}: {source}",
    .triple.as_ref().map(|triple| format!(" for {triple}")).unwrap_or_default()
)]
pub struct PipelineError {
    pub stage: Stage,
    pub triple: Option<Triple>,
    #[source]
    pub source: EvalError,
}

impl PipelineError {
    pub fn new(stage: Stage, triple: Option<Triple>, source: EvalError) -> Self {
        Self {
            stage,
            triple,
            source,
        }
    }
}

pub type Result<T, E = EvalError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_are_never_transient() {
        assert!(!EvalError::parse("openai", "missing answer").is_transient());
        assert!(!EvalError::Configuration("top_k".to_string()).is_transient());
    }

    #[test]
    fn rate_limits_and_timeouts_are_transient() {
        let limited = EvalError::Provider {
            provider: "openai".to_string(),
            details: "429".to_string(),
            transient: true,
        };
        assert!(limited.is_transient());
        assert!(EvalError::Timeout(Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn pipeline_error_names_stage_and_triple() {
        let error = PipelineError::new(
            Stage::Generate,
            Some(Triple {
                configuration_id: "cfg".to_string(),
                document_id: "doc".to_string(),
                question_id: "q".to_string(),
            }),
            EvalError::Generation("quota".to_string()),
        );
        let message = error.to_string();
        assert!(message.starts_with("generate stage failed for"));
        assert!(message.contains("configuration=cfg"));
        assert!(message.contains("quota"));
    }
}
