use crate::error::EvalError;
use crate::http::{self, HttpProviderConfig};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;
pub const LOCAL_NGRAM_MODEL: &str = "local-ngram";

/// Strings to vectors, one vector per input in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, EvalError>;
}

/// Deterministic hashed character-trigram embedder. Needs no network and is
/// used for offline runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for character in window {
                let mut buffer = [0u8; 4];
                for byte in character.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn name(&self) -> &str {
        LOCAL_NGRAM_MODEL
    }

    async fn embed(&self, texts: &[String], _model: &str) -> Result<Vec<Vec<f32>>, EvalError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// OpenAI-compatible `POST /embeddings` client. Sends inputs in batches and
/// restores input order from each item's `index`.
pub struct OpenAiEmbedder {
    config: HttpProviderConfig,
    client: Client,
    batch_size: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: HttpProviderConfig, batch_size: usize) -> Self {
        Self {
            config,
            client: http::client(),
            batch_size: batch_size.max(1),
        }
    }

    async fn embed_batch(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, EvalError> {
        let api_key = self.config.api_key.as_deref().ok_or_else(|| EvalError::Provider {
            provider: "openai-embeddings".to_string(),
            details: "api key is not configured".to_string(),
            transient: false,
        })?;

        let response = self
            .client
            .post(self.config.endpoint("embeddings")?)
            .bearer_auth(api_key)
            .json(&json!({ "model": model, "input": texts }))
            .send()
            .await?;

        let body = http::read_json("openai-embeddings", response).await?;
        parse_embedding_response(&body, texts.len())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn name(&self) -> &str {
        "openai-embeddings"
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, EvalError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_batch(batch, model).await?);
        }
        Ok(vectors)
    }
}

fn parse_embedding_response(body: &Value, expected: usize) -> Result<Vec<Vec<f32>>, EvalError> {
    let invalid = |details: &str| EvalError::parse("openai-embeddings", details);

    let data = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing data array"))?;

    if data.len() != expected {
        return Err(invalid(&format!(
            "expected {expected} embeddings, got {}",
            data.len()
        )));
    }

    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|index| index as usize)
            .unwrap_or(position);
        let values = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("missing embedding"))?
            .iter()
            .map(|value| value.as_f64().map(|number| number as f32))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| invalid("embedding contains a non-numeric value"))?;

        let slot = slots
            .get_mut(index)
            .ok_or_else(|| invalid(&format!("embedding index {index} out of range")))?;
        if slot.replace(values).is_some() {
            return Err(invalid(&format!("duplicate embedding index {index}")));
        }
    }

    slots
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| invalid("embedding indices are incomplete"))
}

/// Selects a provider by embedding model identifier. The first registered
/// prefix that matches wins.
#[derive(Default, Clone)]
pub struct EmbeddingRegistry {
    providers: Vec<(String, Arc<dyn EmbeddingProvider>)>,
}

impl EmbeddingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, model_prefix: impl Into<String>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.providers.push((model_prefix.into(), provider));
        self
    }

    pub fn resolve(&self, model: &str) -> Result<&Arc<dyn EmbeddingProvider>, EvalError> {
        self.providers
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map(|(_, provider)| provider)
            .ok_or_else(|| {
                EvalError::Configuration(format!("no embedding provider for model '{model}'"))
            })
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingRegistry {
    fn name(&self) -> &str {
        "registry"
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, EvalError> {
        let provider = self.resolve(model)?;
        let vectors = provider.embed(texts, model).await?;
        if vectors.len() != texts.len() {
            return Err(EvalError::parse(
                provider.name(),
                format!("expected {} embeddings, got {}", texts.len(), vectors.len()),
            ));
        }
        Ok(vectors)
    }
}
