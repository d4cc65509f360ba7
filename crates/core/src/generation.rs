use crate::error::EvalError;
use crate::http::{self, HttpProviderConfig};
use crate::models::RelevanceWarning;
use crate::similarity::RankedChunk;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const GEMINI_DEFAULT_MODEL: &str = "gemini-2.0-flash";

const RELEVANCE_SUM_TOLERANCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
}

/// A chat-completion backend that must answer with a JSON object.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the raw JSON text produced by the model.
    async fn complete(&self, prompt: &Prompt, api_key: &str) -> Result<String, EvalError>;
}

pub struct OpenAiChatBackend {
    model: String,
    config: HttpProviderConfig,
    client: Client,
}

impl OpenAiChatBackend {
    pub fn new(model: impl Into<String>, config: HttpProviderConfig) -> Self {
        Self {
            model: model.into(),
            config,
            client: http::client(),
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiChatBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt, api_key: &str) -> Result<String, EvalError> {
        let mut messages = Vec::new();
        if let Some(system) = &prompt.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt.user }));

        let response = self
            .client
            .post(self.config.endpoint("chat/completions")?)
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "response_format": { "type": "json_object" },
                "temperature": 0.2,
            }))
            .send()
            .await?;

        let body = http::read_json(&self.model, response).await?;
        body.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EvalError::parse(&self.model, "missing choices[0].message.content"))
    }
}

pub struct GeminiBackend {
    model: String,
    config: HttpProviderConfig,
    client: Client,
}

impl GeminiBackend {
    pub fn new(model: impl Into<String>, config: HttpProviderConfig) -> Self {
        Self {
            model: model.into(),
            config,
            client: http::client(),
        }
    }
}

#[async_trait]
impl LlmBackend for GeminiBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt, api_key: &str) -> Result<String, EvalError> {
        let text = match &prompt.system {
            Some(system) => format!("{system}\n\n{}", prompt.user),
            None => prompt.user.clone(),
        };

        let response = self
            .client
            .post(
                self.config
                    .endpoint(&format!("models/{}:generateContent", self.model))?,
            )
            .header("x-goog-api-key", api_key)
            .json(&json!({
                "contents": [ { "parts": [ { "text": text } ] } ],
                "generationConfig": { "response_mime_type": "application/json" },
            }))
            .send()
            .await?;

        let body = http::read_json(&self.model, response).await?;
        body.pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EvalError::Generation(format!("{} returned no candidates", self.model)))
    }
}

/// Generation backends keyed by model identifier, chosen once per run.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn LlmBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(openai: HttpProviderConfig, gemini: HttpProviderConfig) -> Self {
        Self::new()
            .register(
                OPENAI_DEFAULT_MODEL,
                Arc::new(OpenAiChatBackend::new(OPENAI_DEFAULT_MODEL, openai)),
            )
            .register(
                GEMINI_DEFAULT_MODEL,
                Arc::new(GeminiBackend::new(GEMINI_DEFAULT_MODEL, gemini)),
            )
    }

    pub fn register(mut self, model: impl Into<String>, backend: Arc<dyn LlmBackend>) -> Self {
        self.backends.insert(model.into(), backend);
        self
    }

    pub fn resolve(&self, model: &str) -> Result<Arc<dyn LlmBackend>, EvalError> {
        self.backends.get(model).cloned().ok_or_else(|| {
            let mut known = self.backends.keys().cloned().collect::<Vec<_>>();
            known.sort();
            EvalError::Configuration(format!(
                "unknown generation model '{model}', expected one of: {}",
                known.join(", ")
            ))
        })
    }

    pub fn models(&self) -> Vec<String> {
        let mut models = self.backends.keys().cloned().collect::<Vec<_>>();
        models.sort();
        models
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelevanceEntry {
    pub chunk_number: usize,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgeReply {
    pub answer: String,
    pub relevance_analysis: Vec<RelevanceEntry>,
}

/// Answers a question from retrieved context and partitions relevance across
/// the retrieved chunks. Chunk numbers in the reply are rank positions.
#[async_trait]
pub trait RelevanceJudge: Send + Sync {
    async fn ask(
        &self,
        query: &str,
        context: &[RankedChunk],
        model: &str,
        api_key: &str,
    ) -> Result<JudgeReply, EvalError>;
}

pub struct LlmRelevanceJudge {
    registry: BackendRegistry,
}

impl LlmRelevanceJudge {
    pub fn new(registry: BackendRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RelevanceJudge for LlmRelevanceJudge {
    async fn ask(
        &self,
        query: &str,
        context: &[RankedChunk],
        model: &str,
        api_key: &str,
    ) -> Result<JudgeReply, EvalError> {
        let backend = self.registry.resolve(model)?;
        let prompt = relevance_prompt(query, &format_context(context));
        let raw = backend.complete(&prompt, api_key).await?;
        parse_reply(backend.name(), &raw)
    }
}

/// Tags each chunk with its rank among the retrieved chunks.
pub fn format_context(chunks: &[RankedChunk]) -> String {
    let body = chunks
        .iter()
        .enumerate()
        .map(|(position, chunk)| format!("Chunk {}:\n{}\n\n", position + 1, chunk.text))
        .collect::<String>();
    format!("CONTEXT:\n{body}\n")
}

pub fn relevance_prompt(query: &str, context: &str) -> Prompt {
    let user = format!(
        r#"{context}
Based purely on the above context, respond with a valid JSON object containing:

1. An "answer" field with your response to: {query}

2. A "relevance_analysis" array of objects, each containing:
   - "chunk_number": the chunk number referenced
   - "relevance_score": percentage (0-100) of relevance

Ensure:
- The relevance scores of all chunks sum to 100.
- Unused chunks get 0 relevance; if only one chunk is used it gets 100.
- Every chunk appears in relevance_analysis, in the same order as the context, even with 0 relevance.
- The response is a VALID JSON object without additional text.

JSON RESPONSE FORMAT:
{{
  "answer": "your comprehensive answer here",
  "relevance_analysis": [
    {{ "chunk_number": 1, "relevance_score": 65 }},
    ...
  ]
}}"#
    );

    Prompt {
        system: Some(
            "You are a helpful assistant that answers questions based on the provided context."
                .to_string(),
        ),
        user,
    }
}

pub fn parse_reply(provider: &str, raw: &str) -> Result<JudgeReply, EvalError> {
    let value = http::parse_json_payload(provider, raw)?;
    serde_json::from_value(value)
        .map_err(|error| EvalError::parse(provider, format!("unexpected reply shape: {error}")))
}

/// Relevance percentages in rank order, plus what had to be tolerated to get
/// them.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRelevance {
    pub scores: Vec<f64>,
    pub warnings: Vec<RelevanceWarning>,
}

/// Maps a reply onto the `retrieved` ranks. Out-of-range, duplicate or
/// out-of-bounds scores are parse errors; omitted chunks count as 0 and a
/// total other than 100 is kept as reported, both with a warning.
pub fn validate_relevance(
    provider: &str,
    reply: &JudgeReply,
    retrieved: usize,
) -> Result<ValidatedRelevance, EvalError> {
    let mut slots: Vec<Option<f64>> = vec![None; retrieved];

    for entry in &reply.relevance_analysis {
        if entry.chunk_number == 0 || entry.chunk_number > retrieved {
            return Err(EvalError::parse(
                provider,
                format!(
                    "chunk_number {} is outside 1..={retrieved}",
                    entry.chunk_number
                ),
            ));
        }
        if !(0.0..=100.0).contains(&entry.relevance_score) {
            return Err(EvalError::parse(
                provider,
                format!(
                    "relevance_score {} for chunk {} is outside 0..=100",
                    entry.relevance_score, entry.chunk_number
                ),
            ));
        }
        if slots[entry.chunk_number - 1]
            .replace(entry.relevance_score)
            .is_some()
        {
            return Err(EvalError::parse(
                provider,
                format!("chunk_number {} appears more than once", entry.chunk_number),
            ));
        }
    }

    let mut warnings = Vec::new();
    let scores = slots
        .into_iter()
        .enumerate()
        .map(|(position, slot)| {
            slot.unwrap_or_else(|| {
                warnings.push(RelevanceWarning::MissingChunk {
                    chunk_number: position + 1,
                });
                0.0
            })
        })
        .collect::<Vec<_>>();

    let total: f64 = scores.iter().sum();
    if retrieved > 0 && (total - 100.0).abs() > RELEVANCE_SUM_TOLERANCE {
        warnings.push(RelevanceWarning::SumMismatch { total });
    }

    Ok(ValidatedRelevance { scores, warnings })
}
