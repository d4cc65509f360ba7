use crate::error::EvalError;
use reqwest::{Client, Response};
use serde_json::Value;
use url::Url;

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: Url,
    pub api_key: Option<String>,
}

impl HttpProviderConfig {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, EvalError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let api_key = api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        Ok(Self { base_url, api_key })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, EvalError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }
}

pub fn client() -> Client {
    Client::new()
}

/// Reads a JSON body from a successful response, or classifies the failure.
/// 429 and 5xx are transient; every other non-success status is not.
pub async fn read_json(provider: &str, response: Response) -> Result<Value, EvalError> {
    let status = response.status();
    if status.is_success() {
        let body = response.text().await?;
        return serde_json::from_str(&body)
            .map_err(|error| EvalError::parse(provider, format!("body is not json: {error}")));
    }

    let body = response.text().await.unwrap_or_default();
    Err(EvalError::Provider {
        provider: provider.to_string(),
        details: format!("status {status}: {}", truncate(&body, 400)),
        transient: status.as_u16() == 429 || status.is_server_error(),
    })
}

/// Pulls the first JSON object out of model output, tolerating markdown
/// code fences around it.
pub fn parse_json_payload(provider: &str, raw: &str) -> Result<Value, EvalError> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    let value: Value = serde_json::from_str(unfenced)
        .map_err(|error| EvalError::parse(provider, format!("output is not valid json: {error}")))?;

    if let Some(message) = value.get("error").and_then(Value::as_str) {
        return Err(EvalError::Generation(format!("{provider}: {message}")));
    }
    if !value.is_object() {
        return Err(EvalError::parse(provider, "expected a json object"));
    }
    Ok(value)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
