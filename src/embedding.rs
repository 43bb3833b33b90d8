//! Embedding and generation providers over the OpenRouter HTTP API.
//!
//! Both providers share one retry policy: bounded exponential backoff
//! (delay = base × 2^attempt) for rate limits, timeouts, connection
//! failures, and the retryable 5xx statuses; every other failure is
//! returned immediately. Responses are validated before use: an embedding
//! response must carry exactly one row per input text and every row must
//! have the configured dimension.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::{EmbeddingConfig, GenerationConfig};

/// HTTP statuses worth retrying. Everything else fails immediately.
const RETRYABLE_STATUS_CODES: [u16; 5] = [429, 500, 502, 503, 504];

/// Fixed system instruction for answer generation.
pub const SYSTEM_PROMPT: &str = "Отвечай на русском языке.";

#[derive(Debug, Clone, Error)]
#[error("{message} (model={model}, stage={stage})")]
pub struct EmbeddingError {
    pub model: String,
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, Error)]
#[error("{message} (model={model})")]
pub struct GenerationError {
    pub model: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Batched text embedding behind a stable model identifier.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut rows = self.embed_texts(&[text.to_string()]).await?;
        rows.pop().ok_or_else(|| EmbeddingError {
            model: self.model().to_string(),
            stage: "response".to_string(),
            message: "empty embedding response".to_string(),
        })
    }
}

/// Chat-completion answer generation.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model(&self) -> &str;
    async fn generate(
        &self,
        prompt: &str,
        history: &[ChatMessage],
    ) -> Result<String, GenerationError>;
}

enum RequestFailure {
    Retryable(String),
    Fatal(String),
}

pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    embedding: EmbeddingConfig,
    generation: GenerationConfig,
}

impl OpenRouterClient {
    /// The API key is resolved once at construction from the environment
    /// variable named in the config.
    pub fn from_config(embedding: &EmbeddingConfig, generation: &GenerationConfig) -> Result<Self> {
        let api_key = match std::env::var(&embedding.api_key_env) {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("{} environment variable not set", embedding.api_key_env),
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(embedding.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: embedding.base_url.trim_end_matches('/').to_string(),
            api_key,
            embedding: embedding.clone(),
            generation: generation.clone(),
        })
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.embedding.retry_base_ms.saturating_mul(1u64 << attempt))
    }

    async fn post_with_retries(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RequestFailure> {
        let mut last_detail = String::new();
        let attempts = self.embedding.max_retries + 1;

        for attempt in 0..attempts {
            match self.post_once(url, body, timeout).await {
                Ok(json) => return Ok(json),
                Err(RequestFailure::Fatal(detail)) => return Err(RequestFailure::Fatal(detail)),
                Err(RequestFailure::Retryable(detail)) => {
                    last_detail = detail;
                    if attempt + 1 < attempts {
                        let delay = self.delay_for_attempt(attempt);
                        debug!(attempt = attempt + 1, ?delay, "retrying provider request");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(RequestFailure::Retryable(format!(
            "failed after {attempts} attempt(s): {last_detail}"
        )))
    }

    async fn post_once(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RequestFailure> {
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    RequestFailure::Retryable(e.to_string())
                } else {
                    RequestFailure::Fatal(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| RequestFailure::Fatal(format!("invalid JSON response: {e}")));
        }

        let detail = response.text().await.unwrap_or_default();
        let detail = format!("HTTP {}: {}", status.as_u16(), detail.trim());
        if RETRYABLE_STATUS_CODES.contains(&status.as_u16()) {
            Err(RequestFailure::Retryable(detail))
        } else {
            Err(RequestFailure::Fatal(detail))
        }
    }

    fn embedding_error(&self, stage: &str, message: String) -> EmbeddingError {
        EmbeddingError {
            model: self.embedding.model.clone(),
            stage: stage.to_string(),
            message,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenRouterClient {
    fn model(&self) -> &str {
        &self.embedding.model
    }

    fn dimension(&self) -> usize {
        self.embedding.dimension
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        // The API rejects empty strings; embed a single space instead.
        let payload: Vec<&str> = texts
            .iter()
            .map(|t| if t.trim().is_empty() { " " } else { t.as_str() })
            .collect();

        let body = serde_json::json!({
            "model": self.embedding.model,
            "input": payload,
        });
        let url = format!("{}/embeddings", self.base_url);
        let timeout = Duration::from_secs(self.embedding.timeout_secs);

        let json = self
            .post_with_retries(&url, &body, timeout)
            .await
            .map_err(|failure| match failure {
                RequestFailure::Retryable(detail) => self.embedding_error(
                    "request",
                    format!("Embedding request {detail}"),
                ),
                RequestFailure::Fatal(detail) => {
                    self.embedding_error("request", format!("Embedding request failed: {detail}"))
                }
            })?;

        let rows = parse_embedding_rows(&json)
            .map_err(|detail| self.embedding_error("response", detail))?;
        validate_embedding_rows(&rows, texts.len(), self.embedding.dimension)
            .map_err(|detail| self.embedding_error("response", detail))?;
        Ok(rows)
    }
}

#[async_trait]
impl GenerationProvider for OpenRouterClient {
    fn model(&self) -> &str {
        &self.generation.model
    }

    async fn generate(
        &self,
        prompt: &str,
        history: &[ChatMessage],
    ) -> Result<String, GenerationError> {
        let messages = build_messages(prompt, history);
        let body = serde_json::json!({
            "model": self.generation.model,
            "messages": messages,
            "temperature": self.generation.temperature,
            "max_tokens": self.generation.max_tokens,
        });
        let url = format!("{}/chat/completions", self.base_url);
        let timeout = Duration::from_secs(self.generation.timeout_secs);

        let error = |message: String| GenerationError {
            model: self.generation.model.clone(),
            message,
        };

        let json = self
            .post_with_retries(&url, &body, timeout)
            .await
            .map_err(|failure| match failure {
                RequestFailure::Retryable(detail) => {
                    error(format!("Generation request {detail}"))
                }
                RequestFailure::Fatal(detail) => {
                    error(format!("Generation request failed: {detail}"))
                }
            })?;

        let content = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| error("generation response carries no content".to_string()))?;
        Ok(content.to_string())
    }
}

/// System instruction first, then dialogue history, then the user prompt.
fn build_messages(prompt: &str, history: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::new("system", SYSTEM_PROMPT));
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage::new("user", prompt));
    messages
}

fn parse_embedding_rows(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, String> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| "embedding response carries no data array".to_string())?;

    let mut rows = Vec::with_capacity(data.len());
    for item in data {
        let row = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| "embedding response row carries no vector".to_string())?;
        rows.push(row.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect());
    }
    Ok(rows)
}

fn validate_embedding_rows(
    rows: &[Vec<f32>],
    expected_count: usize,
    expected_dimension: usize,
) -> Result<(), String> {
    if rows.len() != expected_count {
        return Err(format!(
            "embedding response carries {} rows for {} inputs",
            rows.len(),
            expected_count
        ));
    }
    if let Some(bad) = rows.iter().find(|r| r.len() != expected_dimension) {
        return Err(format!(
            "embedding row has dimension {}, expected {}",
            bad.len(),
            expected_dimension
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_set_is_exact() {
        for code in [429u16, 500, 502, 503, 504] {
            assert!(RETRYABLE_STATUS_CODES.contains(&code));
        }
        for code in [400u16, 401, 403, 404, 501] {
            assert!(!RETRYABLE_STATUS_CODES.contains(&code));
        }
    }

    #[test]
    fn parses_and_validates_embedding_rows() {
        let json = serde_json::json!({
            "data": [
                {"embedding": [0.1, 0.2]},
                {"embedding": [0.3, 0.4]},
            ]
        });
        let rows = parse_embedding_rows(&json).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(validate_embedding_rows(&rows, 2, 2).is_ok());
        assert!(validate_embedding_rows(&rows, 3, 2).is_err());
        assert!(validate_embedding_rows(&rows, 2, 1536).is_err());
    }

    #[test]
    fn missing_data_array_is_an_error() {
        let json = serde_json::json!({"error": "nope"});
        assert!(parse_embedding_rows(&json).is_err());
    }

    #[test]
    fn messages_wrap_history_between_system_and_user() {
        let history = vec![
            ChatMessage::new("user", "прошлый вопрос"),
            ChatMessage::new("assistant", "прошлый ответ"),
        ];
        let messages = build_messages("новый вопрос", &history);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, SYSTEM_PROMPT);
        assert_eq!(messages[1].content, "прошлый вопрос");
        assert_eq!(messages[3].role, "user");
        assert_eq!(messages[3].content, "новый вопрос");
    }

    #[test]
    fn error_display_names_model_and_stage() {
        let err = EmbeddingError {
            model: "openai/text-embedding-3-small".to_string(),
            stage: "request".to_string(),
            message: "Embedding request failed after 3 attempt(s): HTTP 503".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("model=openai/text-embedding-3-small"));
        assert!(rendered.contains("stage=request"));
        assert!(rendered.starts_with("Embedding request failed after 3 attempt(s)"));
    }
}
