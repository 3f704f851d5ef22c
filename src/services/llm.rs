//! Chat-completion clients for the answer-synthesis LLM.
//!
//! Two providers are supported:
//! - Ollama: `POST {base}/api/chat` with `stream: false`
//! - any OpenAI-compatible API (DeepSeek, Groq, ...): `POST {base}/chat/completions`

use crate::{
    config::{Config, LlmProvider},
    error::{ApiError, Result},
    models::ChatMessage,
};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument};

lazy_static! {
    static ref THINK_BLOCK: Regex = Regex::new(r"(?s)<think>.*?</think>").unwrap();
    static ref JSON_FENCE: Regex = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<String>;

    fn model_name(&self) -> &str;
}

pub fn build_chat_model(config: &Config) -> Result<Arc<dyn ChatModel>> {
    let timeout = Duration::from_secs(config.llm_timeout_secs);
    let model: Arc<dyn ChatModel> = match config.llm_provider {
        LlmProvider::Ollama => Arc::new(OllamaChat::new(
            &config.llm_base_url,
            &config.llm_model,
            timeout,
        )?),
        LlmProvider::OpenAi => {
            let api_key = config.llm_api_key.as_deref().ok_or_else(|| {
                ApiError::ConfigError("llm_api_key is required for the openai provider".into())
            })?;
            Arc::new(OpenAiCompatibleChat::new(
                &config.llm_base_url,
                &config.llm_model,
                api_key,
                timeout,
            )?)
        }
    };

    info!(
        provider = ?config.llm_provider,
        model = %config.llm_model,
        "Chat model initialized"
    );
    Ok(model)
}

pub struct OllamaChat {
    client: Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

impl OllamaChat {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::InternalError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("{}/api/chat", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<String> {
        let body = OllamaChatRequest {
            model: &self.model,
            messages,
            stream: false,
            options: OllamaOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        };

        debug!("POST {}", self.url);
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::ModelError(format!("Ollama chat request failed: {}", e)))?;

        let response = ensure_success(response, &self.url).await?;
        let out: OllamaChatResponse = response.json().await.map_err(|e| {
            ApiError::ModelError(format!("Unexpected Ollama chat response: {}", e))
        })?;

        Ok(strip_reasoning(&out.message.content))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

pub struct OpenAiCompatibleChat {
    client: Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleChat {
    pub fn new(base_url: &str, model: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e| {
                ApiError::ConfigError(format!("Invalid API key header: {}", e))
            })?,
        );
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ApiError::InternalError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleChat {
    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<String> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        debug!("POST {}", self.url);
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::ModelError(format!("Chat completion request failed: {}", e)))?;

        let response = ensure_success(response, &self.url).await?;
        let out: CompletionResponse = response.json().await.map_err(|e| {
            ApiError::ModelError(format!("Unexpected chat completion response: {}", e))
        })?;

        let content = out
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ApiError::ModelError("Chat completion returned no choices".into()))?;

        Ok(strip_reasoning(&content))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

async fn ensure_success(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let snippet: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(240)
        .collect();
    Err(ApiError::ModelError(format!(
        "Unexpected HTTP status {} from {}: {}",
        status, url, snippet
    )))
}

/// Remove `<think>...</think>` reasoning blocks emitted by reasoning models.
pub fn strip_reasoning(text: &str) -> String {
    THINK_BLOCK.replace_all(text, "").trim().to_string()
}

/// Find the first JSON object in a model reply: a fenced block if present,
/// otherwise the outermost `{...}` span.
pub fn extract_json_block(text: &str) -> Option<serde_json::Value> {
    if let Some(captures) = JSON_FENCE.captures(text) {
        if let Ok(value) = serde_json::from_str(&captures[1]) {
            return Some(value);
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }

    serde_json::from_str::<serde_json::Value>(&text[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

/// Shorthand for the common "system prompt + user turn" request.
pub async fn ask(
    model: &dyn ChatModel,
    system: &str,
    user: &str,
    options: &ChatOptions,
) -> Result<String> {
    let messages = [ChatMessage::system(system), ChatMessage::user(user)];
    model.chat(&messages, options).await
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_reasoning_removes_blocks() {
        let text = "<think>\nthe user wants shoes\n</think>\n\nHere are some shoes.";
        assert_eq!(strip_reasoning(text), "Here are some shoes.");
        assert_eq!(strip_reasoning("plain"), "plain");
    }

    #[test]
    fn test_extract_fenced_json() {
        let reply = "Sure!\n```json\n{\"product_type\": \"Shoes\", \"price\": 50}\n```\nBye";
        assert_eq!(
            extract_json_block(reply),
            Some(json!({"product_type": "Shoes", "price": 50}))
        );
    }

    #[test]
    fn test_extract_bare_json() {
        let reply = "Result: {\"message\": \"hi\", \"query\": \"SELECT 1\"} done";
        assert_eq!(
            extract_json_block(reply),
            Some(json!({"message": "hi", "query": "SELECT 1"}))
        );
    }

    #[test]
    fn test_extract_json_none() {
        assert_eq!(extract_json_block("no json here"), None);
        assert_eq!(extract_json_block("} backwards {"), None);
    }

    #[test]
    fn test_chat_message_wire_format() {
        let value = serde_json::to_value(ChatMessage::system("be brief")).unwrap();
        assert_eq!(value, json!({"role": "system", "content": "be brief"}));
    }
}
