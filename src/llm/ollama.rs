//! Generator for Ollama's native chat API.

use super::{normalize_base_url, parse_retry_after, LlmRequest, LlmResponse, TextGenerator};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument};

/// Talks to `POST {base_url}/api/chat` with `stream: false`.
///
/// JSON mode maps to Ollama's `"format": "json"`.
#[derive(Debug, Clone)]
pub struct OllamaGenerator {
    client: Client,
    base_url: String,
}

impl OllamaGenerator {
    /// Build with a fresh client and a 120 second request timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(120)).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: normalize_base_url(&base_url.into()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_body(request: &LlmRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });
        if request.json_mode {
            body["format"] = json!("json");
        }
        body
    }

    fn extract_metadata(resp: &Value) -> Option<Value> {
        let meta: serde_json::Map<String, Value> = ["model", "total_duration", "eval_count", "prompt_eval_count"]
            .iter()
            .filter_map(|k| resp.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect();
        (!meta.is_empty()).then_some(Value::Object(meta))
    }
}

#[async_trait]
impl TextGenerator for OllamaGenerator {
    #[instrument(skip_all, fields(stage = %request.stage, model = %request.model))]
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/api/chat", self.base_url);
        let body = Self::build_body(request);

        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::HttpError {
                status,
                body,
                retry_after,
            });
        }

        let json_resp: Value = resp.json().await?;
        let text = json_resp
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        debug!(chars = text.len(), "ollama reply received");

        Ok(LlmResponse {
            text,
            status,
            metadata: Self::extract_metadata(&json_resp),
        })
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StageId;

    fn request() -> LlmRequest {
        LlmRequest {
            system_prompt: Some("You are a SQL expert.".into()),
            json_mode: true,
            ..LlmRequest::new(StageId::Generate, "llama3.2:3b", "Write SQL")
        }
    }

    #[test]
    fn test_chat_body() {
        let body = OllamaGenerator::build_body(&request());
        assert_eq!(body["model"], "llama3.2:3b");
        assert_eq!(body["stream"], false);
        assert_eq!(body["format"], "json");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Write SQL");
        assert_eq!(body["options"]["num_predict"], 2048);
    }

    #[test]
    fn test_free_text_body_has_no_format() {
        let req = LlmRequest::new(StageId::Summarize, "m", "Summarize");
        let body = OllamaGenerator::build_body(&req);
        assert!(body.get("format").is_none());
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_metadata_extraction() {
        let meta = OllamaGenerator::extract_metadata(&json!({"model": "m", "eval_count": 12, "message": {}}));
        assert_eq!(meta.unwrap()["eval_count"], 12);
        assert!(OllamaGenerator::extract_metadata(&json!({"message": {}})).is_none());
    }

    #[test]
    fn test_base_url_normalized() {
        let gen = OllamaGenerator::with_client(Client::new(), "http://localhost:11434/api/");
        assert_eq!(gen.base_url(), "http://localhost:11434");
    }
}
