//! Text-generation providers and the transport retry loop.
//!
//! The [`TextGenerator`] trait is the single seam between the workflow and
//! a language model. Built-in implementations:
//!
//! ```text
//! StructuredCall ──► LlmRequest ──► with_backoff ──► TextGenerator::complete ──► LlmResponse
//!                                                          │
//!                                   ┌──────────────────────┼────────────────────┐
//!                            OllamaGenerator        OpenAiGenerator      ScriptedGenerator
//!                              /api/chat          /v1/chat/completions     canned replies
//! ```

pub mod backoff;
pub mod ollama;
#[cfg(feature = "openai")]
pub mod openai;
pub mod scripted;

pub use backoff::{BackoffConfig, JitterStrategy};
pub use ollama::OllamaGenerator;
#[cfg(feature = "openai")]
pub use openai::OpenAiGenerator;
pub use scripted::{ScriptedGenerator, ScriptedReply};

use crate::error::{AgentError, Result};
use crate::graph::StageId;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Callback invoked before each transport retry with
/// `(attempt, delay, reason)`.
pub type RetryCallback<'a> = Option<&'a mut (dyn FnMut(u32, Duration, &str) + Send)>;

/// A provider-agnostic generation request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Stage issuing the call. Used for logging and by [`ScriptedGenerator`].
    pub stage: StageId,
    pub model: String,
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Ask the provider to constrain output to JSON.
    pub json_mode: bool,
}

impl LlmRequest {
    pub fn new(stage: StageId, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            stage,
            model: model.into(),
            system_prompt: None,
            prompt: prompt.into(),
            temperature: 0.1,
            max_tokens: 2048,
            json_mode: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub status: u16,
    /// Provider-specific extras (token counts, timings).
    pub metadata: Option<serde_json::Value>,
}

impl LlmResponse {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: 200,
            metadata: None,
        }
    }
}

/// A language model the workflow can ask for text.
///
/// Object-safe; stages hold it as `Arc<dyn TextGenerator>`.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    fn name(&self) -> &'static str;
}

fn cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

/// Call `generator` with transport-level retry.
///
/// Returns the first successful response, or the last error once retries
/// run out or a non-retryable error occurs. The cancellation flag is checked
/// before each attempt and after each sleep.
pub async fn with_backoff(
    generator: &dyn TextGenerator,
    request: &LlmRequest,
    config: &BackoffConfig,
    cancel: Option<&AtomicBool>,
    mut on_retry: RetryCallback<'_>,
) -> Result<LlmResponse> {
    let mut attempt = 0u32;
    loop {
        if cancelled(cancel) {
            return Err(AgentError::Cancelled);
        }

        let err = match generator.complete(request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        if attempt >= config.max_retries || !config.retries(&err) {
            return Err(err);
        }

        let delay = config.delay_after(&err, attempt);
        attempt += 1;

        let reason = err.to_string();
        warn!(
            stage = %request.stage,
            generator = generator.name(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "retrying text generation"
        );
        if let Some(ref mut cb) = on_retry {
            cb(attempt, delay, &reason);
        }

        tokio::time::sleep(delay).await;
        debug!(stage = %request.stage, attempt, "retry sleep finished");
    }
}

/// Strip provider path suffixes so generators can append their own.
///
/// `https://api.openai.com/v1` becomes `https://api.openai.com`;
/// `http://localhost:11434/api` becomes `http://localhost:11434`.
pub(crate) fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    for suffix in ["/v1/chat/completions", "/v1", "/api/chat", "/api"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

/// Parse a `Retry-After` header given in whole seconds.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> BackoffConfig {
        BackoffConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..BackoffConfig::standard()
        }
    }

    fn request() -> LlmRequest {
        LlmRequest::new(StageId::Analyze, "test", "prompt")
    }

    #[tokio::test]
    async fn test_backoff_recovers_after_503() {
        let generator = ScriptedGenerator::new()
            .http_error(StageId::Analyze, 503)
            .reply(StageId::Analyze, "done");
        let mut retries = Vec::new();
        let mut cb = |attempt: u32, _: Duration, _: &str| retries.push(attempt);
        let resp = with_backoff(&generator, &request(), &quick(), None, Some(&mut cb))
            .await
            .unwrap();
        assert_eq!(resp.text, "done");
        assert_eq!(retries, vec![1]);
        assert_eq!(generator.calls_for(StageId::Analyze), 2);
    }

    #[tokio::test]
    async fn test_backoff_gives_up_after_max_retries() {
        let generator = ScriptedGenerator::new()
            .http_error(StageId::Analyze, 500)
            .http_error(StageId::Analyze, 500)
            .http_error(StageId::Analyze, 500)
            .reply(StageId::Analyze, "too late");
        let err = with_backoff(&generator, &request(), &quick(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::HttpError { status: 500, .. }));
        assert_eq!(generator.calls_for(StageId::Analyze), 3);
    }

    #[tokio::test]
    async fn test_backoff_skips_non_retryable() {
        let generator = ScriptedGenerator::new().http_error(StageId::Analyze, 400);
        let err = with_backoff(&generator, &request(), &quick(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::HttpError { status: 400, .. }));
        assert_eq!(generator.calls_for(StageId::Analyze), 1);
    }

    #[tokio::test]
    async fn test_backoff_honours_cancellation() {
        let generator = ScriptedGenerator::new().reply(StageId::Analyze, "never");
        let flag = AtomicBool::new(true);
        let err = with_backoff(&generator, &request(), &quick(), Some(&flag), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(generator.calls_for(StageId::Analyze), 0);
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("https://api.openai.com/v1/"), "https://api.openai.com");
        assert_eq!(normalize_base_url("http://localhost:11434/api"), "http://localhost:11434");
        assert_eq!(normalize_base_url("http://localhost:11434"), "http://localhost:11434");
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
