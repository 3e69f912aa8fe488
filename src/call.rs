//! One text-generation call made on behalf of a stage.
//!
//! [`StructuredCall`] renders a prompt template, sends it through the
//! context's generator with transport retry, and decodes the reply against
//! the stage's [`StageSchema`]. Transport failures come back as `Err`;
//! what the stage does with them is up to the stage.

use crate::context::StageCtx;
use crate::error::Result;
use crate::events::Event;
use crate::graph::StageId;
use crate::llm::{with_backoff, LlmRequest};
use crate::parser::{self, extract, ParseTier, ParsedReply, StageSchema};
use crate::prompts;
use std::time::Duration;
use tracing::{debug, warn};

/// A prompt bound to a stage, ready to send.
///
/// ```
/// use sql_agent::call::StructuredCall;
/// use sql_agent::graph::StageId;
///
/// let call = StructuredCall::new(StageId::Summarize, "Answer: {question}")
///     .var("question", "How many orders?");
/// assert_eq!(call.prompt(), "Answer: How many orders?");
/// ```
#[derive(Debug, Clone)]
pub struct StructuredCall {
    stage: StageId,
    template: &'static str,
    vars: Vec<(&'static str, String)>,
}

impl StructuredCall {
    pub fn new(stage: StageId, template: &'static str) -> Self {
        Self {
            stage,
            template,
            vars: Vec::new(),
        }
    }

    pub fn var(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.vars.push((key, value.into()));
        self
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// The rendered prompt text.
    pub fn prompt(&self) -> String {
        prompts::render(self.template, &self.vars)
    }

    fn request(&self, ctx: &StageCtx, json_mode: bool) -> LlmRequest {
        let config = &ctx.config;
        LlmRequest {
            stage: self.stage,
            model: config.model_for(self.stage).to_string(),
            system_prompt: None,
            prompt: self.prompt(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            json_mode,
        }
    }

    async fn complete(&self, ctx: &StageCtx, json_mode: bool) -> Result<String> {
        let request = self.request(ctx, json_mode);
        let stage = self.stage;

        let mut on_retry = |attempt: u32, delay: Duration, reason: &str| {
            ctx.emit(Event::TransportRetry {
                stage,
                attempt,
                delay_ms: delay.as_millis() as u64,
                reason: reason.to_string(),
            });
        };

        let response = with_backoff(
            ctx.generator.as_ref(),
            &request,
            &ctx.backoff,
            ctx.cancel_flag(),
            Some(&mut on_retry),
        )
        .await
        .inspect_err(|e| warn!(%stage, error = %e, "text generation failed"))?;

        debug!(%stage, chars = response.text.len(), "text generation finished");
        Ok(response.text)
    }

    /// Ask for JSON and decode it against `schema`.
    ///
    /// Decoding itself never fails; anything short of a strict decode is
    /// logged and reported as [`Event::ParseFallback`].
    pub async fn parse(&self, ctx: &StageCtx, schema: &StageSchema) -> Result<ParsedReply> {
        let raw = self.complete(ctx, ctx.config.json_mode).await?;
        let reply = parser::parse_reply(&raw, schema);

        match reply.tier {
            ParseTier::Strict => {}
            ParseTier::Defaulted => {
                warn!(stage = %self.stage, schema = schema.name(), "reply had no recognizable fields");
                ctx.emit(Event::ParseFallback {
                    stage: self.stage,
                    tier: reply.tier,
                });
            }
            tier => {
                debug!(stage = %self.stage, tier = tier.as_str(), "reply needed tolerant decoding");
                ctx.emit(Event::ParseFallback {
                    stage: self.stage,
                    tier,
                });
            }
        }
        Ok(reply)
    }

    /// Ask for free text. Reasoning tags are removed and whitespace trimmed.
    pub async fn text(&self, ctx: &StageCtx) -> Result<String> {
        let raw = self.complete(ctx, false).await?;
        Ok(extract::strip_think_tags(&raw).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{QueryRows, SchemaIntrospector, SqlExecutor};
    use crate::config::AgentConfig;
    use crate::events::FnEventHandler;
    use crate::llm::ScriptedGenerator;
    use crate::state::DbInfo;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    struct NoDb;

    #[async_trait]
    impl SchemaIntrospector for NoDb {
        async fn list_tables(&self) -> Result<DbInfo> {
            Ok(DbInfo::new())
        }
    }

    #[async_trait]
    impl SqlExecutor for NoDb {
        async fn run(&self, _sql: &str) -> Result<QueryRows> {
            Ok(QueryRows::default())
        }
    }

    fn schema() -> StageSchema {
        StageSchema::new("generate")
            .text("sql_query", "")
            .text("explanation", "")
    }

    #[tokio::test]
    async fn test_parse_uses_stage_model_and_config() {
        let generator = Arc::new(
            ScriptedGenerator::new().reply(StageId::Generate, r#"{"sql_query": "SELECT 1"}"#),
        );
        let config = AgentConfig::default()
            .with_temperature(0.3)
            .with_stage_model(StageId::Generate, "sqlcoder");
        let ctx = StageCtx::builder(generator.clone())
            .database(Arc::new(NoDb))
            .config(config)
            .build()
            .unwrap();

        let reply = StructuredCall::new(StageId::Generate, "q={q}")
            .var("q", "count")
            .parse(&ctx, &schema())
            .await
            .unwrap();

        assert_eq!(reply.tier, ParseTier::Strict);
        assert_eq!(reply.fields.get_text("sql_query"), "SELECT 1");
        let calls = generator.calls();
        assert_eq!(calls[0].model, "sqlcoder");
        assert_eq!(calls[0].prompt, "q=count");
        assert!(calls[0].json_mode);
        assert!((calls[0].temperature - 0.3).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_parse_fallback_emits_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let generator = Arc::new(
            ScriptedGenerator::new().reply(StageId::Generate, "```json\n{'sql_query': 'SELECT 2',}\n```"),
        );
        let ctx = StageCtx::builder(generator)
            .database(Arc::new(NoDb))
            .event_handler(Arc::new(FnEventHandler(move |e: Event| {
                if let Event::ParseFallback { tier, .. } = e {
                    sink.lock().unwrap().push(tier);
                }
            })))
            .build()
            .unwrap();

        let reply = StructuredCall::new(StageId::Generate, "go")
            .parse(&ctx, &schema())
            .await
            .unwrap();
        assert_eq!(reply.fields.get_text("sql_query"), "SELECT 2");
        assert_eq!(seen.lock().unwrap().as_slice(), [ParseTier::Unwrapped]);
    }

    #[tokio::test]
    async fn test_text_strips_reasoning() {
        let generator = Arc::new(
            ScriptedGenerator::new().reply(StageId::Summarize, "<think>hmm</think>\n  There are 3 orders. "),
        );
        let ctx = StageCtx::builder(generator.clone())
            .database(Arc::new(NoDb))
            .build()
            .unwrap();
        let text = StructuredCall::new(StageId::Summarize, "s").text(&ctx).await.unwrap();
        assert_eq!(text, "There are 3 orders.");
        assert!(!generator.calls()[0].json_mode);
    }

    #[tokio::test]
    async fn test_transport_error_surfaces() {
        let generator = Arc::new(ScriptedGenerator::new().http_error(StageId::Generate, 400));
        let ctx = StageCtx::builder(generator)
            .database(Arc::new(NoDb))
            .build()
            .unwrap();
        let err = StructuredCall::new(StageId::Generate, "go")
            .parse(&ctx, &schema())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::AgentError::HttpError { status: 400, .. }));
    }
}
