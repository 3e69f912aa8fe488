//! Deterministic text generator for tests and demos.
//!
//! [`ScriptedGenerator`] answers each stage from its own queue of canned
//! replies and records every request it receives, so tests can assert both
//! what the workflow did and which stages never reached the model.
//!
//! ```
//! use sql_agent::graph::StageId;
//! use sql_agent::llm::ScriptedGenerator;
//!
//! let generator = ScriptedGenerator::new()
//!     .reply(StageId::Analyze, r#"{"is_query_relevant": true}"#)
//!     .fail(StageId::Generate, "model offline");
//! assert_eq!(generator.pending(StageId::Analyze), 1);
//! ```

use super::{LlmRequest, LlmResponse, TextGenerator};
use crate::error::{AgentError, Result};
use crate::graph::StageId;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One canned outcome.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    /// An HTTP error with this status (retryable for 429/5xx).
    HttpError(u16),
    /// A non-retryable failure.
    Fail(String),
}

/// Per-stage queues of canned replies plus a call log.
///
/// A stage whose queue is empty gets an error, which the stage turns into
/// its documented default.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    queues: Mutex<HashMap<StageId, VecDeque<ScriptedReply>>>,
    calls: Mutex<Vec<LlmRequest>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, stage: StageId, reply: ScriptedReply) -> Self {
        lock(&self.queues).entry(stage).or_default().push_back(reply);
        self
    }

    /// Queue a text reply for `stage`.
    pub fn reply(self, stage: StageId, text: impl Into<String>) -> Self {
        self.push(stage, ScriptedReply::Text(text.into()))
    }

    /// Queue a JSON reply for `stage`.
    pub fn reply_json(self, stage: StageId, value: serde_json::Value) -> Self {
        self.push(stage, ScriptedReply::Text(value.to_string()))
    }

    pub fn http_error(self, stage: StageId, status: u16) -> Self {
        self.push(stage, ScriptedReply::HttpError(status))
    }

    pub fn fail(self, stage: StageId, message: impl Into<String>) -> Self {
        self.push(stage, ScriptedReply::Fail(message.into()))
    }

    /// Replies still queued for `stage`.
    pub fn pending(&self, stage: StageId) -> usize {
        lock(&self.queues).get(&stage).map_or(0, VecDeque::len)
    }

    /// Every request received, in order.
    pub fn calls(&self) -> Vec<LlmRequest> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, stage: StageId) -> usize {
        lock(&self.calls).iter().filter(|r| r.stage == stage).count()
    }

    /// Stages in the order they called the model.
    pub fn call_stages(&self) -> Vec<StageId> {
        lock(&self.calls).iter().map(|r| r.stage).collect()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        lock(&self.calls).push(request.clone());
        let next = lock(&self.queues)
            .get_mut(&request.stage)
            .and_then(VecDeque::pop_front);

        match next {
            Some(ScriptedReply::Text(text)) => Ok(LlmResponse::ok(text)),
            Some(ScriptedReply::HttpError(status)) => Err(AgentError::HttpError {
                status,
                body: "scripted error".into(),
                retry_after: None,
            }),
            Some(ScriptedReply::Fail(message)) => Err(AgentError::Other(message)),
            None => Err(AgentError::Other(format!(
                "no scripted reply left for stage {}",
                request.stage
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
