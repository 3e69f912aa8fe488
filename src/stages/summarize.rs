use super::{question, unless_cancelled, BoxFut, Stage};
use crate::call::StructuredCall;
use crate::context::StageCtx;
use crate::error::Result;
use crate::graph::StageId;
use crate::prompts;
use crate::state::RequestState;
use tracing::{error, info, warn};

const NO_ANSWER: &str = "I'm sorry, I couldn't produce an answer to your question.";

/// Writes the final answer. Always sets `summary`.
///
/// Irrelevant questions get a fixed apology built from the analysis
/// explanation, without a model call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummarizeStage;

impl SummarizeStage {
    fn irrelevant(state: &RequestState) -> String {
        let explanation = state
            .analyzed_query
            .as_ref()
            .map(|a| a.explanation.as_str())
            .unwrap_or_default();
        format!(
            "I'm sorry, but your query '{}' is not relevant to the available database information. {}",
            state.user_query, explanation
        )
        .trim_end()
        .to_string()
    }

    fn execution_text(state: &RequestState) -> String {
        match &state.execution_result {
            Some(r) if r.success => serde_json::to_string(&r.rows).unwrap_or_default(),
            Some(r) => format!("failed: {}", r.error.as_deref().unwrap_or("unknown error")),
            None => String::new(),
        }
    }

    /// What to say when the model gives nothing usable.
    fn fallback(state: &RequestState) -> String {
        state
            .evaluation_result
            .as_ref()
            .map(|e| e.summary.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(NO_ANSWER)
            .to_string()
    }
}

impl Stage for SummarizeStage {
    fn id(&self) -> StageId {
        StageId::Summarize
    }

    fn run<'a>(&'a self, ctx: &'a StageCtx, mut state: RequestState) -> BoxFut<'a, Result<RequestState>> {
        Box::pin(async move {
            if !state.is_query_relevant {
                info!("query not relevant, summarizing without the model");
                state.summary = Some(Self::irrelevant(&state));
                return Ok(state);
            }

            let call = StructuredCall::new(StageId::Summarize, prompts::SUMMARIZE)
                .var("user_query", state.user_query.clone())
                .var("analyzed_query", question(&state))
                .var("sql_query", state.generated_sql_text())
                .var("execution_result", Self::execution_text(&state))
                .var(
                    "evaluation_result",
                    state
                        .evaluation_result
                        .as_ref()
                        .map(|e| e.explanation.clone())
                        .unwrap_or_default(),
                );

            let summary = match unless_cancelled(call.text(ctx).await)? {
                Ok(text) if !text.is_empty() => text,
                Ok(_) => {
                    warn!("summary reply was empty");
                    Self::fallback(&state)
                }
                Err(e) => {
                    error!(error = %e, "summarization failed");
                    Self::fallback(&state)
                }
            };

            info!(chars = summary.len(), "summary written");
            state.summary = Some(summary);
            Ok(state)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGenerator;
    use crate::stages::testing;
    use crate::state::{AnalyzedQuery, EvaluationResult, ExecutionResult};
    use serde_json::json;
    use std::sync::Arc;

    fn answered_state() -> RequestState {
        let mut state = testing::generated_state("SELECT COUNT(*) AS n FROM orders");
        state.execution_result = Some(ExecutionResult::succeeded(
            vec!["n".into()],
            vec![json!({"n": 3}).as_object().cloned().unwrap()],
        ));
        state.evaluation_result = Some(EvaluationResult {
            is_relevant: true,
            explanation: "a single count".into(),
            requires_visualization: false,
            summary: "There are 3 orders.".into(),
        });
        state
    }

    #[tokio::test]
    async fn test_irrelevant_query_skips_generator() {
        let generator = Arc::new(ScriptedGenerator::new());
        let ctx = testing::ctx(generator.clone());
        let mut state = RequestState::new("What's the weather?", "s", "r").unwrap();
        state.analyzed_query = Some(AnalyzedQuery {
            original: "What's the weather?".into(),
            rewritten: String::new(),
            selected_tables: vec![],
            explanation: "No weather data is stored.".into(),
            is_relevant: false,
        });

        let state = SummarizeStage.run(&ctx, state).await.unwrap();
        assert_eq!(
            state.summary.unwrap(),
            "I'm sorry, but your query 'What's the weather?' is not relevant to the available database information. No weather data is stored."
        );
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_summary_from_generator() {
        let generator = Arc::new(ScriptedGenerator::new().reply(StageId::Summarize, "You have 3 orders."));
        let ctx = testing::ctx(generator.clone());
        let state = SummarizeStage.run(&ctx, answered_state()).await.unwrap();
        assert_eq!(state.summary.unwrap(), "You have 3 orders.");
        assert!(generator.calls()[0].prompt.contains("[{\"n\":3}]"));
    }

    #[tokio::test]
    async fn test_generator_failure_uses_evaluation_summary() {
        let generator = Arc::new(ScriptedGenerator::new().fail(StageId::Summarize, "offline"));
        let ctx = testing::ctx(generator);
        let state = SummarizeStage.run(&ctx, answered_state()).await.unwrap();
        assert_eq!(state.summary.unwrap(), "There are 3 orders.");
    }

    #[tokio::test]
    async fn test_generator_failure_without_evaluation() {
        let generator = Arc::new(ScriptedGenerator::new().fail(StageId::Summarize, "offline"));
        let ctx = testing::ctx(generator);
        let state = SummarizeStage
            .run(&ctx, testing::generated_state("SELECT 1"))
            .await
            .unwrap();
        assert_eq!(state.summary.unwrap(), NO_ANSWER);
    }
}
