use super::{question, unless_cancelled, BoxFut, Stage};
use crate::call::StructuredCall;
use crate::context::StageCtx;
use crate::error::Result;
use crate::graph::StageId;
use crate::parser::StageSchema;
use crate::prompts;
use crate::state::{EvaluationResult, ExecutionResult, Reflection, ReflectionKind, RequestState};
use once_cell::sync::Lazy;
use std::fmt::Write as _;
use tracing::{error, info, warn};

static REPLY: Lazy<StageSchema> = Lazy::new(|| {
    StageSchema::new("evaluate")
        .bool("is_result_relevant", false)
        .text("explanation", "Failed to generate explanation")
        .text("improvement_suggestion", "No suggestion provided")
        .bool("requires_visualization", false)
        .text("summary", "Failed to generate summary")
});

const PREVIEW_ROWS: usize = 5;

/// Judges whether the executed query answers the question and whether a
/// chart would help.
///
/// A failed execution is judged without asking the model.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluateStage;

impl EvaluateStage {
    fn execution_failed(error: &str) -> (EvaluationResult, Reflection) {
        (
            EvaluationResult {
                is_relevant: false,
                explanation: format!("Query execution failed: {error}"),
                requires_visualization: false,
                summary: "The query execution failed, so no results are available to summarize."
                    .to_string(),
            },
            Reflection::new(
                ReflectionKind::ResultEvaluation,
                "Query execution failed",
                "Review and fix the SQL query execution error",
            ),
        )
    }

    async fn session_history(ctx: &StageCtx, session_id: &str) -> String {
        if session_id.trim().is_empty() {
            warn!("request has no session id");
            return "No session history available".to_string();
        }
        match ctx.history.recent(session_id, ctx.config.history_limit).await {
            Ok(entries) if entries.is_empty() => "No session history available".to_string(),
            Ok(entries) => entries
                .iter()
                .map(|e| format!("Query: {}\nResponse: {}", e.query, e.response))
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => {
                error!(error = %e, "fetching session history failed");
                "Error fetching session history".to_string()
            }
        }
    }
}

/// Plain-text digest of a result set: shape, per-column numeric statistics
/// and the first few rows.
pub fn results_summary(result: &ExecutionResult) -> String {
    if result.rows.is_empty() {
        return "No results".to_string();
    }

    let mut out = format!(
        "{} rows; columns: {}\n",
        result.rows.len(),
        result.columns.join(", ")
    );
    for column in &result.columns {
        let values: Vec<f64> = result
            .rows
            .iter()
            .filter_map(|row| row.get(column).and_then(|v| v.as_f64()))
            .collect();
        if values.is_empty() {
            continue;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let _ = writeln!(
            out,
            "{column}: count={} min={min} max={max} mean={mean:.2}",
            values.len()
        );
    }

    out.push_str("first rows:\n");
    for row in result.rows.iter().take(PREVIEW_ROWS) {
        let _ = writeln!(out, "{}", serde_json::Value::Object(row.clone()));
    }
    out.trim_end().to_string()
}

impl Stage for EvaluateStage {
    fn id(&self) -> StageId {
        StageId::Evaluate
    }

    fn run<'a>(&'a self, ctx: &'a StageCtx, mut state: RequestState) -> BoxFut<'a, Result<RequestState>> {
        Box::pin(async move {
            let failure = match &state.execution_result {
                Some(r) if r.success => None,
                Some(r) => Some(r.error.clone().unwrap_or_default()),
                None => Some("the query was never executed".to_string()),
            };

            let (evaluation, reflection) = if let Some(err) = failure {
                info!(error = %err, "execution failed, skipping model evaluation");
                let (evaluation, reflection) = Self::execution_failed(&err);
                (evaluation, Some(reflection))
            } else {
                let summary = state
                    .execution_result
                    .as_ref()
                    .map(results_summary)
                    .unwrap_or_default();
                let history = Self::session_history(ctx, &state.session_id).await;

                let call = StructuredCall::new(StageId::Evaluate, prompts::EVALUATE)
                    .var("original_query", state.user_query.clone())
                    .var("analyzed_query", question(&state))
                    .var("generated_sql", state.generated_sql_text())
                    .var("results_summary", summary)
                    .var("session_history", history);

                match unless_cancelled(call.parse(ctx, &REPLY).await)? {
                    Ok(reply) => {
                        let fields = reply.fields;
                        let evaluation = EvaluationResult {
                            is_relevant: fields.get_bool("is_result_relevant"),
                            explanation: fields.get_text("explanation"),
                            requires_visualization: fields.get_bool("requires_visualization"),
                            summary: fields.get_text("summary"),
                        };
                        let reflection = (!evaluation.is_relevant).then(|| {
                            Reflection::new(
                                ReflectionKind::ResultEvaluation,
                                "Results not relevant to user query",
                                fields.get_text("improvement_suggestion"),
                            )
                        });
                        (evaluation, reflection)
                    }
                    Err(e) => {
                        error!(error = %e, "result evaluation failed");
                        (
                            EvaluationResult {
                                is_relevant: false,
                                explanation: format!("An error occurred during evaluation: {e}"),
                                requires_visualization: false,
                                summary: "Failed to evaluate results due to an error.".to_string(),
                            },
                            Some(Reflection::new(
                                ReflectionKind::ResultEvaluation,
                                "Error during evaluation",
                                "Review and fix the evaluation process",
                            )),
                        )
                    }
                }
            };

            info!(
                relevant = evaluation.is_relevant,
                chart = evaluation.requires_visualization,
                "results evaluated"
            );
            state.is_result_relevant = evaluation.is_relevant;
            state.evaluation_result = Some(evaluation);
            state.reflection = reflection;
            Ok(state)
        })
    }
}
