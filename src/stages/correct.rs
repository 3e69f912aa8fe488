use super::{question, schemas_json, unless_cancelled, BoxFut, Stage};
use crate::call::StructuredCall;
use crate::context::StageCtx;
use crate::error::Result;
use crate::graph::StageId;
use crate::parser::StageSchema;
use crate::prompts;
use crate::state::{RequestState, SqlCorrection};
use once_cell::sync::Lazy;
use tracing::{error, info, warn};

static REPLY: Lazy<StageSchema> = Lazy::new(|| {
    StageSchema::new("correct")
        .text("analysis", "No analysis provided")
        .text("identified_issues", "No issues identified")
        .text("corrected_sql_query", "")
});

/// Rewrites SQL whose results were judged irrelevant. Runs at most once
/// per request.
///
/// `corrected_sql` always ends up non-empty: anything the model fails to
/// supply falls back to the generated SQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrectStage;

impl Stage for CorrectStage {
    fn id(&self) -> StageId {
        StageId::Correct
    }

    fn run<'a>(&'a self, ctx: &'a StageCtx, mut state: RequestState) -> BoxFut<'a, Result<RequestState>> {
        Box::pin(async move {
            let current_sql = state.generated_sql_text().to_string();
            info!(sql = %current_sql, "correcting SQL");

            let evaluation = state
                .evaluation_result
                .as_ref()
                .and_then(|e| serde_json::to_string(e).ok())
                .unwrap_or_else(|| "none".to_string());

            let call = StructuredCall::new(StageId::Correct, prompts::CORRECT)
                .var("original_query", state.user_query.clone())
                .var("analyzed_query", question(&state))
                .var("current_sql", current_sql.clone())
                .var("evaluation_result", evaluation)
                .var("table_information", schemas_json(&state.all_schemas()));

            let correction = match unless_cancelled(call.parse(ctx, &REPLY).await)? {
                Ok(reply) => {
                    let corrected = reply.fields.get_text("corrected_sql_query");
                    let corrected = corrected.replace("\\n", "\n").trim().to_string();
                    let corrected_sql = if corrected.is_empty() {
                        warn!("correction reply has no SQL, keeping the generated query");
                        current_sql
                    } else {
                        corrected
                    };
                    SqlCorrection {
                        analysis: reply.fields.get_text("analysis"),
                        issues: reply.fields.get_text("identified_issues"),
                        corrected_sql,
                    }
                }
                Err(e) => {
                    error!(error = %e, "SQL correction failed");
                    SqlCorrection {
                        analysis: format!("An error occurred during SQL correction: {e}"),
                        issues: "No issues identified".to_string(),
                        corrected_sql: current_sql,
                    }
                }
            };

            info!(sql = %correction.corrected_sql, "SQL corrected");
            state.correction = Some(correction);
            Ok(state)
        })
    }
}
