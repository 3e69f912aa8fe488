use super::{question, schemas_json, scoped_schemas, unless_cancelled, BoxFut, Stage};
use crate::call::StructuredCall;
use crate::context::StageCtx;
use crate::error::Result;
use crate::graph::StageId;
use crate::parser::StageSchema;
use crate::prompts;
use crate::state::{Reflection, ReflectionKind, RequestState, ValidationResult};
use once_cell::sync::Lazy;
use tracing::{error, info, warn};

static REPLY: Lazy<StageSchema> = Lazy::new(|| {
    StageSchema::new("validate")
        .bool("is_sql_valid", false)
        .list("issues")
        .text("suggested_fix", "")
});

const UNEXPECTED_ISSUE: &str = "Unexpected error in validation process";
const UNEXPECTED_FIX: &str = "Please review the SQL query and try again.";

/// Asks the model to review the generated SQL.
///
/// Invalid SQL leaves a [`ReflectionKind::SqlValidation`] reflection for the
/// next generation pass; valid SQL clears it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateStage;

impl Stage for ValidateStage {
    fn id(&self) -> StageId {
        StageId::Validate
    }

    fn run<'a>(&'a self, ctx: &'a StageCtx, mut state: RequestState) -> BoxFut<'a, Result<RequestState>> {
        Box::pin(async move {
            let (sql, explanation) = state
                .generated_sql
                .as_ref()
                .map(|g| (g.query_text.clone(), g.explanation.clone()))
                .unwrap_or_default();
            info!(%sql, "validating SQL");

            let call = StructuredCall::new(StageId::Validate, prompts::VALIDATE)
                .var("original_query", state.user_query.clone())
                .var("analyzed_query", question(&state))
                .var("sql_query", sql)
                .var("sql_explanation", explanation)
                .var("table_schemas", schemas_json(&scoped_schemas(&state)));

            let result = match unless_cancelled(call.parse(ctx, &REPLY).await)? {
                Ok(reply) => {
                    if !reply.fields.is_present("is_sql_valid") {
                        warn!("validation reply has no is_sql_valid field, treating SQL as invalid");
                    }
                    ValidationResult {
                        is_valid: reply.fields.get_bool("is_sql_valid"),
                        issues: reply.fields.get_list("issues"),
                        suggested_fix: reply.fields.get_text("suggested_fix"),
                    }
                }
                Err(e) => {
                    error!(error = %e, "SQL validation failed");
                    ValidationResult {
                        is_valid: false,
                        issues: vec![UNEXPECTED_ISSUE.to_string()],
                        suggested_fix: UNEXPECTED_FIX.to_string(),
                    }
                }
            };

            state.reflection = (!result.is_valid).then(|| {
                Reflection::new(
                    ReflectionKind::SqlValidation,
                    result.issues.join("; "),
                    result.suggested_fix.clone(),
                )
            });
            info!(valid = result.is_valid, issues = ?result.issues, "SQL validated");
            state.validation_result = Some(result);
            Ok(state)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGenerator;
    use crate::stages::testing;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_valid_sql_clears_reflection() {
        let generator = Arc::new(ScriptedGenerator::new().reply_json(
            StageId::Validate,
            json!({"is_sql_valid": true, "issues": [], "suggested_fix": ""}),
        ));
        let ctx = testing::ctx(generator);
        let mut state = testing::generated_state("SELECT COUNT(*) FROM orders");
        state.reflection = Some(Reflection::new(ReflectionKind::SqlValidation, "old", "old"));

        let state = ValidateStage.run(&ctx, state).await.unwrap();
        assert!(state.validation_result.unwrap().is_valid);
        assert!(state.reflection.is_none());
    }

    #[tokio::test]
    async fn test_invalid_sql_sets_reflection() {
        let generator = Arc::new(ScriptedGenerator::new().reply_json(
            StageId::Validate,
            json!({
                "is_sql_valid": false,
                "issues": ["unknown column amount", "missing LIMIT"],
                "suggested_fix": "SELECT SUM(total) FROM orders"
            }),
        ));
        let ctx = testing::ctx(generator);
        let state = ValidateStage
            .run(&ctx, testing::generated_state("SELECT SUM(amount) FROM orders"))
            .await
            .unwrap();

        let reflection = state.reflection.unwrap();
        assert_eq!(reflection.kind, ReflectionKind::SqlValidation);
        assert_eq!(reflection.issue, "unknown column amount; missing LIMIT");
        assert_eq!(reflection.suggestion, "SELECT SUM(total) FROM orders");
        assert_eq!(state.validation_result.unwrap().issues.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_flag_counts_as_invalid() {
        let generator = Arc::new(
            ScriptedGenerator::new().reply_json(StageId::Validate, json!({"issues": ["looks odd"]})),
        );
        let ctx = testing::ctx(generator);
        let state = ValidateStage
            .run(&ctx, testing::generated_state("SELECT 1"))
            .await
            .unwrap();
        assert!(!state.validation_result.unwrap().is_valid);
        assert!(state.reflection.is_some());
    }

    #[tokio::test]
    async fn test_generator_failure_uses_generic_issue() {
        let generator = Arc::new(ScriptedGenerator::new().fail(StageId::Validate, "timeout"));
        let ctx = testing::ctx(generator);
        let state = ValidateStage
            .run(&ctx, testing::generated_state("SELECT 1"))
            .await
            .unwrap();

        let result = state.validation_result.unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.issues, vec![UNEXPECTED_ISSUE]);
        assert_eq!(result.suggested_fix, UNEXPECTED_FIX);
        assert_eq!(state.reflection.unwrap().issue, UNEXPECTED_ISSUE);
    }
}
