use super::{memories_text, question, schemas_json, scoped_schemas, unless_cancelled, BoxFut, Stage};
use crate::call::StructuredCall;
use crate::context::StageCtx;
use crate::error::Result;
use crate::graph::StageId;
use crate::parser::{extract, ParsedReply, StageSchema};
use crate::prompts;
use crate::state::{GeneratedSql, ReflectionKind, RequestState, SQL_ERROR_SENTINEL};
use once_cell::sync::Lazy;
use tracing::{error, info, warn};

static REPLY: Lazy<StageSchema> = Lazy::new(|| {
    StageSchema::new("generate")
        .text("sql_query", "")
        .text("explanation", "")
});

/// Writes SQL for the analyzed question.
///
/// On a regeneration pass the outstanding validation issues are listed in
/// the prompt. The written `query_text` is never empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateStage;

impl GenerateStage {
    fn reflection_note(state: &RequestState) -> String {
        match &state.reflection {
            Some(r) if r.kind == ReflectionKind::SqlValidation => {
                let issues = state
                    .validation_result
                    .as_ref()
                    .map(|v| v.issues.as_slice())
                    .unwrap_or_default();
                prompts::render(
                    prompts::GENERATE_REFLECTION,
                    &[
                        ("issues", prompts::numbered(issues, &r.issue)),
                        ("suggestion", r.suggestion.clone()),
                    ],
                )
            }
            _ => String::new(),
        }
    }

    /// The SQL from `sql_query`, or from a fenced `sql` block when the model
    /// skipped the JSON wrapper.
    fn sql_from(reply: &ParsedReply) -> String {
        if reply.fields.is_present("sql_query") {
            return reply.fields.get_text("sql_query");
        }
        match extract::extract_code_block_for(&reply.text, "sql") {
            Some(sql) => {
                info!("recovered SQL from a fenced block");
                sql.to_string()
            }
            None => String::new(),
        }
    }

    fn sentinel(explanation: String) -> GeneratedSql {
        GeneratedSql {
            query_text: SQL_ERROR_SENTINEL.to_string(),
            explanation,
        }
    }
}

impl Stage for GenerateStage {
    fn id(&self) -> StageId {
        StageId::Generate
    }

    fn run<'a>(&'a self, ctx: &'a StageCtx, mut state: RequestState) -> BoxFut<'a, Result<RequestState>> {
        Box::pin(async move {
            let attempt = state.regenerate_attempts.len();
            info!(attempt, "generating SQL");

            let call = StructuredCall::new(StageId::Generate, prompts::GENERATE)
                .var("analyzed_query", question(&state))
                .var("table_information", schemas_json(&scoped_schemas(&state)))
                .var("relevant_memories", memories_text(&state.memories))
                .var("reflection", Self::reflection_note(&state));

            let generated = match unless_cancelled(call.parse(ctx, &REPLY).await)? {
                Ok(reply) => {
                    let sql = Self::sql_from(&reply).replace("\\n", "\n");
                    let sql = sql.trim();
                    if sql.is_empty() {
                        warn!("generator returned no SQL");
                        Self::sentinel("The model did not return a SQL query".to_string())
                    } else {
                        GeneratedSql {
                            query_text: sql.to_string(),
                            explanation: reply.fields.get_text("explanation"),
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "SQL generation failed");
                    Self::sentinel(format!("Failed to generate SQL query: {e}"))
                }
            };

            info!(sql = %generated.query_text, "SQL generated");
            state.generated_sql = Some(generated);
            Ok(state)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGenerator;
    use crate::stages::testing;
    use crate::state::{Reflection, ValidationResult};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_generates_sql_with_newlines() {
        let generator = Arc::new(ScriptedGenerator::new().reply_json(
            StageId::Generate,
            json!({"sql_query": "SELECT COUNT(*)\\nFROM orders", "explanation": "count"}),
        ));
        let ctx = testing::ctx(generator.clone());
        let state = GenerateStage.run(&ctx, testing::analyzed_state()).await.unwrap();

        let sql = state.generated_sql.unwrap();
        assert_eq!(sql.query_text, "SELECT COUNT(*)\nFROM orders");
        assert_eq!(sql.explanation, "count");

        let prompt = &generator.calls()[0].prompt;
        assert!(prompt.contains("Count all orders"));
        assert!(prompt.contains("\"orders\""));
        assert!(!prompt.contains("\"customers\""));
        assert!(!prompt.contains("previous attempt was rejected"));
    }

    #[tokio::test]
    async fn test_reflection_reaches_prompt() {
        let generator = Arc::new(
            ScriptedGenerator::new().reply_json(StageId::Generate, json!({"sql_query": "SELECT 1"})),
        );
        let ctx = testing::ctx(generator.clone());
        let mut state = testing::analyzed_state();
        state.reflection = Some(Reflection::new(
            ReflectionKind::SqlValidation,
            "unknown column amount",
            "use total instead",
        ));
        GenerateStage.run(&ctx, state).await.unwrap();

        let prompt = &generator.calls()[0].prompt;
        assert!(prompt.contains("unknown column amount"));
        assert!(prompt.contains("use total instead"));
    }

    #[tokio::test]
    async fn test_validation_issues_are_numbered() {
        let generator = Arc::new(
            ScriptedGenerator::new().reply_json(StageId::Generate, json!({"sql_query": "SELECT 1"})),
        );
        let ctx = testing::ctx(generator.clone());
        let mut state = testing::analyzed_state();
        state.validation_result = Some(ValidationResult {
            is_valid: false,
            issues: vec!["unknown column amount".into(), "missing GROUP BY".into()],
            suggested_fix: "use total".into(),
        });
        state.reflection = Some(Reflection::new(
            ReflectionKind::SqlValidation,
            "unknown column amount; missing GROUP BY",
            "use total",
        ));
        GenerateStage.run(&ctx, state).await.unwrap();

        let prompt = &generator.calls()[0].prompt;
        assert!(prompt.contains("1. unknown column amount\n2. missing GROUP BY"));
    }

    #[tokio::test]
    async fn test_fenced_sql_without_json() {
        let generator = Arc::new(ScriptedGenerator::new().reply(
            StageId::Generate,
            "Here is the query:\n```sql\nSELECT COUNT(*)\nFROM orders\n```",
        ));
        let ctx = testing::ctx(generator);
        let state = GenerateStage.run(&ctx, testing::analyzed_state()).await.unwrap();

        let sql = state.generated_sql.unwrap();
        assert_eq!(sql.query_text, "SELECT COUNT(*)\nFROM orders");
        assert_eq!(sql.explanation, "");
    }

    #[tokio::test]
    async fn test_failure_writes_sentinel() {
        let generator = Arc::new(ScriptedGenerator::new().fail(StageId::Generate, "boom"));
        let ctx = testing::ctx(generator);
        let state = GenerateStage.run(&ctx, testing::analyzed_state()).await.unwrap();
        let sql = state.generated_sql.unwrap();
        assert_eq!(sql.query_text, SQL_ERROR_SENTINEL);
        assert!(sql.explanation.contains("boom"));
    }

    #[tokio::test]
    async fn test_empty_sql_writes_sentinel() {
        let generator = Arc::new(
            ScriptedGenerator::new().reply_json(StageId::Generate, json!({"sql_query": "  ", "explanation": "x"})),
        );
        let ctx = testing::ctx(generator);
        let state = GenerateStage.run(&ctx, testing::analyzed_state()).await.unwrap();
        assert_eq!(state.generated_sql.unwrap().query_text, SQL_ERROR_SENTINEL);
    }
}
