use super::{memories_text, schemas_json, unless_cancelled, BoxFut, Stage};
use crate::call::StructuredCall;
use crate::context::StageCtx;
use crate::error::Result;
use crate::graph::StageId;
use crate::parser::{FieldMap, ParseTier, StageSchema};
use crate::prompts;
use crate::state::{AnalyzedQuery, RequestState};
use once_cell::sync::Lazy;
use std::fmt::Display;
use tracing::{error, info, warn};

static REPLY: Lazy<StageSchema> = Lazy::new(|| {
    StageSchema::new("analyze")
        .bool("is_query_relevant", false)
        .text("analyzed_query", "")
        .list("selected_tables")
        .text("explanation", "")
});

/// Decides whether the question is answerable and picks the tables for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeStage;

impl AnalyzeStage {
    fn from_reply(state: &RequestState, fields: &FieldMap, max_tables: usize) -> AnalyzedQuery {
        let mut selected: Vec<String> = Vec::new();
        for table in fields.get_list("selected_tables") {
            if !state.db_info.contains_key(&table) {
                warn!(%table, "analysis selected an unknown table, dropping it");
                continue;
            }
            if !selected.contains(&table) {
                selected.push(table);
            }
        }
        if selected.len() > max_tables {
            warn!(selected = selected.len(), max_tables, "too many tables selected, truncating");
            selected.truncate(max_tables);
        }

        AnalyzedQuery {
            original: state.user_query.clone(),
            rewritten: fields.get_text("analyzed_query"),
            selected_tables: selected,
            explanation: fields.get_text("explanation"),
            is_relevant: fields.get_bool("is_query_relevant"),
        }
    }

    fn failed(state: &RequestState, reason: impl Display) -> AnalyzedQuery {
        AnalyzedQuery {
            original: state.user_query.clone(),
            rewritten: String::new(),
            selected_tables: Vec::new(),
            explanation: format!("An error occurred during analysis: {reason}"),
            is_relevant: false,
        }
    }
}

impl Stage for AnalyzeStage {
    fn id(&self) -> StageId {
        StageId::Analyze
    }

    fn run<'a>(&'a self, ctx: &'a StageCtx, mut state: RequestState) -> BoxFut<'a, Result<RequestState>> {
        Box::pin(async move {
            info!(query = %state.user_query, memories = state.memories.len(), "analyzing query");

            let call = StructuredCall::new(StageId::Analyze, prompts::ANALYZE)
                .var("user_query", state.user_query.clone())
                .var("table_information", schemas_json(&state.all_schemas()))
                .var("relevant_memories", memories_text(&state.memories))
                .var("max_tables", ctx.config.max_tables_to_select.to_string());

            let analyzed = match unless_cancelled(call.parse(ctx, &REPLY).await)? {
                Ok(reply) if reply.tier != ParseTier::Defaulted => {
                    Self::from_reply(&state, &reply.fields, ctx.config.max_tables_to_select)
                }
                Ok(_) => {
                    error!("analysis reply contained no recognizable fields");
                    Self::failed(&state, "the reply could not be parsed")
                }
                Err(e) => {
                    error!(error = %e, "query analysis failed");
                    Self::failed(&state, e)
                }
            };

            info!(
                relevant = analyzed.is_relevant,
                tables = ?analyzed.selected_tables,
                "query analyzed"
            );
            state.is_query_relevant = analyzed.is_relevant;
            state.analyzed_query = Some(analyzed);
            Ok(state)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::llm::ScriptedGenerator;
    use crate::stages::testing;
    use serde_json::json;
    use std::sync::Arc;

    fn fresh_state() -> RequestState {
        let mut state = RequestState::new("How many orders?", "s1", "r1").unwrap();
        state.db_info = testing::db_info();
        state
    }

    #[tokio::test]
    async fn test_relevant_query() {
        let generator = Arc::new(ScriptedGenerator::new().reply_json(
            StageId::Analyze,
            json!({
                "is_query_relevant": true,
                "analyzed_query": "Count all orders",
                "selected_tables": ["orders"],
                "explanation": "orders has one row per order"
            }),
        ));
        let ctx = testing::ctx(generator.clone());
        let state = AnalyzeStage.run(&ctx, fresh_state()).await.unwrap();

        assert!(state.is_query_relevant);
        let analyzed = state.analyzed_query.unwrap();
        assert_eq!(analyzed.original, "How many orders?");
        assert_eq!(analyzed.rewritten, "Count all orders");
        assert_eq!(analyzed.selected_tables, vec!["orders"]);
        assert!(generator.calls()[0].prompt.contains("\"order_id\""));
    }

    #[tokio::test]
    async fn test_unknown_tables_dropped_and_capped() {
        let generator = Arc::new(ScriptedGenerator::new().reply_json(
            StageId::Analyze,
            json!({
                "is_query_relevant": true,
                "selected_tables": ["ghosts", "orders", "orders", "customers"]
            }),
        ));
        let ctx = StageCtx::builder(generator)
            .database(Arc::new(testing::FakeDb {
                rows: Ok(Default::default()),
            }))
            .config(AgentConfig::default().with_max_tables(1))
            .build()
            .unwrap();
        let state = AnalyzeStage.run(&ctx, fresh_state()).await.unwrap();
        assert_eq!(state.analyzed_query.unwrap().selected_tables, vec!["orders"]);
    }

    #[tokio::test]
    async fn test_python_style_reply_is_understood() {
        let generator = Arc::new(ScriptedGenerator::new().reply(
            StageId::Analyze,
            "Sure!\n{'is_query_relevant': True, 'analyzed_query': 'Count orders', 'selected_tables': ['orders'], 'explanation': 'ok'}",
        ));
        let ctx = testing::ctx(generator);
        let state = AnalyzeStage.run(&ctx, fresh_state()).await.unwrap();
        assert!(state.is_query_relevant);
    }

    #[tokio::test]
    async fn test_generator_failure_marks_irrelevant() {
        let generator = Arc::new(ScriptedGenerator::new().fail(StageId::Analyze, "model offline"));
        let ctx = testing::ctx(generator);
        let state = AnalyzeStage.run(&ctx, fresh_state()).await.unwrap();

        assert!(!state.is_query_relevant);
        let analyzed = state.analyzed_query.unwrap();
        assert!(analyzed.explanation.starts_with("An error occurred during analysis:"));
        assert!(analyzed.explanation.contains("model offline"));
        assert!(analyzed.selected_tables.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_reply_marks_irrelevant() {
        let generator = Arc::new(ScriptedGenerator::new().reply(StageId::Analyze, "I cannot help with that."));
        let ctx = testing::ctx(generator);
        let state = AnalyzeStage.run(&ctx, fresh_state()).await.unwrap();
        assert!(!state.is_query_relevant);
        assert!(state.analyzed_query.unwrap().explanation.contains("could not be parsed"));
    }
}
