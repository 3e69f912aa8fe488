//! The processing stages of the workflow.
//!
//! Each stage takes the [`RequestState`] by value, makes at most one kind of
//! external call, writes its own fields, and hands the state back. Failures
//! of the text generator or the SQL engine are folded into the state so
//! routing can continue; the only errors a stage returns are a failed
//! schema introspection and cancellation.
//!
//! | Stage | External call | Writes |
//! |---|---|---|
//! | [`SchemaStage`] | schema introspector | `db_info` |
//! | [`AnalyzeStage`] | generator | `analyzed_query`, `is_query_relevant` |
//! | [`GenerateStage`] | generator | `generated_sql` |
//! | [`ValidateStage`] | generator | `validation_result`, `reflection` |
//! | [`ExecuteStage`] | SQL executor | `execution_result` |
//! | [`EvaluateStage`] | session history, generator | `evaluation_result`, `is_result_relevant`, `reflection` |
//! | [`CorrectStage`] | generator | `correction` |
//! | [`CheckVisualizationStage`] | none | nothing |
//! | [`VisualizeStage`] | generator, chart renderer | `visualization` |
//! | [`SummarizeStage`] | generator | `summary` |

pub mod analyze;
pub mod correct;
pub mod evaluate;
pub mod execute;
pub mod generate;
pub mod schema;
pub mod summarize;
pub mod validate;
pub mod visualize;

pub use analyze::AnalyzeStage;
pub use correct::CorrectStage;
pub use evaluate::EvaluateStage;
pub use execute::{ExecuteStage, SqlSource};
pub use generate::GenerateStage;
pub use schema::SchemaStage;
pub use summarize::SummarizeStage;
pub use validate::ValidateStage;
pub use visualize::{CheckVisualizationStage, VisualizeStage};

use crate::context::StageCtx;
use crate::error::{AgentError, Result};
use crate::graph::StageId;
use crate::state::{MemorySnippet, RequestState, TableSchema};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future used by [`Stage`] to stay object-safe.
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One node of the workflow graph.
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    fn run<'a>(&'a self, ctx: &'a StageCtx, state: RequestState) -> BoxFut<'a, Result<RequestState>>;
}

/// Stage implementations keyed by [`StageId`].
#[derive(Clone, Default)]
pub struct StageSet {
    stages: BTreeMap<StageId, Arc<dyn Stage>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stage of the standard workflow.
    pub fn standard() -> Self {
        Self::new()
            .with(SchemaStage)
            .with(AnalyzeStage)
            .with(GenerateStage)
            .with(ValidateStage)
            .with(ExecuteStage::new(SqlSource::Generated))
            .with(EvaluateStage)
            .with(CorrectStage)
            .with(ExecuteStage::new(SqlSource::Corrected))
            .with(CheckVisualizationStage)
            .with(VisualizeStage)
            .with(SummarizeStage)
    }

    /// Add or replace the implementation for `stage.id()`.
    pub fn with(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.insert(stage.id(), Arc::new(stage));
        self
    }

    pub fn get(&self, id: StageId) -> Option<&Arc<dyn Stage>> {
        self.stages.get(&id)
    }

    pub fn contains(&self, id: StageId) -> bool {
        self.stages.contains_key(&id)
    }
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.stages.keys()).finish()
    }
}

/// Split cancellation off from recoverable failures.
///
/// The outer `Err` is always [`AgentError::Cancelled`]; anything else is
/// handed back for the stage to fold into the state.
pub(crate) fn unless_cancelled<T>(result: Result<T>) -> Result<Result<T>> {
    match result {
        Err(AgentError::Cancelled) => Err(AgentError::Cancelled),
        other => Ok(other),
    }
}

pub(crate) fn schemas_json(schemas: &BTreeMap<&str, &TableSchema>) -> String {
    serde_json::to_string_pretty(schemas).unwrap_or_else(|_| "{}".to_string())
}

/// Selected schemas, or every schema when nothing usable was selected.
pub(crate) fn scoped_schemas(state: &RequestState) -> BTreeMap<&str, &TableSchema> {
    let selected = state.selected_schemas();
    if selected.is_empty() {
        state.all_schemas()
    } else {
        selected
    }
}

pub(crate) fn memories_text(memories: &[MemorySnippet]) -> String {
    if memories.is_empty() {
        return "No relevant memories".to_string();
    }
    memories
        .iter()
        .enumerate()
        .map(|(i, m)| format!("Memory {}: {}", i + 1, m.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The restated question, or the user's own words when analysis gave none.
pub(crate) fn question(state: &RequestState) -> &str {
    state
        .analyzed_query
        .as_ref()
        .map(|a| a.rewritten.as_str())
        .filter(|q| !q.trim().is_empty())
        .unwrap_or(&state.user_query)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AnalyzedQuery;

    #[test]
    fn test_standard_set_covers_every_stage() {
        let set = StageSet::standard();
        for id in StageId::ALL {
            assert!(set.contains(id), "missing {id}");
            assert_eq!(set.get(id).unwrap().id(), id);
        }
    }

    #[test]
    fn test_unless_cancelled() {
        assert!(matches!(
            unless_cancelled::<()>(Err(AgentError::Cancelled)),
            Err(AgentError::Cancelled)
        ));
        let inner = unless_cancelled::<()>(Err(AgentError::Other("x".into()))).unwrap();
        assert!(inner.is_err());
    }

    #[test]
    fn test_scoped_schemas_falls_back_to_all() {
        let mut state = testing::analyzed_state();
        assert_eq!(scoped_schemas(&state).len(), 1);
        state.analyzed_query = Some(AnalyzedQuery {
            selected_tables: vec!["ghosts".into()],
            ..state.analyzed_query.clone().unwrap()
        });
        assert_eq!(scoped_schemas(&state).len(), 2);
    }

    #[test]
    fn test_memories_text() {
        assert_eq!(memories_text(&[]), "No relevant memories");
        let memories = vec![MemorySnippet {
            text: "Query: a\nResponse: b".into(),
            metadata: Default::default(),
        }];
        assert_eq!(memories_text(&memories), "Memory 1: Query: a\nResponse: b");
    }

    #[test]
    fn test_question_prefers_rewrite() {
        let mut state = testing::analyzed_state();
        assert_eq!(question(&state), "Count all orders");
        state.analyzed_query.as_mut().unwrap().rewritten.clear();
        assert_eq!(question(&state), "How many orders?");
    }
}
