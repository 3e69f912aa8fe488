//! The request state threaded through every stage of the workflow.
//!
//! One [`RequestState`] is created per incoming question, owned by the
//! executor for the duration of a single run, and mutated by each stage.
//! Optional fields start empty and are filled in as stages complete; the
//! nested records mirror the structured output each stage parses from the
//! text generator.

use crate::error::{AgentError, Result};
use crate::graph::StageId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One result row: column name to JSON value.
pub type Row = Map<String, Value>;

/// Table name to schema and sample, as produced by the schema stage.
pub type DbInfo = BTreeMap<String, TableInfo>;

/// SQL text written by the generate stage when the text generator fails.
pub const SQL_ERROR_SENTINEL: &str = "SELECT 'Error: Failed to generate SQL query'";

/// Column layout of a single table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Column name to declared type.
    pub columns: BTreeMap<String, String>,
}

/// Sample rows for a table. Always empty in this crate; kept so prompt
/// payloads have a stable shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSample {
    pub name: String,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: TableSchema,
    pub sample: TableSample,
}

impl TableInfo {
    /// Schema-only entry with an empty sample placeholder.
    pub fn new(name: impl Into<String>, columns: BTreeMap<String, String>) -> Self {
        let name = name.into();
        Self {
            schema: TableSchema {
                name: name.clone(),
                columns,
            },
            sample: TableSample {
                name,
                rows: Vec::new(),
            },
        }
    }
}

/// Output of the analyze stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedQuery {
    pub original: String,
    pub rewritten: String,
    /// Always a subset of the keys of [`RequestState::db_info`].
    pub selected_tables: Vec<String>,
    pub explanation: String,
    pub is_relevant: bool,
}

/// Output of the generate stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSql {
    /// Never empty: falls back to [`SQL_ERROR_SENTINEL`].
    pub query_text: String,
    pub explanation: String,
}

/// Output of the validate stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub suggested_fix: String,
}

/// Outcome of running SQL against the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub columns: Vec<String>,
    /// Empty whenever `success` is false.
    pub rows: Vec<Row>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            success: true,
            columns,
            rows,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            columns: Vec::new(),
            rows: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Output of the evaluate stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub is_relevant: bool,
    pub explanation: String,
    pub requires_visualization: bool,
    pub summary: String,
}

/// Output of the correct stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlCorrection {
    pub analysis: String,
    pub issues: String,
    /// Never empty: falls back to the originally generated SQL.
    pub corrected_sql: String,
}

/// Output of the visualize stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visualization {
    /// Base64-encoded chart document.
    pub image: String,
    pub description: String,
    /// Why this chart was chosen, when the generator said so.
    pub explanation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionKind {
    SqlValidation,
    ResultEvaluation,
}

/// A note explaining why the previous stage's output was judged inadequate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub kind: ReflectionKind,
    pub issue: String,
    pub suggestion: String,
}

impl Reflection {
    pub fn new(kind: ReflectionKind, issue: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            kind,
            issue: issue.into(),
            suggestion: suggestion.into(),
        }
    }
}

/// A long-term memory hit injected into the analysis prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnippet {
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Marker appended each time validation sends the run back to generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegenerateAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Validation issues that triggered this attempt.
    pub issues: Vec<String>,
}

/// Mutable record threaded through the workflow for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestState {
    pub user_query: String,
    pub session_id: String,
    pub run_id: String,
    pub memories: Vec<MemorySnippet>,
    pub db_info: DbInfo,
    pub analyzed_query: Option<AnalyzedQuery>,
    pub generated_sql: Option<GeneratedSql>,
    pub validation_result: Option<ValidationResult>,
    pub execution_result: Option<ExecutionResult>,
    pub evaluation_result: Option<EvaluationResult>,
    pub correction: Option<SqlCorrection>,
    pub visualization: Option<Visualization>,
    pub summary: Option<String>,
    pub is_query_relevant: bool,
    pub is_result_relevant: bool,
    pub regenerate_attempts: Vec<RegenerateAttempt>,
    pub reflection: Option<Reflection>,
    /// Set when a run stops early (step ceiling or deadline).
    pub error: Option<String>,
    /// Stages in the order they executed, retry iterations included.
    pub trace: Vec<StageId>,
}

impl RequestState {
    /// Create a fresh state. Fails if `user_query` is blank.
    pub fn new(
        user_query: impl Into<String>,
        session_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Result<Self> {
        let user_query = user_query.into();
        if user_query.trim().is_empty() {
            return Err(AgentError::EmptyQuery);
        }
        Ok(Self {
            user_query,
            session_id: session_id.into(),
            run_id: run_id.into(),
            memories: Vec::new(),
            db_info: DbInfo::new(),
            analyzed_query: None,
            generated_sql: None,
            validation_result: None,
            execution_result: None,
            evaluation_result: None,
            correction: None,
            visualization: None,
            summary: None,
            is_query_relevant: false,
            is_result_relevant: false,
            regenerate_attempts: Vec::new(),
            reflection: None,
            error: None,
            trace: Vec::new(),
        })
    }

    pub fn with_memories(mut self, memories: Vec<MemorySnippet>) -> Self {
        self.memories = memories;
        self
    }

    /// Number of stages executed so far.
    pub fn steps(&self) -> usize {
        self.trace.len()
    }

    /// Whether `stage` has run at least once.
    pub fn visited(&self, stage: StageId) -> bool {
        self.trace.contains(&stage)
    }

    /// The generated SQL text, or `""` before generation.
    pub fn generated_sql_text(&self) -> &str {
        self.generated_sql
            .as_ref()
            .map(|g| g.query_text.as_str())
            .unwrap_or("")
    }

    /// The SQL whose result sits in `execution_result`: the corrected query
    /// once it has been executed, otherwise the generated one.
    pub fn executed_sql_text(&self) -> &str {
        match &self.correction {
            Some(correction) if self.visited(StageId::ExecuteCorrected) => correction.corrected_sql.as_str(),
            _ => self.generated_sql_text(),
        }
    }

    /// Schemas of every known table.
    pub fn all_schemas(&self) -> BTreeMap<&str, &TableSchema> {
        self.db_info
            .iter()
            .map(|(name, info)| (name.as_str(), &info.schema))
            .collect()
    }

    /// Schemas of the tables the analyze stage selected. Unknown names are skipped.
    pub fn selected_schemas(&self) -> BTreeMap<&str, &TableSchema> {
        let Some(analyzed) = &self.analyzed_query else {
            return BTreeMap::new();
        };
        analyzed
            .selected_tables
            .iter()
            .filter_map(|name| {
                self.db_info
                    .get_key_value(name)
                    .map(|(k, info)| (k.as_str(), &info.schema))
            })
            .collect()
    }

    /// `true` if the last execution produced rows successfully.
    pub fn execution_succeeded(&self) -> bool {
        self.execution_result.as_ref().is_some_and(|r| r.success)
    }
}
