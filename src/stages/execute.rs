use super::{unless_cancelled, BoxFut, Stage};
use crate::context::StageCtx;
use crate::error::{AgentError, Result};
use crate::graph::StageId;
use crate::state::{ExecutionResult, RequestState};
use tracing::{info, warn};

/// Which SQL text an [`ExecuteStage`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlSource {
    /// `generated_sql.query_text`.
    Generated,
    /// `correction.corrected_sql`, or the generated SQL when there is no
    /// correction record.
    Corrected,
}

/// Runs SQL against the database. Driver errors become a failed
/// [`ExecutionResult`]; they never end the run.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteStage {
    source: SqlSource,
}

impl ExecuteStage {
    pub fn new(source: SqlSource) -> Self {
        Self { source }
    }

    fn sql_text(&self, state: &RequestState) -> String {
        match (self.source, &state.correction) {
            (SqlSource::Corrected, Some(correction)) => correction.corrected_sql.clone(),
            _ => state.generated_sql_text().to_string(),
        }
    }
}

impl Stage for ExecuteStage {
    fn id(&self) -> StageId {
        match self.source {
            SqlSource::Generated => StageId::Execute,
            SqlSource::Corrected => StageId::ExecuteCorrected,
        }
    }

    fn run<'a>(&'a self, ctx: &'a StageCtx, mut state: RequestState) -> BoxFut<'a, Result<RequestState>> {
        Box::pin(async move {
            let sql = self.sql_text(&state);
            info!(source = ?self.source, %sql, "executing SQL");

            let result = if sql.trim().is_empty() {
                warn!("no SQL to execute");
                ExecutionResult::failed("No SQL query available to execute")
            } else {
                match unless_cancelled(ctx.sql.run(&sql).await)? {
                    Ok(rows) => {
                        info!(rows = rows.rows.len(), columns = rows.columns.len(), "SQL executed");
                        ExecutionResult::succeeded(rows.columns, rows.rows)
                    }
                    Err(e) => {
                        warn!(error = %e, "SQL execution failed");
                        let message = match e {
                            AgentError::Sql { message } => message,
                            other => other.to_string(),
                        };
                        ExecutionResult::failed(message)
                    }
                }
            };

            state.execution_result = Some(result);
            Ok(state)
        })
    }
}
