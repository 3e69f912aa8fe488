use super::{BoxFut, Stage};
use crate::context::StageCtx;
use crate::error::{AgentError, Result};
use crate::graph::StageId;
use crate::state::RequestState;
use tracing::{error, info};

/// Loads table schemas into `db_info`.
///
/// The one stage whose failure ends the request: nothing downstream is
/// meaningful without a schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaStage;

impl Stage for SchemaStage {
    fn id(&self) -> StageId {
        StageId::Schema
    }

    fn run<'a>(&'a self, ctx: &'a StageCtx, mut state: RequestState) -> BoxFut<'a, Result<RequestState>> {
        Box::pin(async move {
            let db_info = ctx.schema.list_tables().await.map_err(|e| {
                error!(error = %e, "schema introspection failed");
                match e {
                    AgentError::Schema { .. } => e,
                    other => AgentError::schema(other.to_string()),
                }
            })?;

            info!(tables = db_info.len(), "schema loaded");
            state.db_info = db_info;
            Ok(state)
        })
    }
}
