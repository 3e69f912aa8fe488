//! Request-level entry point.
//!
//! [`SqlAgent`] wraps a [`WorkflowExecutor`] with the work that happens
//! around a run: assigning a run id, recalling related memories, and
//! recording the exchange afterwards. Memory and history failures are
//! logged and otherwise ignored.

use crate::collaborators::{HistoryEntry, MemoryStore};
use crate::context::StageCtx;
use crate::error::{AgentError, Result};
use crate::executor::WorkflowExecutor;
use crate::state::{MemorySnippet, RequestState, Visualization};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// What the caller gets back for one question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResponse {
    pub summary: String,
    pub visualization: Option<Visualization>,
    pub run_id: String,
}

/// Item of [`SqlAgent::ask_stream`].
#[derive(Debug, Clone)]
pub enum AgentUpdate {
    /// State after one stage.
    Step(RequestState),
    /// The response, after memory and history were updated.
    Final(AgentResponse),
}

/// Answers natural-language questions against a database.
///
/// # Example
///
/// ```no_run
/// use sql_agent::collaborators::{InMemoryMemoryStore, SqliteDatabase};
/// use sql_agent::context::StageCtx;
/// use sql_agent::llm::OllamaGenerator;
/// use sql_agent::SqlAgent;
/// use std::sync::Arc;
///
/// # async fn demo() -> sql_agent::Result<()> {
/// let ctx = StageCtx::builder(Arc::new(OllamaGenerator::new("http://localhost:11434")?))
///     .database(Arc::new(SqliteDatabase::open("shop.db")?))
///     .build()?;
/// let agent = SqlAgent::new(ctx)?.with_memory(Arc::new(InMemoryMemoryStore::new()));
///
/// let response = agent.ask("How many orders do we have?", "session-1").await?;
/// println!("{}", response.summary);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SqlAgent {
    executor: WorkflowExecutor,
    memory: Option<Arc<dyn MemoryStore>>,
}

impl std::fmt::Debug for SqlAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlAgent")
            .field("executor", &self.executor)
            .field("has_memory", &self.memory.is_some())
            .finish()
    }
}

impl SqlAgent {
    pub fn new(ctx: StageCtx) -> Result<Self> {
        Ok(Self::with_executor(WorkflowExecutor::new(ctx)?))
    }

    pub fn with_executor(executor: WorkflowExecutor) -> Self {
        Self {
            executor,
            memory: None,
        }
    }

    /// Recall related exchanges before each run and store each answer after.
    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    /// Forget everything in the attached memory store, if any.
    pub async fn clear_memory(&self) -> Result<()> {
        if let Some(memory) = &self.memory {
            memory.clear().await?;
            info!("memory cleared");
        }
        Ok(())
    }

    /// Drop the recorded history of one session.
    pub async fn clear_session(&self, session_id: &str) -> Result<()> {
        self.executor.context().history.clear(session_id).await?;
        info!(session_id, "session history cleared");
        Ok(())
    }

    /// Answer one question.
    ///
    /// Returns `Err` for a blank query, a schema failure, or cancellation.
    /// Everything else, including a run stopped by the step ceiling, yields a
    /// response.
    pub async fn ask(&self, query: &str, session_id: &str) -> Result<AgentResponse> {
        let state = self.run(query, session_id).await?;
        Ok(self.finish(&state).await)
    }

    /// Like [`ask`](Self::ask) but returns the final state instead of the
    /// response, and records nothing afterwards.
    pub async fn run(&self, query: &str, session_id: &str) -> Result<RequestState> {
        let state = self.prepare(query, session_id).await?;
        self.executor.invoke(state).await
    }

    /// Answer one question, yielding the state after every stage and then
    /// the response.
    pub async fn ask_stream(
        &self,
        query: &str,
        session_id: &str,
    ) -> Result<BoxStream<'static, Result<AgentUpdate>>> {
        let state = self.prepare(query, session_id).await?;
        let run = StreamRun {
            agent: self.clone(),
            states: self.executor.stream(state),
            last: None,
        };

        Ok(stream::unfold(Some(run), |run| async move {
            let mut run = run?;
            match run.states.next().await {
                Some(Ok(state)) => {
                    run.last = Some(state.clone());
                    Some((Ok(AgentUpdate::Step(state)), Some(run)))
                }
                Some(Err(e)) => Some((Err(e), None)),
                None => {
                    let item = match run.last.take() {
                        Some(state) => Ok(AgentUpdate::Final(run.agent.finish(&state).await)),
                        None => Err(AgentError::Other("run ended without producing a state".into())),
                    };
                    Some((item, None))
                }
            }
        })
        .boxed())
    }

    async fn prepare(&self, query: &str, session_id: &str) -> Result<RequestState> {
        let run_id = Uuid::new_v4().to_string();
        let state = RequestState::new(query, session_id, run_id)?;
        info!(run_id = %state.run_id, session_id, "request received");
        let memories = self.recall(query).await;
        Ok(state.with_memories(memories))
    }

    async fn recall(&self, query: &str) -> Vec<MemorySnippet> {
        let k = self.executor.context().config.memory_results;
        let Some(memory) = &self.memory else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        match memory.search(query, k).await {
            Ok(found) => {
                info!(count = found.len(), "memories recalled");
                found
            }
            Err(e) => {
                warn!(error = %e, "memory search failed, continuing without memories");
                Vec::new()
            }
        }
    }

    /// Build the response and record the exchange.
    async fn finish(&self, state: &RequestState) -> AgentResponse {
        let summary = match (&state.summary, &state.error) {
            (Some(summary), _) => summary.clone(),
            (None, Some(error)) => format!("I'm sorry, I couldn't finish answering your question: {error}"),
            (None, None) => "I'm sorry, I couldn't produce an answer to your question.".to_string(),
        };
        let response = AgentResponse {
            summary,
            visualization: state.visualization.clone(),
            run_id: state.run_id.clone(),
        };

        if let Some(memory) = &self.memory {
            let text = format!("Query: {}\nResponse: {}", state.user_query, response.summary);
            let mut metadata = Map::new();
            metadata.insert("session_id".into(), Value::String(state.session_id.clone()));
            metadata.insert("run_id".into(), Value::String(state.run_id.clone()));
            if let Err(e) = memory.add(&text, metadata).await {
                warn!(error = %e, "storing memory failed");
            }
        }

        let entry = HistoryEntry::now(&state.user_query, &response.summary, &state.run_id);
        if let Err(e) = self
            .executor
            .context()
            .history
            .append(&state.session_id, entry)
            .await
        {
            warn!(error = %e, "appending session history failed");
        }

        info!(run_id = %response.run_id, charted = response.visualization.is_some(), "request answered");
        response
    }
}

struct StreamRun {
    agent: SqlAgent,
    states: BoxStream<'static, Result<RequestState>>,
    last: Option<RequestState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryMemoryStore, QueryRows};
    use crate::config::AgentConfig;
    use crate::graph::StageId;
    use crate::llm::ScriptedGenerator;
    use crate::stages::testing::FakeDb;
    use async_trait::async_trait;
    use serde_json::json;

    fn generator() -> ScriptedGenerator {
        ScriptedGenerator::new()
            .reply_json(
                StageId::Analyze,
                json!({"is_query_relevant": true, "analyzed_query": "Count orders", "selected_tables": ["orders"]}),
            )
            .reply_json(StageId::Generate, json!({"sql_query": "SELECT COUNT(*) AS n FROM orders"}))
            .reply_json(StageId::Validate, json!({"is_sql_valid": true}))
            .reply_json(StageId::Evaluate, json!({"is_result_relevant": true, "summary": "3 orders"}))
            .reply(StageId::Summarize, "You have 3 orders.")
    }

    fn agent_with(generator: ScriptedGenerator, config: AgentConfig) -> SqlAgent {
        let rows = QueryRows {
            columns: vec!["n".into()],
            rows: vec![json!({"n": 3}).as_object().cloned().unwrap()],
        };
        let ctx = StageCtx::builder(Arc::new(generator))
            .database(Arc::new(FakeDb { rows: Ok(rows) }))
            .config(config)
            .build()
            .unwrap();
        SqlAgent::new(ctx).unwrap()
    }

    struct BrokenMemory;

    #[async_trait]
    impl MemoryStore for BrokenMemory {
        async fn search(&self, _query: &str, _k: usize) -> Result<Vec<MemorySnippet>> {
            Err(AgentError::collaborator("memory", "index offline"))
        }

        async fn add(&self, _text: &str, _metadata: Map<String, Value>) -> Result<()> {
            Err(AgentError::collaborator("memory", "index offline"))
        }

        async fn clear(&self) -> Result<()> {
            Err(AgentError::collaborator("memory", "index offline"))
        }
    }

    #[tokio::test]
    async fn test_ask_records_the_exchange() {
        let memory = Arc::new(InMemoryMemoryStore::new());
        let agent = agent_with(generator(), AgentConfig::default()).with_memory(memory.clone());

        let response = agent.ask("How many orders?", "s1").await.unwrap();
        assert_eq!(response.summary, "You have 3 orders.");
        assert!(response.visualization.is_none());
        assert!(Uuid::parse_str(&response.run_id).is_ok());

        let stored = memory.search("orders", 5).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].text, "Query: How many orders?\nResponse: You have 3 orders.");
        assert_eq!(stored[0].metadata["run_id"], json!(response.run_id));

        let history = agent.executor().context().history.recent("s1", 5).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].response, "You have 3 orders.");
    }

    #[tokio::test]
    async fn test_recalled_memories_reach_analysis() {
        let generator = Arc::new(generator());
        let ctx = StageCtx::builder(generator.clone())
            .database(Arc::new(FakeDb { rows: Ok(QueryRows::default()) }))
            .build()
            .unwrap();
        let memory = Arc::new(InMemoryMemoryStore::new());
        memory
            .add("Query: orders last week\nResponse: 12", Map::new())
            .await
            .unwrap();
        let agent = SqlAgent::new(ctx).unwrap().with_memory(memory);

        let state = agent.run("How many orders?", "s1").await.unwrap();
        assert_eq!(state.memories.len(), 1);
        let analyze = generator
            .calls()
            .into_iter()
            .find(|c| c.stage == StageId::Analyze)
            .unwrap();
        assert!(analyze.prompt.contains("orders last week"));
    }

    #[tokio::test]
    async fn test_memory_failures_are_ignored() {
        let agent = agent_with(generator(), AgentConfig::default()).with_memory(Arc::new(BrokenMemory));
        let response = agent.ask("How many orders?", "s1").await.unwrap();
        assert_eq!(response.summary, "You have 3 orders.");
    }

    #[tokio::test]
    async fn test_clear_memory_and_session() {
        let memory = Arc::new(InMemoryMemoryStore::new());
        let agent = agent_with(generator(), AgentConfig::default()).with_memory(memory.clone());
        agent.ask("How many orders?", "s1").await.unwrap();
        assert_eq!(memory.len().await, 1);

        agent.clear_memory().await.unwrap();
        assert!(memory.is_empty().await);

        agent.clear_session("s1").await.unwrap();
        let history = agent.executor().context().history.recent("s1", 5).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_clear_memory_reports_store_failure() {
        let agent = agent_with(generator(), AgentConfig::default()).with_memory(Arc::new(BrokenMemory));
        assert!(agent.clear_memory().await.is_err());
    }

    #[tokio::test]
    async fn test_blank_query_rejected() {
        let agent = agent_with(generator(), AgentConfig::default());
        let err = agent.ask("   ", "s1").await.unwrap_err();
        assert!(matches!(err, AgentError::EmptyQuery));
    }

    #[tokio::test]
    async fn test_halted_run_still_answers() {
        let agent = agent_with(generator(), AgentConfig::default().with_step_ceiling(2));
        let response = agent.ask("How many orders?", "s1").await.unwrap();
        assert!(response.summary.contains("step ceiling of 2"));
    }

    #[tokio::test]
    async fn test_ask_stream_ends_with_final() {
        let agent = agent_with(generator(), AgentConfig::default());
        let updates: Vec<AgentUpdate> = agent
            .ask_stream("How many orders?", "s1")
            .await
            .unwrap()
            .map(|u| u.unwrap())
            .collect()
            .await;

        assert_eq!(updates.len(), 9);
        assert!(updates[..8].iter().all(|u| matches!(u, AgentUpdate::Step(_))));
        match updates.last().unwrap() {
            AgentUpdate::Final(response) => assert_eq!(response.summary, "You have 3 orders."),
            other => panic!("expected final update, got {other:?}"),
        }
    }
}
