//! External services the workflow depends on.
//!
//! Each collaborator is an object-safe async trait injected through
//! [`StageCtx`](crate::context::StageCtx). Calls to these traits are the
//! only places a run may block. Built-in implementations:
//!
//! | Trait | Implementation |
//! |---|---|
//! | [`SchemaIntrospector`], [`SqlExecutor`] | [`SqliteDatabase`] |
//! | [`MemoryStore`] | [`InMemoryMemoryStore`] |
//! | [`SessionHistory`] | [`InMemorySessionHistory`] |
//! | [`ChartRenderer`] | [`VegaLiteRenderer`] |

pub mod chart;
pub mod memory;
pub mod sqlite;

pub use chart::{ChartRequest, ChartType, RenderedChart, VegaLiteRenderer};
pub use memory::{
    InMemoryMemoryStore, InMemorySessionHistory, DEFAULT_HISTORY_PER_SESSION, DEFAULT_MEMORY_CAPACITY,
};
pub use sqlite::SqliteDatabase;

use crate::error::Result;
use crate::state::{DbInfo, MemorySnippet, Row};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Rows returned by a successful statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Lists tables and their columns. Must not return row data.
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    async fn list_tables(&self) -> Result<DbInfo>;
}

/// Runs SQL text. Read-only use is expected but not enforced here.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn run(&self, sql: &str) -> Result<QueryRows>;
}

/// Long-term memory of past exchanges.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Up to `k` snippets, best match first.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<MemorySnippet>>;

    async fn add(&self, text: &str, metadata: Map<String, Value>) -> Result<()>;

    /// Forget every stored snippet.
    async fn clear(&self) -> Result<()>;
}

/// One past question/answer pair within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub query: String,
    pub response: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn now(query: impl Into<String>, response: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            response: response.into(),
            run_id: run_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Per-session conversation log.
#[async_trait]
pub trait SessionHistory: Send + Sync {
    /// Up to `limit` entries, newest first.
    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryEntry>>;

    async fn append(&self, session_id: &str, entry: HistoryEntry) -> Result<()>;

    /// Drop one session's entries. Unknown sessions are not an error.
    async fn clear(&self, session_id: &str) -> Result<()>;
}

/// Turns result rows into a chart document.
#[async_trait]
pub trait ChartRenderer: Send + Sync {
    async fn render(&self, request: &ChartRequest<'_>) -> Result<RenderedChart>;
}
