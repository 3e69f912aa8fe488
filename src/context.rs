//! The dependency bundle every stage runs against.
//!
//! [`StageCtx`] is built once per process (or per agent) and shared by all
//! requests. It carries the injected collaborators, the configuration, the
//! transport retry policy, and the optional cancellation flag and event
//! handler.

use crate::collaborators::{
    ChartRenderer, InMemorySessionHistory, SchemaIntrospector, SessionHistory, SqlExecutor,
    VegaLiteRenderer,
};
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::llm::{BackoffConfig, TextGenerator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The default history keeps this many times `history_limit` entries per session.
const HISTORY_RETENTION: usize = 10;

/// Shared execution context for stage invocations.
///
/// # Example
///
/// ```
/// use sql_agent::collaborators::SqliteDatabase;
/// use sql_agent::context::StageCtx;
/// use sql_agent::llm::ScriptedGenerator;
/// use std::sync::Arc;
///
/// # fn demo(db: Arc<SqliteDatabase>) -> sql_agent::Result<()> {
/// let ctx = StageCtx::builder(Arc::new(ScriptedGenerator::new()))
///     .database(db)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct StageCtx {
    pub generator: Arc<dyn TextGenerator>,
    pub schema: Arc<dyn SchemaIntrospector>,
    pub sql: Arc<dyn SqlExecutor>,
    pub history: Arc<dyn SessionHistory>,
    pub charts: Arc<dyn ChartRenderer>,
    pub config: AgentConfig,
    /// Transport retry for text generation. Default: [`BackoffConfig::none()`].
    pub backoff: BackoffConfig,
    /// Checked at every stage boundary and before each generation attempt.
    pub cancellation: Option<Arc<AtomicBool>>,
    pub event_handler: Option<Arc<dyn EventHandler>>,
}

impl StageCtx {
    pub fn builder(generator: Arc<dyn TextGenerator>) -> StageCtxBuilder {
        StageCtxBuilder {
            generator,
            schema: None,
            sql: None,
            history: None,
            charts: None,
            config: None,
            backoff: None,
            cancellation: None,
            event_handler: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Return [`AgentError::Cancelled`] if cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    pub fn cancel_flag(&self) -> Option<&AtomicBool> {
        self.cancellation.as_deref()
    }

    pub(crate) fn emit(&self, event: Event) {
        emit(&self.event_handler, event);
    }
}

impl std::fmt::Debug for StageCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageCtx")
            .field("generator", &self.generator.name())
            .field("config", &self.config)
            .field("backoff", &self.backoff)
            .field("has_cancellation", &self.cancellation.is_some())
            .field("has_event_handler", &self.event_handler.is_some())
            .finish()
    }
}

/// Builder for [`StageCtx`].
pub struct StageCtxBuilder {
    generator: Arc<dyn TextGenerator>,
    schema: Option<Arc<dyn SchemaIntrospector>>,
    sql: Option<Arc<dyn SqlExecutor>>,
    history: Option<Arc<dyn SessionHistory>>,
    charts: Option<Arc<dyn ChartRenderer>>,
    config: Option<AgentConfig>,
    backoff: Option<BackoffConfig>,
    cancellation: Option<Arc<AtomicBool>>,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl StageCtxBuilder {
    /// Use one object for both schema introspection and SQL execution.
    pub fn database<D>(mut self, db: Arc<D>) -> Self
    where
        D: SchemaIntrospector + SqlExecutor + 'static,
    {
        self.schema = Some(db.clone());
        self.sql = Some(db);
        self
    }

    pub fn schema(mut self, schema: Arc<dyn SchemaIntrospector>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn sql(mut self, sql: Arc<dyn SqlExecutor>) -> Self {
        self.sql = Some(sql);
        self
    }

    /// Default: a fresh [`InMemorySessionHistory`] keeping ten times
    /// `history_limit` entries per session.
    pub fn history(mut self, history: Arc<dyn SessionHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Default: [`VegaLiteRenderer`].
    pub fn charts(mut self, charts: Arc<dyn ChartRenderer>) -> Self {
        self.charts = Some(charts);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancellation = Some(flag);
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Fails if no schema introspector or SQL executor was given, or the
    /// configuration does not validate.
    pub fn build(self) -> Result<StageCtx> {
        let schema = self
            .schema
            .ok_or_else(|| AgentError::InvalidConfig("a schema introspector is required".into()))?;
        let sql = self
            .sql
            .ok_or_else(|| AgentError::InvalidConfig("a SQL executor is required".into()))?;
        let config = self.config.unwrap_or_default().validate()?;

        Ok(StageCtx {
            generator: self.generator,
            schema,
            sql,
            history: self.history.unwrap_or_else(|| {
                Arc::new(InMemorySessionHistory::with_capacity(
                    config.history_limit.saturating_mul(HISTORY_RETENTION),
                ))
            }),
            charts: self.charts.unwrap_or_else(|| Arc::new(VegaLiteRenderer)),
            config,
            backoff: self.backoff.unwrap_or_else(BackoffConfig::none),
            cancellation: self.cancellation,
            event_handler: self.event_handler,
        })
    }
}
