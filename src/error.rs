use std::time::Duration;
use thiserror::Error;

/// Errors produced by the agent and its collaborators.
///
/// Most of these never reach the caller of
/// [`WorkflowExecutor::invoke`](crate::executor::WorkflowExecutor::invoke):
/// stages catch them and write a result-shaped value into the request state.
/// Only [`AgentError::Schema`] and [`AgentError::Cancelled`] escape a run.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON (de)serialization failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema introspection failed. Fatal for the request.
    #[error("schema introspection failed: {message}")]
    Schema { message: String },

    /// The SQL engine rejected or failed a statement.
    #[error("SQL execution failed: {message}")]
    Sql { message: String },

    /// HTTP error with status code, response body, and optional Retry-After hint.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// A request was submitted without any question text.
    #[error("user query must not be empty")]
    EmptyQuery,

    /// The run was cancelled via the cancellation flag.
    #[error("request was cancelled")]
    Cancelled,

    /// Invalid configuration detected at build time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The workflow graph failed structural validation.
    #[error("invalid workflow graph: {0}")]
    InvalidGraph(String),

    /// A memory, session-history or chart collaborator failed.
    #[error("{name} failed: {message}")]
    Collaborator { name: &'static str, message: String },

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    pub(crate) fn schema(message: impl Into<String>) -> Self {
        AgentError::Schema {
            message: message.into(),
        }
    }

    pub(crate) fn sql(message: impl Into<String>) -> Self {
        AgentError::Sql {
            message: message.into(),
        }
    }

    pub(crate) fn collaborator(name: &'static str, message: impl Into<String>) -> Self {
        AgentError::Collaborator {
            name,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Other(err.to_string())
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(err: rusqlite::Error) -> Self {
        AgentError::sql(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
