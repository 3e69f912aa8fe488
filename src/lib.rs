//! # SQL Agent
//!
//! Answer natural-language questions against a relational database through
//! a bounded graph of LLM-assisted stages.
//!
//! A request moves through schema introspection, query analysis, SQL
//! generation and validation (with a regenerate loop capped at three
//! attempts), execution, result evaluation, an optional single correction
//! pass, optional charting, and a final summary. Model replies are decoded
//! tolerantly: a stage never fails because the model ignored its format.
//!
//! ## Core Concepts
//!
//! - **[`RequestState`]**: the typed record a request carries through the
//!   graph. Each stage takes it by value and hands it back.
//! - **[`Stage`](stages::Stage)**: object-safe unit of work. One
//!   implementation per graph node in [`stages`].
//! - **[`WorkflowGraph`]**: stage ids, fixed and conditional edges,
//!   validated at build time. Routing predicates live in [`routing`].
//! - **[`WorkflowExecutor`]**: runs the graph with `invoke` (final state)
//!   or `stream` (one snapshot per stage), enforcing the step ceiling,
//!   deadline and cancellation.
//! - **[`StageCtx`]**: the injected collaborators (text generator, schema
//!   introspector, SQL executor, session history, chart renderer).
//! - **[`SqlAgent`]**: request facade adding run ids, memory recall and
//!   session history around the executor.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sql_agent::collaborators::SqliteDatabase;
//! use sql_agent::llm::OllamaGenerator;
//! use sql_agent::{AgentConfig, SqlAgent, StageCtx};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig::from_env()?;
//!     let ctx = StageCtx::builder(Arc::new(OllamaGenerator::new(&config.base_url)?))
//!         .database(Arc::new(SqliteDatabase::open("shop.db")?))
//!         .config(config)
//!         .build()?;
//!
//!     let agent = SqlAgent::new(ctx)?;
//!     let response = agent.ask("Which region sold the most last month?", "session-1").await?;
//!     println!("{}", response.summary);
//!     Ok(())
//! }
//! ```
//!
//! ## Testing without a model
//!
//! [`ScriptedGenerator`](llm::ScriptedGenerator) replays canned replies per
//! stage and records every request, so whole runs can be driven from tests.

pub mod agent;
pub mod call;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod llm;
pub mod parser;
pub mod prompts;
pub mod routing;
pub mod stages;
pub mod state;

pub use agent::{AgentResponse, AgentUpdate, SqlAgent};
pub use config::AgentConfig;
pub use context::{StageCtx, StageCtxBuilder};
pub use error::{AgentError, Result};
pub use events::{Event, EventHandler, FnEventHandler};
pub use executor::WorkflowExecutor;
pub use graph::{StageId, Target, WorkflowGraph};
pub use llm::{BackoffConfig, TextGenerator};
pub use parser::{parse_reply, ParseTier, StageSchema};
pub use routing::RetryPolicy;
pub use stages::{Stage, StageSet};
pub use state::RequestState;
