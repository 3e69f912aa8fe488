//! Example: ask a question about a SQLite database through a local Ollama
//! server.
//!
//! Run with: `cargo run --example sqlite_agent -- path/to/db.sqlite "How many orders do we have?"`
//!
//! Model and limits come from `SQL_AGENT_*` environment variables
//! (see `AgentConfig::from_env`).

use anyhow::{bail, Context};
use sql_agent::collaborators::SqliteDatabase;
use sql_agent::llm::{BackoffConfig, OllamaGenerator};
use sql_agent::{AgentConfig, SqlAgent, StageCtx};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sql_agent=info")))
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(db_path), Some(question)) = (args.next(), args.next()) else {
        bail!("usage: sqlite_agent <database> <question>");
    };

    let config = AgentConfig::from_env()?;
    let generator = OllamaGenerator::new(&config.base_url)?;
    let database = SqliteDatabase::open(&db_path).with_context(|| format!("opening {db_path}"))?;

    // Ctrl-C stops the run at the next stage boundary.
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::Relaxed);
        }
    });

    let ctx = StageCtx::builder(Arc::new(generator))
        .database(Arc::new(database))
        .config(config)
        .backoff(BackoffConfig::standard())
        .cancellation(cancel)
        .build()?;
    let agent = SqlAgent::new(ctx)?;

    let response = agent.ask(&question, "cli").await?;
    println!("{}", response.summary);
    if let Some(viz) = response.visualization {
        println!("\n{}", viz.description);
        if !viz.explanation.is_empty() {
            println!("{}", viz.explanation);
        }
    }
    Ok(())
}
