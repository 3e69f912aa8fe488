//! Example: a full run against a throwaway SQLite database, with canned
//! model replies instead of a live LLM.
//!
//! Run with: `cargo run --example scripted_run`
//! Set `RUST_LOG=sql_agent=debug` to see every stage and routing decision.

use anyhow::Context;
use futures::StreamExt;
use rusqlite::Connection;
use serde_json::json;
use sql_agent::collaborators::{InMemoryMemoryStore, SqliteDatabase};
use sql_agent::llm::ScriptedGenerator;
use sql_agent::{AgentUpdate, Event, FnEventHandler, SqlAgent, StageCtx, StageId};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sql_agent=info")))
        .init();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("shop.db");
    Connection::open(&path)?.execute_batch(
        "CREATE TABLE orders (order_id INTEGER PRIMARY KEY, region TEXT, total REAL);
         INSERT INTO orders VALUES (1, 'north', 10.0), (2, 'north', 2.5), (3, 'south', 4.0);",
    )?;

    // The first SQL is rejected once so the regenerate loop shows up.
    let generator = ScriptedGenerator::new()
        .reply_json(
            StageId::Analyze,
            json!({
                "is_query_relevant": true,
                "analyzed_query": "Total order value per region",
                "selected_tables": ["orders"],
                "explanation": "orders has a region and a total"
            }),
        )
        .reply_json(StageId::Generate, json!({"sql_query": "SELECT region, SUM(total) FROM orders"}))
        .reply_json(
            StageId::Validate,
            json!({
                "is_sql_valid": false,
                "issues": ["aggregate without GROUP BY"],
                "suggested_fix": "GROUP BY region"
            }),
        )
        .reply_json(
            StageId::Generate,
            json!({"sql_query": "SELECT region, SUM(total) AS total FROM orders GROUP BY region"}),
        )
        .reply_json(StageId::Validate, json!({"is_sql_valid": true, "issues": []}))
        .reply_json(
            StageId::Evaluate,
            json!({
                "is_result_relevant": true,
                "explanation": "one total per region",
                "requires_visualization": true,
                "summary": "North leads with 12.5."
            }),
        )
        .reply(
            StageId::Visualize,
            "```json\n{\"visualization_type\": \"bar\", \"x_column\": \"region\", \"y_column\": \"total\"}\n```",
        )
        .reply(StageId::Summarize, "North sold 12.5 in total, south 4.0.");

    let ctx = StageCtx::builder(Arc::new(generator))
        .database(Arc::new(SqliteDatabase::open(&path)?))
        .event_handler(Arc::new(FnEventHandler(|event: Event| {
            if let Event::Regenerate { attempt, issues } = event {
                println!("  regenerate #{attempt}: {}", issues.join("; "));
            }
        })))
        .build()?;
    let agent = SqlAgent::new(ctx)?.with_memory(Arc::new(InMemoryMemoryStore::new()));

    println!("{}", agent.executor().graph().to_mermaid());

    let mut updates = agent.ask_stream("What were total sales by region?", "demo").await?;
    while let Some(update) = updates.next().await {
        match update? {
            AgentUpdate::Step(state) => {
                let stage = state.trace.last().context("snapshot without a stage")?;
                println!("step {:>2}: {stage}", state.steps());
            }
            AgentUpdate::Final(response) => {
                println!("\nrun {}", response.run_id);
                println!("answer: {}", response.summary);
                if let Some(viz) = response.visualization {
                    println!("chart: {}", viz.description);
                }
            }
        }
    }

    Ok(())
}
