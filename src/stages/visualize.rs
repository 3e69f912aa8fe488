use super::{question, unless_cancelled, BoxFut, Stage};
use crate::call::StructuredCall;
use crate::collaborators::{ChartRequest, ChartType};
use crate::context::StageCtx;
use crate::error::Result;
use crate::graph::StageId;
use crate::parser::{FieldMap, ParseTier, StageSchema};
use crate::prompts;
use crate::state::{ExecutionResult, RequestState, Row, Visualization};
use base64::Engine as _;
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

static REPLY: Lazy<StageSchema> = Lazy::new(|| {
    StageSchema::new("visualize")
        .text("visualization_type", "bar")
        .text("x_column", "")
        .text("y_column", "")
        .text("title", "")
        .text("explanation", "")
});

const SAMPLE_ROWS: usize = 5;

/// Branch point before charting. Changes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckVisualizationStage;

impl Stage for CheckVisualizationStage {
    fn id(&self) -> StageId {
        StageId::CheckVisualization
    }

    fn run<'a>(&'a self, _ctx: &'a StageCtx, state: RequestState) -> BoxFut<'a, Result<RequestState>> {
        Box::pin(async move {
            debug!(
                requires_visualization = state
                    .evaluation_result
                    .as_ref()
                    .is_some_and(|e| e.requires_visualization),
                "visualization checkpoint"
            );
            Ok(state)
        })
    }
}

/// The chart the model picked, after checking it against the result columns.
#[derive(Debug, Clone, PartialEq)]
struct ChartChoice {
    chart_type: ChartType,
    x_column: String,
    y_column: Option<String>,
    title: Option<String>,
    explanation: String,
}

impl ChartChoice {
    /// Bar chart over the first column, and the second if there is one.
    fn fallback(columns: &[String]) -> Option<Self> {
        let x_column = columns.first()?.clone();
        Some(Self {
            chart_type: ChartType::Bar,
            x_column,
            y_column: columns.get(1).cloned(),
            title: None,
            explanation: String::new(),
        })
    }

    fn from_reply(fields: &FieldMap, columns: &[String]) -> Option<Self> {
        let chart_type = match fields.get_text("visualization_type").parse::<ChartType>() {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "unsupported chart type, using the default chart");
                return Self::fallback(columns);
            }
        };
        let x_column = fields.get_text("x_column");
        if !columns.contains(&x_column) {
            warn!(column = %x_column, "x column not in results, using the default chart");
            return Self::fallback(columns);
        }
        let y_column = Some(fields.get_text("y_column")).filter(|y| columns.contains(y));
        let title = Some(fields.get_text("title")).filter(|t| !t.trim().is_empty());

        Some(Self {
            chart_type,
            x_column,
            y_column,
            title,
            explanation: fields.get_text("explanation"),
        })
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "text",
        Value::Array(_) | Value::Object(_) => "json",
    }
}

/// Column name to the type of its first non-null value.
fn column_types(result: &ExecutionResult) -> Map<String, Value> {
    result
        .columns
        .iter()
        .map(|column| {
            let kind = result
                .rows
                .iter()
                .filter_map(|row| row.get(column))
                .find(|v| !v.is_null())
                .map(value_kind)
                .unwrap_or("null");
            (column.clone(), Value::String(kind.to_string()))
        })
        .collect()
}

fn sample_rows(rows: &[Row]) -> String {
    let sample: Vec<&Row> = rows.iter().take(SAMPLE_ROWS).collect();
    serde_json::to_string(&sample).unwrap_or_else(|_| "[]".to_string())
}

/// Picks a chart for the results and renders it.
///
/// Does nothing unless execution succeeded and evaluation asked for a chart.
/// A failed or nonsensical selection falls back to a bar chart; a failed
/// render leaves `visualization` empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisualizeStage;

impl VisualizeStage {
    async fn select(ctx: &StageCtx, state: &RequestState, result: &ExecutionResult) -> Result<Option<ChartChoice>> {
        let call = StructuredCall::new(StageId::Visualize, prompts::VISUALIZE)
            .var("user_query", state.user_query.clone())
            .var("analyzed_query", question(state))
            .var("sql_query", state.executed_sql_text())
            .var("sample_data", sample_rows(&result.rows))
            .var("data_types", Value::Object(column_types(result)).to_string());

        let choice = match unless_cancelled(call.parse(ctx, &REPLY).await)? {
            Ok(reply) if reply.tier != ParseTier::Defaulted => ChartChoice::from_reply(&reply.fields, &result.columns),
            Ok(_) => {
                warn!("chart selection reply had no recognizable fields, using the default chart");
                ChartChoice::fallback(&result.columns)
            }
            Err(e) => {
                error!(error = %e, "chart selection failed, using the default chart");
                ChartChoice::fallback(&result.columns)
            }
        };
        Ok(choice)
    }
}

impl Stage for VisualizeStage {
    fn id(&self) -> StageId {
        StageId::Visualize
    }

    fn run<'a>(&'a self, ctx: &'a StageCtx, mut state: RequestState) -> BoxFut<'a, Result<RequestState>> {
        Box::pin(async move {
            let wanted = state
                .evaluation_result
                .as_ref()
                .is_some_and(|e| e.requires_visualization);
            let result = match &state.execution_result {
                Some(r) if r.success && wanted => r,
                _ => {
                    info!("no chart needed");
                    state.visualization = None;
                    return Ok(state);
                }
            };
            if result.rows.is_empty() {
                info!("no rows to chart");
                state.visualization = None;
                return Ok(state);
            }

            let Some(choice) = Self::select(ctx, &state, result).await? else {
                warn!("results have no columns to chart");
                state.visualization = None;
                return Ok(state);
            };
            info!(
                chart = %choice.chart_type,
                x = %choice.x_column,
                y = ?choice.y_column,
                "chart selected"
            );

            let request = ChartRequest {
                rows: &result.rows,
                query: &state.user_query,
                chart_type: choice.chart_type,
                x_column: choice.x_column,
                y_column: choice.y_column,
                title: choice.title,
            };
            let visualization = match unless_cancelled(ctx.charts.render(&request).await)? {
                Ok(chart) => Some(Visualization {
                    image: base64::engine::general_purpose::STANDARD.encode(&chart.bytes),
                    description: chart.description,
                    explanation: choice.explanation,
                }),
                Err(e) => {
                    error!(error = %e, "chart rendering failed");
                    None
                }
            };

            state.visualization = visualization;
            Ok(state)
        })
    }
}
