//! Chart types and the built-in Vega-Lite renderer.

use super::ChartRenderer;
use crate::error::{AgentError, Result};
use crate::state::Row;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Line,
    Scatter,
    Pie,
    Histogram,
    Box,
    Heatmap,
}

impl ChartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::Bar => "bar",
            ChartType::Line => "line",
            ChartType::Scatter => "scatter",
            ChartType::Pie => "pie",
            ChartType::Histogram => "histogram",
            ChartType::Box => "box",
            ChartType::Heatmap => "heatmap",
        }
    }

    /// `"Bar"`, `"Line"`, ...
    pub fn title_case(&self) -> String {
        let s = self.as_str();
        let mut out = s[..1].to_ascii_uppercase();
        out.push_str(&s[1..]);
        out
    }
}

impl fmt::Display for ChartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChartType {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bar" => Ok(ChartType::Bar),
            "line" => Ok(ChartType::Line),
            "scatter" => Ok(ChartType::Scatter),
            "pie" => Ok(ChartType::Pie),
            "histogram" => Ok(ChartType::Histogram),
            "box" => Ok(ChartType::Box),
            "heatmap" => Ok(ChartType::Heatmap),
            other => Err(AgentError::Other(format!("unknown chart type {other:?}"))),
        }
    }
}

/// What to draw.
#[derive(Debug, Clone)]
pub struct ChartRequest<'a> {
    pub rows: &'a [Row],
    /// The user's question, used in the default title and description.
    pub query: &'a str,
    pub chart_type: ChartType,
    pub x_column: String,
    pub y_column: Option<String>,
    pub title: Option<String>,
}

impl ChartRequest<'_> {
    /// `"Bar chart visualization of region vs total for the query: ..."`.
    pub fn description(&self) -> String {
        match &self.y_column {
            Some(y) => format!(
                "{} chart visualization of {} vs {} for the query: {}",
                self.chart_type.title_case(),
                self.x_column,
                y,
                self.query
            ),
            None => format!(
                "{} chart visualization of {} for the query: {}",
                self.chart_type.title_case(),
                self.x_column,
                self.query
            ),
        }
    }
}

/// A rendered chart document.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedChart {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub description: String,
}

/// Renders charts as Vega-Lite v5 JSON specs with the data inlined.
#[derive(Debug, Clone, Default)]
pub struct VegaLiteRenderer;

impl VegaLiteRenderer {
    pub const MIME_TYPE: &'static str = "application/vnd.vegalite.v5+json";

    /// Build the Vega-Lite document for `request`.
    pub fn spec(request: &ChartRequest<'_>) -> Value {
        let x = &request.x_column;
        let x_type = field_type(request.rows, x);
        let title = request
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("Visualization for: {}", request.query));

        let (mark, encoding) = match (&request.chart_type, &request.y_column) {
            (ChartType::Pie, Some(y)) => (
                json!({"type": "arc", "innerRadius": 50}),
                json!({
                    "theta": {"field": y, "type": "quantitative"},
                    "color": {"field": x, "type": "nominal"},
                }),
            ),
            (ChartType::Histogram, _) => (
                json!("bar"),
                json!({
                    "x": {"field": x, "bin": true, "type": x_type},
                    "y": {"aggregate": "count", "type": "quantitative"},
                }),
            ),
            (ChartType::Heatmap, Some(y)) => (
                json!("rect"),
                json!({
                    "x": {"field": x, "type": "nominal"},
                    "y": {"field": y, "type": "nominal"},
                    "color": {"aggregate": "count", "type": "quantitative"},
                }),
            ),
            (chart, Some(y)) => (
                mark_for(*chart),
                json!({
                    "x": {"field": x, "type": x_type},
                    "y": {"field": y, "type": field_type(request.rows, y)},
                }),
            ),
            (chart, None) => (
                mark_for(*chart),
                json!({
                    "x": {"field": x, "type": x_type},
                    "y": {"aggregate": "count", "type": "quantitative"},
                }),
            ),
        };

        json!({
            "$schema": "https://vega.github.io/schema/vega-lite/v5.json",
            "title": title,
            "width": 600,
            "height": 350,
            "data": {"values": request.rows},
            "mark": mark,
            "encoding": encoding,
        })
    }
}

fn mark_for(chart: ChartType) -> Value {
    match chart {
        ChartType::Line => json!({"type": "line", "point": true}),
        ChartType::Scatter => json!("point"),
        ChartType::Box => json!("boxplot"),
        ChartType::Pie => json!("arc"),
        ChartType::Heatmap => json!("rect"),
        ChartType::Bar | ChartType::Histogram => json!("bar"),
    }
}

/// Vega-Lite field type inferred from the non-null values of `column`.
fn field_type(rows: &[Row], column: &str) -> &'static str {
    let mut values = rows.iter().filter_map(|r| r.get(column)).filter(|v| !v.is_null()).peekable();
    if values.peek().is_none() {
        return "nominal";
    }
    let values: Vec<&Value> = values.collect();
    if values.iter().all(|v| v.is_number()) {
        "quantitative"
    } else if values.iter().all(|v| v.as_str().is_some_and(is_temporal)) {
        "temporal"
    } else {
        "nominal"
    }
}

fn is_temporal(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() || DateTime::parse_from_rfc3339(s).is_ok()
}

#[async_trait]
impl ChartRenderer for VegaLiteRenderer {
    async fn render(&self, request: &ChartRequest<'_>) -> Result<RenderedChart> {
        let bytes = serde_json::to_vec(&Self::spec(request))?;
        Ok(RenderedChart {
            bytes,
            mime_type: Self::MIME_TYPE,
            description: request.description(),
        })
    }
}
