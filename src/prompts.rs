//! Prompt templates for each stage, and the renderer that fills them in.
//!
//! Templates use `{key}` placeholders. `{{` and `}}` produce literal braces,
//! which the JSON reply examples rely on. The wording is not part of any
//! contract; the field names in each reply example are, because
//! [`crate::parser`] decodes replies against them.

/// Sentinel that should never appear in real templates.
const ESCAPE_OPEN: &str = "\x00LBRACE\x00";
const ESCAPE_CLOSE: &str = "\x00RBRACE\x00";

/// Substitute `{key}` placeholders.
///
/// ```
/// use sql_agent::prompts::render;
///
/// let out = render("Hi {name}: {{\"ok\": true}}", &[("name", "Ada".to_string())]);
/// assert_eq!(out, r#"Hi Ada: {"ok": true}"#);
/// ```
pub fn render(template: &str, vars: &[(&str, String)]) -> String {
    let mut rendered = template
        .replace("{{", ESCAPE_OPEN)
        .replace("}}", ESCAPE_CLOSE);
    for (key, value) in vars {
        // Values may contain braces of their own; protect them from later keys.
        let value = value.replace('{', ESCAPE_OPEN).replace('}', ESCAPE_CLOSE);
        rendered = rendered.replace(&format!("{{{key}}}", key = key), &value);
    }
    rendered.replace(ESCAPE_OPEN, "{").replace(ESCAPE_CLOSE, "}")
}

/// `1. first\n2. second`. Empty input gives `placeholder`.
pub fn numbered(items: &[String], placeholder: &str) -> String {
    if items.is_empty() {
        return placeholder.to_string();
    }
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n")
}

pub const ANALYZE: &str = r#"The user asked: "{user_query}"

Database tables:
{table_information}

Relevant memories from earlier conversations:
{relevant_memories}

1. Decide whether the question can be answered from these tables. Joins and aggregations are fine.
2. If it can, restate the question so the data it needs is unambiguous.
3. If it can, pick at most {max_tables} tables that are needed. Only use table names listed above.
4. Briefly explain your decision.

Reply with JSON only:
{{
  "is_query_relevant": true,
  "analyzed_query": "the restated question",
  "selected_tables": ["table1", "table2"],
  "explanation": "why the question is or is not answerable and why these tables"
}}"#;

pub const GENERATE: &str = r#"Question: "{analyzed_query}"

Tables available for this question:
{table_information}

Relevant memories from earlier conversations:
{relevant_memories}

{reflection}
Write one complete SQL query that answers the question.
- No placeholders; the query must run as written.
- Use only the tables listed above.
- Never modify data: no INSERT, UPDATE, DELETE, DROP or ALTER.
- Do not select whole tables without a reason; prefer aggregates and LIMIT.

Reply with JSON only:
{{
  "sql_query": "the SQL query",
  "explanation": "what the query does and why"
}}"#;

pub const GENERATE_REFLECTION: &str = r#"The previous attempt was rejected.
Issues:
{issues}
Suggested fix: {suggestion}
Address this in the new query.
"#;

pub const VALIDATE: &str = r#"Original question: {original_query}
Restated question: {analyzed_query}
SQL query: {sql_query}
Query explanation: {sql_explanation}

Schemas of the selected tables:
{table_schemas}

Check the query for:
1. syntax errors
2. injection risks or statements that modify data
3. tables or columns that do not exist in the schemas
4. wrong JOIN or WHERE logic
5. misuse of aggregates or GROUP BY
6. relevance to the original question
7. selecting whole tables without a limit

Reply with JSON only:
{{
  "is_sql_valid": true,
  "issues": ["issue one", "issue two"],
  "suggested_fix": "a corrected query or concrete advice"
}}
When the query is fine, set is_sql_valid to true and leave issues and suggested_fix empty."#;

pub const EVALUATE: &str = r#"Original question: {original_query}
Restated question: {analyzed_query}
SQL query: {generated_sql}

Results:
{results_summary}

Earlier in this session:
{session_history}

1. Judge whether the results answer the original question.
2. If they do not, suggest how the SQL should change.
3. Decide whether a chart would help. Single numbers (a count, a total, a percentage) do not need one; comparisons and trends usually do.
4. Summarize the findings for the user in plain language.

Reply with JSON only:
{{
  "is_result_relevant": true,
  "explanation": "your assessment",
  "improvement_suggestion": "how to change the SQL if the results are not relevant",
  "requires_visualization": false,
  "summary": "a short answer for the user"
}}"#;

pub const CORRECT: &str = r#"Original question: {original_query}
Restated question: {analyzed_query}
Current SQL query: {current_sql}
Evaluation of its results: {evaluation_result}

Database schema:
{table_information}

The current query returned results that do not answer the question. Work out why: a misread intent, a missing JOIN, filter or aggregate, or a logic error. Then write a corrected query.

Reply with JSON only:
{{
  "analysis": "why the current query misses the question",
  "identified_issues": "the specific problems",
  "corrected_sql_query": "the corrected SQL query"
}}"#;

pub const VISUALIZE: &str = r#"Original question: {user_query}
Restated question: {analyzed_query}
SQL query executed: {sql_query}
First rows of the result: {sample_data}
Columns and types: {data_types}

Choose the chart that best answers the question. Prefer a date or time column on the x axis for time series.

Reply with JSON only:
{{
  "visualization_type": "bar|line|scatter|pie|histogram|box|heatmap",
  "x_column": "column for the x axis",
  "y_column": "column for the y axis, if any",
  "title": "chart title",
  "explanation": "why this chart"
}}"#;

pub const SUMMARIZE: &str = r#"Original question: {user_query}
Restated question: {analyzed_query}
SQL query executed: {sql_query}
Query result: {execution_result}
Evaluation: {evaluation_result}

Answer the original question clearly and concisely using the query result.

Answer:"#;
