//! Last-resort field extraction for replies that never decode as JSON.
//!
//! Scans the text for `"key": value` pairs of each JSON scalar shape, then
//! for plain `key: value` lines. Later, more specific patterns win over the
//! line scan.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Number, Value};

static STRING_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(\w+)"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());
static BOOL_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(\w+)"\s*:\s*(?i:(true|false))\b"#).unwrap());
static NUMBER_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(\w+)"\s*:\s*(-?\d+(?:\.\d+)?)\s*[,}\n]"#).unwrap());
static LIST_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)"(\w+)"\s*:\s*(\[.*?\])"#).unwrap());
static QUOTED_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)"|'([^']*)'"#).unwrap());
static KEY_VALUE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^[\s\-*]*["']?([A-Za-z_][A-Za-z0-9_ ]*?)["']?\s*:\s*(.+?)\s*,?\s*$"#).unwrap()
});

/// Pull whatever key/value pairs can be recognized out of free text.
pub fn extract_fields(text: &str) -> Map<String, Value> {
    let mut fields = Map::new();

    for cap in KEY_VALUE_LINE.captures_iter(text) {
        let key = cap[1].trim().to_lowercase().replace(' ', "_");
        fields.insert(key, loose_value(&cap[2]));
    }
    for cap in STRING_FIELD.captures_iter(text) {
        fields.insert(cap[1].to_string(), Value::String(unescape(&cap[2])));
    }
    for cap in NUMBER_FIELD.captures_iter(text) {
        if let Some(n) = parse_number(&cap[2]) {
            fields.insert(cap[1].to_string(), n);
        }
    }
    for cap in BOOL_FIELD.captures_iter(text) {
        let flag = cap[2].eq_ignore_ascii_case("true");
        fields.insert(cap[1].to_string(), Value::Bool(flag));
    }
    for cap in LIST_FIELD.captures_iter(text) {
        fields.insert(cap[1].to_string(), list_value(&cap[2]));
    }

    fields
}

/// Decode JSON string escapes, keeping the raw text if they are malformed.
fn unescape(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{raw}\"")).unwrap_or_else(|_| raw.replace("\\n", "\n"))
}

fn parse_number(raw: &str) -> Option<Value> {
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Value::Number(i.into()));
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn list_value(raw: &str) -> Value {
    if let Ok(v @ Value::Array(_)) = serde_json::from_str::<Value>(raw) {
        return v;
    }
    let items = QUOTED_ITEM
        .captures_iter(raw)
        .filter_map(|cap| cap.get(1).or_else(|| cap.get(2)))
        .map(|m| Value::String(unescape(m.as_str())))
        .collect();
    Value::Array(items)
}

fn loose_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return list_value(trimmed);
    }
    if trimmed.eq_ignore_ascii_case("true") || trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(trimmed.eq_ignore_ascii_case("true"));
    }
    if let Some(n) = parse_number(trimmed) {
        return n;
    }
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
        .unwrap_or(trimmed);
    Value::String(unquoted.to_string())
}
