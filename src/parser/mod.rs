//! Tolerant decoding of structured stage replies.
//!
//! Every stage asks the text generator for a JSON object, and every stage
//! has to cope with what actually comes back. [`parse_reply`] tries, in
//! order:
//!
//! 1. **Strict**: the cleaned reply is a JSON object.
//! 2. **Unwrapped**: code fences stripped, the object isolated from
//!    surrounding prose, and common syntax slips repaired.
//! 3. **Extracted**: field-by-field pattern matching over the raw text.
//!
//! Whatever tier succeeds, the result is normalized against the stage's
//! [`StageSchema`], so missing fields take their defaults. Parsing never
//! fails; the worst case is a map of defaults tagged [`ParseTier::Defaulted`].

pub mod extract;
pub mod fallback;
pub mod repair;
pub mod schema;

pub use schema::{FieldKind, FieldMap, FieldSpec, StageSchema};

use serde_json::{Map, Value};

/// Which decoding tier produced a [`ParsedReply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseTier {
    Strict,
    Unwrapped,
    Extracted,
    /// Nothing recognizable; every field holds its default.
    Defaulted,
}

impl ParseTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseTier::Strict => "strict",
            ParseTier::Unwrapped => "unwrapped",
            ParseTier::Extracted => "extracted",
            ParseTier::Defaulted => "defaulted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedReply {
    pub fields: FieldMap,
    pub tier: ParseTier,
    /// The reply with reasoning blocks stripped, for stages that can salvage
    /// something the schema did not capture.
    pub text: String,
}

/// Decode `raw` against `schema`. Never fails.
pub fn parse_reply(raw: &str, schema: &StageSchema) -> ParsedReply {
    let cleaned = extract::preprocess(raw);

    if let Some(map) = decode_object(&cleaned) {
        return ParsedReply {
            fields: schema.normalize(map),
            tier: ParseTier::Strict,
            text: cleaned,
        };
    }

    if let Some(map) = unwrap_object(&cleaned) {
        return ParsedReply {
            fields: schema.normalize(map),
            tier: ParseTier::Unwrapped,
            text: cleaned,
        };
    }

    let map = fallback::extract_fields(&cleaned);
    let (fields, tier) = if schema.matches_any(&map) {
        (schema.normalize(map), ParseTier::Extracted)
    } else {
        (schema.defaults(), ParseTier::Defaulted)
    };
    ParsedReply {
        fields,
        tier,
        text: cleaned,
    }
}

fn decode_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn decode_or_repair(text: &str) -> Option<Map<String, Value>> {
    decode_object(text).or_else(|| repair::try_repair_json(text).and_then(|fixed| decode_object(&fixed)))
}

fn unwrap_object(text: &str) -> Option<Map<String, Value>> {
    let body = extract::strip_code_fence(text).unwrap_or(text);
    if let Some(map) = decode_or_repair(body) {
        return Some(map);
    }
    extract::find_object(body).and_then(decode_or_repair)
}
