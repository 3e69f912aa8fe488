//! Text cleanup applied before any decoding attempt.

/// Strip reasoning blocks and surrounding whitespace.
pub fn preprocess(text: &str) -> String {
    strip_think_tags(text).trim().to_string()
}

/// Remove `<think>...</think>` and `<thinking>...</thinking>` blocks.
///
/// An unclosed block swallows the rest of the text.
///
/// ```
/// use sql_agent::parser::extract::strip_think_tags;
///
/// assert_eq!(strip_think_tags("<think>hmm</think>{}"), "{}");
/// ```
pub fn strip_think_tags(text: &str) -> String {
    let once = strip_tag(text, "<think>", "</think>");
    strip_tag(&once, "<thinking>", "</thinking>")
}

fn strip_tag(text: &str, open: &str, close: &str) -> String {
    let mut out = text.to_string();
    while let Some(start) = out.find(open) {
        match out[start..].find(close) {
            Some(rel) => {
                let end = start + rel + close.len();
                out.replace_range(start..end, "");
            }
            None => {
                out.truncate(start);
                break;
            }
        }
    }
    out
}

/// Return the body of the first fenced code block, if any.
///
/// Accepts both `` ```json `` and bare fences. A block whose closing fence
/// is missing yields everything after the opening line.
///
/// ```
/// use sql_agent::parser::extract::strip_code_fence;
///
/// assert_eq!(strip_code_fence("```json\n{\"a\": 1}\n```"), Some("{\"a\": 1}"));
/// assert_eq!(strip_code_fence("{\"a\": 1}"), None);
/// ```
pub fn strip_code_fence(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after = &text[open + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
    let body = &after[body_start..];
    let body = match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    };
    Some(body.trim())
}

/// Return the body of the first code block fenced as `lang`, ignoring case.
///
/// Unlike [`strip_code_fence`], bare or differently tagged blocks are
/// skipped and the block must be closed.
///
/// ```
/// use sql_agent::parser::extract::extract_code_block_for;
///
/// let reply = "```text\nnote\n```\n```SQL\nSELECT 1\n```";
/// assert_eq!(extract_code_block_for(reply, "sql"), Some("SELECT 1"));
/// assert_eq!(extract_code_block_for("```\nSELECT 1\n```", "sql"), None);
/// ```
pub fn extract_code_block_for<'a>(text: &'a str, lang: &str) -> Option<&'a str> {
    let mut from = 0;
    while let Some(offset) = text[from..].find("```") {
        let info_start = from + offset + 3;
        let line_end = text[info_start..].find('\n')?;
        let body_start = info_start + line_end + 1;
        let close = text[body_start..].find("```")?;

        if text[info_start..info_start + line_end].trim().eq_ignore_ascii_case(lang) {
            return Some(text[body_start..body_start + close].trim());
        }
        from = body_start + close + 3;
    }
    None
}

/// Find the last balanced `{ ... }` region, skipping braces inside strings.
///
/// Single-quoted strings count as strings too, since the repairer accepts
/// them.
pub fn find_object(text: &str) -> Option<&str> {
    let mut best = None;
    let mut from = 0;

    while let Some(offset) = text[from..].find('{') {
        let start = from + offset;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut escaped = false;
        let mut end = None;

        for (i, ch) in text[start..].char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match (ch, quote) {
                ('\\', Some(_)) => escaped = true,
                ('"' | '\'', None) => quote = Some(ch),
                (c, Some(q)) if c == q => quote = None,
                (_, Some(_)) => {}
                ('{', None) => depth += 1,
                ('}', None) => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(start + i);
                        break;
                    }
                }
                _ => {}
            }
        }

        match end {
            Some(end) => {
                best = Some(&text[start..=end]);
                from = end + 1;
            }
            None => {
                // Unbalanced tail: hand it to the repairer as-is.
                if best.is_none() {
                    best = Some(&text[start..]);
                }
                break;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_think_tags() {
        assert_eq!(strip_think_tags("<think>a</think>b<thinking>c</thinking>d"), "bd");
        assert_eq!(strip_think_tags("x<think>never closed"), "x");
    }

    #[test]
    fn test_preprocess_trims() {
        assert_eq!(preprocess("  <think>x</think>\n {} \n"), "{}");
    }

    #[test]
    fn test_strip_code_fence_bare() {
        let input = "Here you go:\n```\n{\"is_sql_valid\": true}\n```\nThanks";
        assert_eq!(strip_code_fence(input), Some("{\"is_sql_valid\": true}"));
    }

    #[test]
    fn test_strip_code_fence_unclosed() {
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}"), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_find_object_prefers_last() {
        let input = r#"example {"a": 1} answer {"b": {"c": "}"}}"#;
        assert_eq!(find_object(input), Some(r#"{"b": {"c": "}"}}"#));
    }

    #[test]
    fn test_find_object_single_quoted_braces() {
        let input = "reply: {'sql_query': 'SELECT 1', 'explanation': 'uses {braces'} thanks";
        assert_eq!(
            find_object(input),
            Some("{'sql_query': 'SELECT 1', 'explanation': 'uses {braces'}")
        );
        assert_eq!(find_object(r#"{"note": "it's {fine}"}"#), Some(r#"{"note": "it's {fine}"}"#));
    }

    #[test]
    fn test_extract_code_block_for_skips_other_languages() {
        let input = "```json\n{}\n```\nThen:\n```sql\nSELECT COUNT(*)\nFROM orders\n```";
        assert_eq!(extract_code_block_for(input, "sql"), Some("SELECT COUNT(*)\nFROM orders"));
        assert_eq!(extract_code_block_for("```sql\nSELECT 1", "sql"), None);
    }

    #[test]
    fn test_find_object_unbalanced() {
        assert_eq!(find_object(r#"reply: {"a": 1"#), Some(r#"{"a": 1"#));
        assert_eq!(find_object("nothing here"), None);
    }
}
