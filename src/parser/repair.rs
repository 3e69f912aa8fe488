//! Heuristic fixes for JSON that almost decodes.
//!
//! Small local models tend to answer with Python dict syntax, trailing
//! commas, or a truncated tail. Each pass is a plain character scan that
//! leaves string contents alone.

use serde_json::Value;

/// Try to turn `broken` into valid JSON.
///
/// Returns `None` when the input already decodes or no combination of the
/// passes below makes it decode.
///
/// Passes, in order:
/// 1. `True`/`False`/`None` to `true`/`false`/`null`
/// 2. single-quoted strings to double-quoted
/// 3. trailing commas before `}` or `]` removed
/// 4. missing closing brackets appended
pub fn try_repair_json(broken: &str) -> Option<String> {
    if serde_json::from_str::<Value>(broken).is_ok() {
        return None;
    }

    let mut s = replace_python_literals(broken);
    s = replace_single_quotes(&s);
    s = remove_trailing_commas(&s);
    s = close_missing_brackets(&s);

    serde_json::from_str::<Value>(&s).ok().map(|_| s)
}

fn replace_python_literals(s: &str) -> String {
    const LITERALS: [(&str, &str); 3] = [("True", "true"), ("False", "false"), ("None", "null")];

    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut rest = s;

    while let Some(ch) = rest.chars().next() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
            continue;
        }
        if ch == '"' {
            in_string = true;
            out.push(ch);
            rest = &rest[1..];
            continue;
        }

        let prev_is_word = out
            .chars()
            .last()
            .is_some_and(|c| c.is_alphanumeric() || c == '_');
        let replaced = LITERALS.iter().find(|(py, _)| {
            rest.starts_with(py)
                && !prev_is_word
                && !rest[py.len()..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_alphanumeric() || c == '_')
        });
        match replaced {
            Some((py, json)) => {
                out.push_str(json);
                rest = &rest[py.len()..];
            }
            None => {
                out.push(ch);
                rest = &rest[ch.len_utf8()..];
            }
        }
    }
    out
}

fn replace_single_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_double = false;
    let mut in_single = false;
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            escaped = false;
            // \' is not a valid JSON escape.
            if ch == '\'' {
                out.pop();
            }
            out.push(ch);
            continue;
        }
        match ch {
            '\\' if in_double || in_single => {
                escaped = true;
                out.push(ch);
            }
            '"' if in_single => out.push_str("\\\""),
            '"' => {
                in_double = !in_double;
                out.push(ch);
            }
            '\'' if !in_double => {
                in_single = !in_single;
                out.push('"');
            }
            _ => out.push(ch),
        }
    }
    out
}

fn remove_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }
        if ch == '"' {
            in_string = true;
        }
        if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}

fn close_missing_brackets(s: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = s.trim_end().trim_end_matches(',').to_string();
    if in_string {
        out.push('"');
    }
    while let Some(close) = stack.pop() {
        out.push(close);
    }
    out
}
