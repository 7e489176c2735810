//! Pulling JSON out of free-form model output
//!
//! Models wrap answers in markdown fences, add prose around them, or emit
//! almost-JSON (trailing commas, comments, single quotes, Python literals,
//! bare keys). [`extract_payload`] isolates the candidate text and
//! [`repair`] normalizes the common deviations.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Isolate the JSON payload: the first fenced block, else the bracketed
/// span opened by the first `[` or `{` and closed by its matching bracket.
pub fn extract_payload(text: &str) -> &str {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|pos| pos + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }

    if let Some(start) = trimmed.find(['[', '{']) {
        let span = &trimmed[start..];
        return match matching_close(span) {
            Some(end) => &span[..=end],
            // Unbalanced; let the repair pass have the rest
            None => span,
        };
    }

    trimmed
}

/// Byte offset of the bracket closing the one that opens `span`. Brackets
/// inside string literals (either quote style) do not count.
fn matching_close(span: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (pos, ch) in span.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(pos);
                }
            }
            _ => {}
        }
    }

    None
}

/// Parse the extracted payload exactly as written
pub fn parse_strict<T: DeserializeOwned>(text: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(extract_payload(text))
}

/// Parse the extracted payload into a loose value, repairing it if needed
pub fn parse_lenient(text: &str) -> Option<Value> {
    let payload = extract_payload(text);
    serde_json::from_str(payload)
        .ok()
        .or_else(|| serde_json::from_str(&repair(payload)).ok())
}

/// Rewrite almost-JSON into JSON
pub fn repair(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' => {
                i = copy_string(&chars, i, &mut out);
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some(']') | Some('}')) {
                    out.push(',');
                }
                i += 1;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let followed_by_colon = chars[i..]
                    .iter()
                    .find(|ch| !ch.is_whitespace())
                    .map(|ch| *ch == ':')
                    .unwrap_or(false);

                match word.as_str() {
                    _ if followed_by_colon => {
                        out.push('"');
                        out.push_str(&word);
                        out.push('"');
                    }
                    "True" => out.push_str("true"),
                    "False" => out.push_str("false"),
                    "None" => out.push_str("null"),
                    _ => out.push_str(&word),
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Copy a string literal starting at `start`, normalizing to double quotes.
/// Returns the index just past the closing quote.
fn copy_string(chars: &[char], start: usize, out: &mut String) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    out.push('"');

    while i < chars.len() {
        let ch = chars[i];
        if ch == '\\' && i + 1 < chars.len() {
            let next = chars[i + 1];
            if quote == '\'' && next == '\'' {
                out.push('\'');
            } else {
                out.push('\\');
                out.push(next);
            }
            i += 2;
            continue;
        }
        if ch == quote {
            break;
        }
        match ch {
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
        i += 1;
    }

    out.push('"');
    i + 1
}
