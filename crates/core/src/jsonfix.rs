//! Tolerant parsing for LLM-produced JSON.
//!
//! Model output arrives wrapped in markdown fences, sprinkled with `//` and
//! `#` comments, trailing commas, unquoted keys, or cut off mid-structure.
//! `robust_parse` runs a fixed ladder of repairs and stops at the first one
//! that yields valid JSON; callers that still get an error substitute their
//! own conservative default.

use crate::error::{CoreError, Result};
use serde_json::Value;

/// Pull the JSON payload out of a chat response: fenced block if present,
/// otherwise the span from the first `{`/`[` to the last `}`/`]`.
pub fn extract_json(response: &str) -> String {
    let trimmed = response.trim();

    // Fenced block wins: ```json ... ``` or plain ```
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        let after = after.trim_start_matches(['\r', '\n']);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if !inner.is_empty() {
                return inner.to_string();
            }
        }
    }

    let open = trimmed.find(['{', '[']);
    let close = trimmed.rfind(['}', ']']);
    match (open, close) {
        (Some(o), Some(c)) if c >= o => trimmed[o..=c].to_string(),
        _ => trimmed.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Repairs (each is string-aware: nothing inside quotes is touched)
// ---------------------------------------------------------------------------

/// Strip `//`- and `#`-style comments outside string literals.
pub fn remove_comments(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut chars = json.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '#' => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Drop commas that sit directly before a closing brace/bracket.
pub fn fix_trailing_commas(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in json.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '}' | ']' => {
                while out.ends_with(|t: char| t.is_whitespace()) {
                    out.pop();
                }
                if out.ends_with(',') {
                    out.pop();
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Quote bare object keys: `{confidence: 80}` becomes `{"confidence": 80}`.
pub fn quote_unquoted_keys(json: &str) -> String {
    let mut out = String::with_capacity(json.len() + 16);
    let chars: Vec<char> = json.chars().collect();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        if c == '{' || c == ',' {
            out.push(c);
            i += 1;
            // Look ahead: whitespace, identifier, whitespace, ':'
            let mut j = i;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            let ident_start = j;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            let ident_end = j;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if ident_end > ident_start && j < chars.len() && chars[j] == ':' {
                for k in i..ident_start {
                    out.push(chars[k]);
                }
                out.push('"');
                for k in ident_start..ident_end {
                    out.push(chars[k]);
                }
                out.push('"');
                i = ident_end;
            }
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Close an interrupted structure: truncate to the last structural token and
/// append whatever closers are still open.
pub fn balance_truncated(json: &str) -> String {
    // Cut back to the last comma/closer so a half-written value disappears
    let cut = json
        .rfind(['}', ']', ','])
        .map(|i| &json[..=i])
        .unwrap_or(json);
    let mut trimmed = cut.trim_end().to_string();
    if trimmed.ends_with(',') {
        trimmed.pop();
    }

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in trimmed.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }
    if in_string {
        trimmed.push('"');
    }
    while let Some(closer) = stack.pop() {
        trimmed.push(closer);
    }
    trimmed
}

// ---------------------------------------------------------------------------
// The ladder
// ---------------------------------------------------------------------------

/// Parse LLM output into JSON, applying repairs progressively.
pub fn robust_parse(response: &str) -> Result<Value> {
    let extracted = extract_json(response);

    // 1. Direct
    if let Ok(v) = serde_json::from_str::<Value>(&extracted) {
        return Ok(v);
    }
    // 2. Comments stripped
    let no_comments = remove_comments(&extracted);
    if let Ok(v) = serde_json::from_str::<Value>(&no_comments) {
        return Ok(v);
    }
    // 3. Trailing commas removed
    let no_commas = fix_trailing_commas(&no_comments);
    if let Ok(v) = serde_json::from_str::<Value>(&no_commas) {
        return Ok(v);
    }
    // 4. Bare keys quoted
    let quoted = quote_unquoted_keys(&no_commas);
    if let Ok(v) = serde_json::from_str::<Value>(&quoted) {
        return Ok(v);
    }
    // 5. Progressive truncation: peel values off the tail until it parses
    let mut candidate = quoted;
    for _ in 0..16 {
        let balanced = balance_truncated(&candidate);
        if let Ok(v) = serde_json::from_str::<Value>(&balanced) {
            return Ok(v);
        }
        // Peel one more token off the end and retry
        match candidate.rfind(['}', ']', ',']) {
            Some(0) | None => break,
            Some(i) => candidate.truncate(i),
        }
    }

    Err(CoreError::Parse(format!(
        "unparseable llm json (first 120 chars): {}",
        extracted.chars().take(120).collect::<String>()
    )))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_parse() {
        let v = robust_parse(r#"{"confidence": 80}"#).unwrap();
        assert_eq!(v["confidence"], 80);
    }

    #[test]
    fn test_markdown_fence() {
        let v = robust_parse("Here you go:\n```json\n{\"a\": 1}\n```\nDone.").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_comments_and_trailing_commas() {
        let src = r#"{
  "confidence": 70, // self-reported
  "keep_files": ["src/a.py",], # keep this one
}"#;
        let v = robust_parse(src).unwrap();
        assert_eq!(v["confidence"], 70);
        assert_eq!(v["keep_files"][0], "src/a.py");
    }

    #[test]
    fn test_unquoted_keys() {
        let v = robust_parse(r#"{confidence: 55, reasoning: "need more"}"#).unwrap();
        assert_eq!(v["confidence"], 55);
        assert_eq!(v["reasoning"], "need more");
    }

    #[test]
    fn test_truncated_response() {
        let src = r#"{"confidence": 60, "tool_calls": [{"tool": "search_codebase", "parameters": {"search_term": "decode"}}, {"tool": "list_dir"#;
        let v = robust_parse(src).unwrap();
        assert_eq!(v["confidence"], 60);
        assert_eq!(v["tool_calls"][0]["tool"], "search_codebase");
    }

    #[test]
    fn test_comment_markers_inside_strings_survive() {
        let v = robust_parse(r##"{"url": "https://x/#frag", "note": "a // b"}"##).unwrap();
        assert_eq!(v["url"], "https://x/#frag");
        assert_eq!(v["note"], "a // b");
    }

    #[test]
    fn test_hopeless_input_errors() {
        assert!(robust_parse("no json at all").is_err());
    }
}
