//! Tool-call envelope detection in model text.
//!
//! The model requests a tool by embedding
//! `{"mcp_tool": "<serverId>:<toolName>", "arguments": {...}}` in its answer,
//! optionally inside a fenced code block. Parsing is tolerant:
//!
//! - `arguments` may be a JSON-encoded string (parsed a second time)
//! - when `arguments` is missing, sibling keys are folded in as arguments
//! - trailing commas are repaired
//!
//! The parser is pure and cheap on non-matches so it can run on every
//! streaming buffer update.

use serde_json::{Map, Value};

pub const ENVELOPE_KEY: &str = "mcp_tool";
const ARGUMENTS_KEY: &str = "arguments";

/// A parsed tool request. Ephemeral: never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallIntent {
    pub server_id: String,
    pub name: String,
    /// Always a JSON object.
    pub arguments: Value,
    /// The exact envelope text as it appeared in the message.
    pub raw_envelope: String,
}

impl ToolCallIntent {
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.server_id, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeParse {
    Parsed(ToolCallIntent),
    /// No envelope key anywhere in the text.
    NotAnEnvelope,
    /// The key is present but no complete, valid envelope could be read
    /// (bad JSON, bad `mcp_tool` value, or the object is still streaming in).
    Malformed,
}

/// Scan `text` for the first complete tool-call envelope.
pub fn parse_envelope(text: &str) -> EnvelopeParse {
    let needle = format!("\"{ENVELOPE_KEY}\"");
    if !text.contains(&needle) {
        return EnvelopeParse::NotAnEnvelope;
    }

    for (key_pos, _) in text.match_indices(&needle) {
        let Some((start, end)) = enclosing_object(text, key_pos) else {
            continue;
        };
        let raw = &text[start..=end];
        if let Some(intent) = parse_object(raw) {
            return EnvelopeParse::Parsed(intent);
        }
    }

    EnvelopeParse::Malformed
}

/// Find the innermost complete `{...}` that contains the byte at `key_pos`.
///
/// Walks opening braces backwards from the key; the first one whose match
/// closes after the key is the innermost enclosing object.
fn enclosing_object(text: &str, key_pos: usize) -> Option<(usize, usize)> {
    text[..key_pos]
        .char_indices()
        .rev()
        .filter(|(_, c)| *c == '{')
        .find_map(|(open, _)| {
            find_matching_brace(text, open)
                .filter(|close| *close > key_pos)
                .map(|close| (open, close))
        })
}

/// Index of the `}` closing the `{` at `start`, skipping braces inside
/// JSON strings. `None` if the object is not closed yet.
fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_object(raw: &str) -> Option<ToolCallIntent> {
    let mut obj = parse_json_object(raw)?;

    let target = obj.get(ENVELOPE_KEY)?.as_str()?;
    let (server_id, name) = target.split_once(':')?;
    let (server_id, name) = (server_id.trim().to_string(), name.trim().to_string());
    if server_id.is_empty() || name.is_empty() {
        return None;
    }

    let arguments = match obj.remove(ARGUMENTS_KEY) {
        Some(Value::Object(map)) => Value::Object(map),
        Some(Value::String(s)) if s.trim().is_empty() => Value::Object(Map::new()),
        Some(Value::String(s)) => Value::Object(parse_json_object(&s)?),
        Some(Value::Null) | None => {
            obj.remove(ENVELOPE_KEY);
            Value::Object(obj)
        }
        Some(_) => return None,
    };

    Some(ToolCallIntent {
        server_id,
        name,
        arguments,
        raw_envelope: raw.to_string(),
    })
}

/// Parse a JSON object, retrying once with trailing commas removed.
fn parse_json_object(raw: &str) -> Option<Map<String, Value>> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
        return Some(map);
    }
    match serde_json::from_str::<Value>(&repair_trailing_commas(raw)) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Remove trailing commas before `}` or `]` outside of strings.
fn repair_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut result = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            result.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        result.push(c);
    }
    result
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(text: &str) -> ToolCallIntent {
        match parse_envelope(text) {
            EnvelopeParse::Parsed(intent) => intent,
            other => panic!("expected Parsed for {text:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_deeply_nested_arguments_before_key() {
        let mut nested = String::from(r#""leaf""#);
        for depth in 0..10 {
            nested = format!(r#"{{"level{depth}":{nested}}}"#);
        }
        let text = format!(r#"Sure: {{"arguments":{{"filter":{nested}}},"mcp_tool":"db:query"}}"#);

        let intent = parsed(&text);
        assert_eq!(intent.qualified_name(), "db:query");
        assert_eq!(
            intent.arguments["filter"]["level9"]["level8"]["level7"]["level6"]["level5"]["level4"]
                ["level3"]["level2"]["level1"]["level0"],
            "leaf"
        );
    }

    #[test]
    fn test_plain_envelope() {
        let intent = parsed(r#"{"mcp_tool":"fs:list_directory","arguments":{"path":"."}}"#);
        assert_eq!(intent.server_id, "fs");
        assert_eq!(intent.name, "list_directory");
        assert_eq!(intent.arguments, serde_json::json!({"path": "."}));
        assert_eq!(intent.qualified_name(), "fs:list_directory");
    }

    #[test]
    fn test_fenced_envelope_with_surrounding_prose() {
        let text = "Let me check the folder.\n\n```json\n{\n  \"mcp_tool\": \"fs:list_directory\",\n  \"arguments\": {\"path\": \"/tmp/ws\"}\n}\n```\n";
        let intent = parsed(text);
        assert_eq!(intent.arguments["path"], "/tmp/ws");
        assert!(intent.raw_envelope.starts_with('{'));
        assert!(intent.raw_envelope.ends_with('}'));
        assert!(!intent.raw_envelope.contains("```"));
    }

    #[test]
    fn test_string_encoded_arguments() {
        let text = r#"{"mcp_tool":"fs:read_file","arguments":"{\"path\":\"notes.txt\"}"}"#;
        assert_eq!(parsed(text).arguments, serde_json::json!({"path": "notes.txt"}));
    }

    #[test]
    fn test_empty_string_arguments_become_empty_object() {
        let text = r#"{"mcp_tool":"fs:list_allowed_directories","arguments":""}"#;
        assert_eq!(parsed(text).arguments, serde_json::json!({}));
    }

    #[test]
    fn test_flattened_arguments_are_folded() {
        let text = r#"{"mcp_tool":"fs:list_directory","path":"docs","depth":2}"#;
        assert_eq!(
            parsed(text).arguments,
            serde_json::json!({"path": "docs", "depth": 2})
        );
    }

    #[test]
    fn test_arguments_before_key() {
        let text = r#"{"arguments": {"path": "."}, "mcp_tool": "fs:list_directory"}"#;
        let intent = parsed(text);
        assert_eq!(intent.name, "list_directory");
        assert_eq!(intent.arguments["path"], ".");
    }

    #[test]
    fn test_braces_inside_strings() {
        let text = r#"{"mcp_tool":"fs:write_file","arguments":{"path":"a.txt","content":"fn main() { } \" }"}}"#;
        let intent = parsed(text);
        assert_eq!(intent.arguments["content"], "fn main() { } \" }");
    }

    #[test]
    fn test_trailing_comma_is_repaired() {
        let text = r#"{"mcp_tool":"fs:list_directory","arguments":{"path":".",},}"#;
        assert_eq!(parsed(text).arguments["path"], ".");
    }

    #[test]
    fn test_plain_text_is_not_an_envelope() {
        assert_eq!(parse_envelope("Hello world"), EnvelopeParse::NotAnEnvelope);
        assert_eq!(
            parse_envelope(r#"{"tool":"fs:list_directory"}"#),
            EnvelopeParse::NotAnEnvelope
        );
    }

    #[test]
    fn test_partial_streaming_text_is_malformed() {
        let text = r#"Sure: {"mcp_tool":"fs:list_directory","argu"#;
        assert_eq!(parse_envelope(text), EnvelopeParse::Malformed);
    }

    #[test]
    fn test_bad_target_is_malformed() {
        for text in [
            r#"{"mcp_tool":"list_directory","arguments":{}}"#,
            r#"{"mcp_tool":":list_directory","arguments":{}}"#,
            r#"{"mcp_tool":"fs:","arguments":{}}"#,
            r#"{"mcp_tool":42,"arguments":{}}"#,
            r#"{"mcp_tool":"fs:x","arguments":[1,2]}"#,
            r#"{"mcp_tool":"fs:x","arguments":"not json"}"#,
        ] {
            assert_eq!(parse_envelope(text), EnvelopeParse::Malformed, "{text}");
        }
    }

    #[test]
    fn test_first_complete_envelope_wins() {
        let text = concat!(
            r#"{"mcp_tool":"bad"} then "#,
            r#"{"mcp_tool":"fs:list_directory","arguments":{"path":"."}} and "#,
            r#"{"mcp_tool":"fs:read_file","arguments":{"path":"x"}}"#
        );
        assert_eq!(parsed(text).name, "list_directory");
    }

    #[test]
    fn test_repeated_envelope_parses_identically() {
        let env = r#"{"mcp_tool":"fs:list_directory","arguments":{"path":"."}}"#;
        let once = parsed(env);
        let twice = parsed(&format!("{env}\n{env}"));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_find_matching_brace_unbalanced() {
        assert_eq!(find_matching_brace("{\"a\": {}", 0), None);
        assert_eq!(find_matching_brace("{\"a\": \"}\"}", 0), Some(9));
    }
}
