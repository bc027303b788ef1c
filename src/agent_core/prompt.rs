//! System prompt and tool-result rendering.
//!
//! The model sees the tool catalog as plain text and requests tools through
//! the JSON envelope described in the rules below; it never receives
//! provider-native tool definitions.

use crate::mcp_client::client::content_text;
use crate::mcp_client::ToolDescriptor;

use super::envelope::ENVELOPE_KEY;

/// Maximum characters allowed in a tool result before truncation.
///
/// At ~2.8 chars/token, 6000 chars is roughly 2100 tokens, so one verbose
/// result cannot crowd out the rest of the conversation.
pub const MAX_TOOL_RESULT_CHARS: usize = 6_000;

/// Instruction appended to the conversation for the turn after a tool call.
pub const FOLLOW_UP_INSTRUCTION: &str = "Answer the previous question using the tool result above. \
Do not call the same tool again unless the result is clearly insufficient.";

const SYSTEM_PROMPT_INTRO: &str = "You are a helpful desktop assistant. \
Answer concisely and use Markdown when it helps readability.";

/// Build the system prompt advertising `tools`.
///
/// With no tools the envelope instructions are left out entirely so the
/// model is not tempted to invent tool calls.
pub fn build_system_prompt(tools: &[ToolDescriptor]) -> String {
    if tools.is_empty() {
        return SYSTEM_PROMPT_INTRO.to_string();
    }

    let catalog = tools
        .iter()
        .map(|t| match t.description.as_deref().map(str::trim) {
            Some(desc) if !desc.is_empty() => format!("- {} — {desc}", t.qualified_name()),
            _ => format!("- {}", t.qualified_name()),
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{SYSTEM_PROMPT_INTRO}\n\n\
         You can use these tools:\n{catalog}\n\n\
         To call a tool, reply with ONLY a JSON object of this shape and nothing else:\n\
         {{\"{ENVELOPE_KEY}\": \"<server>:<tool>\", \"arguments\": {{ ... }}}}\n\n\
         Rules:\n\
         - Call at most one tool per reply.\n\
         - Use the exact `server:tool` names listed above.\n\
         - Put every parameter inside \"arguments\".\n\
         - After the tool result arrives, answer the user in plain text."
    )
}

/// Render a raw `tools/call` result as text for the conversation.
///
/// Text content items are joined; anything else is shown as pretty JSON.
pub fn render_tool_result(tool: &str, result: &serde_json::Value) -> String {
    let text = content_text(result).unwrap_or_else(|| {
        serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
    });
    truncate_tool_result(&text, tool)
}

/// Keep the first `MAX_TOOL_RESULT_CHARS` characters and append a notice.
fn truncate_tool_result(result: &str, tool: &str) -> String {
    let total = result.chars().count();
    if total <= MAX_TOOL_RESULT_CHARS {
        return result.to_string();
    }

    let truncated: String = result.chars().take(MAX_TOOL_RESULT_CHARS).collect();
    tracing::warn!(
        tool = %tool,
        original_len = total,
        truncated_to = MAX_TOOL_RESULT_CHARS,
        "tool result truncated"
    );
    format!("{truncated}\n\n[... truncated: showing first {MAX_TOOL_RESULT_CHARS} of {total} chars]")
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, description: Option<&str>) -> ToolDescriptor {
        ToolDescriptor {
            server_id: "fs".into(),
            name: name.into(),
            description: description.map(Into::into),
            input_schema: None,
        }
    }

    #[test]
    fn test_prompt_lists_tools_and_envelope_rules() {
        let prompt = build_system_prompt(&[
            tool("list_directory", Some("List a directory")),
            tool("read_file", None),
        ]);
        assert!(prompt.contains("- fs:list_directory — List a directory"));
        assert!(prompt.contains("- fs:read_file\n"));
        assert!(prompt.contains(r#"{"mcp_tool": "<server>:<tool>", "arguments": { ... }}"#));
    }

    #[test]
    fn test_prompt_without_tools_has_no_envelope_rules() {
        let prompt = build_system_prompt(&[]);
        assert!(!prompt.contains(ENVELOPE_KEY));
        assert_eq!(prompt, SYSTEM_PROMPT_INTRO);
    }

    #[test]
    fn test_render_joins_text_content() {
        let result = serde_json::json!({
            "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]
        });
        assert_eq!(render_tool_result("t", &result), "a\nb");
    }

    #[test]
    fn test_render_falls_back_to_json() {
        let result = serde_json::json!({"structured": {"n": 1}});
        let rendered = render_tool_result("t", &result);
        assert!(rendered.contains("\"structured\""));
        assert!(rendered.contains('\n'));
    }

    #[test]
    fn test_render_truncates_long_results_on_char_boundary() {
        let long = "é".repeat(MAX_TOOL_RESULT_CHARS + 10);
        let result = serde_json::json!({"content": [{"type": "text", "text": long}]});
        let rendered = render_tool_result("read_file", &result);
        assert!(rendered.starts_with(&"é".repeat(MAX_TOOL_RESULT_CHARS)));
        assert!(rendered.ends_with(&format!(
            "[... truncated: showing first {MAX_TOOL_RESULT_CHARS} of {} chars]",
            MAX_TOOL_RESULT_CHARS + 10
        )));
    }
}
