//! Pure transformation from agent stream-json records to bus events.
//!
//! Agents append one JSON object per line to `raw_output.jsonl`. Lines come
//! in two families: the nested assistant/user/system message format the
//! agent CLI emits, and flat envelopes that already use the bus taxonomy.
//! Anything unrecognized is logged and dropped; parsing never panics.

use serde_json::Value;
use tracing::{debug, warn};

use crate::events::{AgentLog, EventPayload, truncate_diff};

/// Tool results longer than this are cut for UI display.
const MAX_TOOL_OUTPUT_CHARS: usize = 2000;
/// How much hook stderr is carried into the log message.
const MAX_STDERR_CHARS: usize = 200;

/// Parse one decoded JSONL record into zero or more events for `adw_id`.
pub fn parse_agent_line(adw_id: &str, record: &Value) -> Vec<EventPayload> {
    let Some(obj) = record.as_object() else {
        warn!(adw_id, "skipping non-object agent record");
        return Vec::new();
    };

    match obj.get("type").and_then(Value::as_str) {
        Some("assistant") => parse_assistant(adw_id, record),
        Some("user") => parse_user(adw_id, record),
        Some("system") => parse_system(adw_id, record),
        Some("thinking_block") => vec![EventPayload::ThinkingBlock {
            adw_id: adw_id.to_string(),
            content: str_field(record, "content"),
            reasoning_type: opt_str_field(record, "reasoning_type"),
            duration_ms: record.get("duration_ms").and_then(Value::as_i64),
            sequence: record.get("sequence").and_then(Value::as_i64),
        }],
        Some("text_block") => vec![EventPayload::TextBlock {
            adw_id: adw_id.to_string(),
            content: str_field(record, "content"),
            sequence: record.get("sequence").and_then(Value::as_i64),
        }],
        Some("tool_use_pre") => vec![EventPayload::ToolUsePre {
            adw_id: adw_id.to_string(),
            tool_name: str_field(record, "tool_name"),
            tool_input: record.get("tool_input").cloned().unwrap_or(Value::Null),
            tool_use_id: opt_str_field(record, "tool_use_id"),
        }],
        Some("tool_use_post") => vec![EventPayload::ToolUsePost {
            adw_id: adw_id.to_string(),
            tool_name: str_field(record, "tool_name"),
            tool_use_id: opt_str_field(record, "tool_use_id"),
            tool_output: opt_str_field(record, "tool_output"),
            status: opt_str_field(record, "status").unwrap_or_else(|| "success".to_string()),
            error: opt_str_field(record, "error"),
            duration_ms: record.get("duration_ms").and_then(Value::as_i64),
        }],
        Some("file_changed") => vec![EventPayload::FileChanged {
            adw_id: adw_id.to_string(),
            file_path: str_field(record, "file_path"),
            operation: opt_str_field(record, "operation").unwrap_or_else(|| "modify".to_string()),
            diff: opt_str_field(record, "diff").map(|d| truncate_diff(&d)),
            summary: opt_str_field(record, "summary"),
            lines_added: record.get("lines_added").and_then(Value::as_i64).unwrap_or(0),
            lines_removed: record
                .get("lines_removed")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        }],
        other => {
            debug!(adw_id, event_type = ?other, "unknown agent record type");
            Vec::new()
        }
    }
}

/// `{"type": "assistant", "message": {"content": [...], "model": ...}}`
fn parse_assistant(adw_id: &str, record: &Value) -> Vec<EventPayload> {
    let mut events = Vec::new();
    let blocks = record
        .pointer("/message/content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for block in blocks {
        let Some(block_type) = block.get("type").and_then(Value::as_str) else {
            continue;
        };
        match block_type {
            "text" => {
                let text = str_field(&block, "text");
                if !text.is_empty() {
                    events.push(EventPayload::TextBlock {
                        adw_id: adw_id.to_string(),
                        content: text,
                        sequence: None,
                    });
                }
            }
            "tool_use" => {
                events.push(EventPayload::ToolUsePre {
                    adw_id: adw_id.to_string(),
                    tool_name: str_field(&block, "name"),
                    tool_input: block.get("input").cloned().unwrap_or(Value::Null),
                    tool_use_id: opt_str_field(&block, "id"),
                });
            }
            "thinking" => {
                let thinking = str_field(&block, "thinking");
                if !thinking.is_empty() {
                    events.push(EventPayload::ThinkingBlock {
                        adw_id: adw_id.to_string(),
                        content: thinking,
                        reasoning_type: Some("thinking".to_string()),
                        duration_ms: None,
                        sequence: None,
                    });
                }
            }
            _ => {}
        }
    }
    events
}

/// `{"type": "user", "message": {"content": [{"type": "tool_result", ...}]},
///  "tool_use_result": {...}}`
fn parse_user(adw_id: &str, record: &Value) -> Vec<EventPayload> {
    let mut events = Vec::new();
    let blocks = record
        .pointer("/message/content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let tool_name = record
        .pointer("/tool_use_result/type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    for block in blocks {
        if block.get("type").and_then(Value::as_str) != Some("tool_result") {
            continue;
        }
        let content = match block.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(list @ Value::Array(_)) => list.to_string(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        events.push(EventPayload::ToolUsePost {
            adw_id: adw_id.to_string(),
            tool_name: tool_name.clone(),
            tool_use_id: opt_str_field(&block, "tool_use_id"),
            tool_output: Some(truncate_chars(&content, MAX_TOOL_OUTPUT_CHARS)),
            status: "success".to_string(),
            error: None,
            duration_ms: None,
        });
    }
    events
}

/// `{"type": "system", "subtype": "init" | "hook_response" | "error", ...}`
fn parse_system(adw_id: &str, record: &Value) -> Vec<EventPayload> {
    let session_id = opt_str_field(record, "session_id");
    let log = |message: String, level: &str| {
        EventPayload::AgentLog(AgentLog {
            adw_id: adw_id.to_string(),
            agent_role: None,
            message,
            level: level.to_string(),
            source: Some("raw_output.jsonl".to_string()),
            session_id: session_id.clone(),
        })
    };

    match record.get("subtype").and_then(Value::as_str) {
        Some("init") => {
            let model = record
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let tool_count = record
                .get("tools")
                .and_then(Value::as_array)
                .map(|t| t.len())
                .unwrap_or(0);
            vec![log(
                format!(
                    "Agent session initialized (model: {}, tools: {})",
                    model, tool_count
                ),
                "INFO",
            )]
        }
        Some("hook_response") => {
            let hook_name = record
                .get("hook_name")
                .and_then(Value::as_str)
                .unwrap_or("");
            let exit_code = record.get("exit_code").and_then(Value::as_i64).unwrap_or(0);
            let stderr = record.get("stderr").and_then(Value::as_str).unwrap_or("");

            let level = if exit_code != 0 || !stderr.is_empty() {
                "ERROR"
            } else {
                "INFO"
            };
            let mut message = format!("Hook '{}' executed", hook_name);
            if !stderr.is_empty() {
                message.push_str(": ");
                message.push_str(&stderr.chars().take(MAX_STDERR_CHARS).collect::<String>());
            }
            vec![log(message, level)]
        }
        Some("error") => {
            let error_msg = record
                .get("message")
                .or_else(|| record.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            vec![log(format!("Agent error: {}", error_msg), "ERROR")]
        }
        other => {
            debug!(adw_id, subtype = ?other, "unhandled system subtype");
            Vec::new()
        }
    }
}

fn str_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn opt_str_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("... [truncated]");
    out
}
