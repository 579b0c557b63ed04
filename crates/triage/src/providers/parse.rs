//! Parsing of the JSON event streams written by agent CLIs.

use super::ProviderReport;
use serde_json::Value;

const SESSION_KEYS: &[&str] = &[
    "session_id",
    "sessionId",
    "sessionID",
    "thread_id",
    "conversation_id",
];
const NESTED_KEYS: &[&str] = &["part", "properties", "msg", "item"];

/// Parse the stdout of an agent CLI into a ProviderReport.
///
/// Output is read as newline-delimited JSON. The session id is taken from
/// the first event which exposes one, and the report is the in-order
/// concatenation of assistant messages. Lines which aren't JSON, and
/// events which aren't assistant messages, are ignored. If no assistant
/// message is found, the trimmed raw output is the report.
pub fn parse_report(stdout: &str) -> ProviderReport {
    let mut session_id = None;
    let mut texts = Vec::new();

    for line in stdout.lines() {
        let Ok(event) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        if session_id.is_none() {
            session_id = find_session_id(&event);
        }
        if let Some(text) = assistant_text(&event) {
            if !text.trim().is_empty() {
                texts.push(text.trim().to_string());
            }
        }
    }

    let report_markdown = if texts.is_empty() {
        stdout.trim().to_string()
    } else {
        texts.join("\n\n")
    };

    ProviderReport {
        report_markdown,
        session_id,
        session_url: None,
        raw_output: Some(stdout.to_string()),
    }
}

fn find_session_id(event: &Value) -> Option<String> {
    let direct = |v: &Value| {
        SESSION_KEYS
            .iter()
            .find_map(|key| v.get(key).and_then(Value::as_str))
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    };

    direct(event)
        .or_else(|| {
            NESTED_KEYS
                .iter()
                .filter_map(|key| event.get(key))
                .find_map(|nested| direct(nested))
        })
        .or_else(|| {
            event
                .pointer("/session/id")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

fn assistant_text(event: &Value) -> Option<String> {
    let kind = event.get("type").and_then(Value::as_str);

    // {"type": "text", "part": {"text": ...}}
    if kind == Some("text") {
        return event.pointer("/part/text").and_then(Value::as_str).map(str::to_string);
    }
    // {"type": "item.completed", "item": {"type": "agent_message", "text": ...}}
    if kind == Some("item.completed") {
        let item = event.get("item")?;
        if item.get("type").and_then(Value::as_str) == Some("agent_message") {
            return item.get("text").and_then(Value::as_str).map(str::to_string);
        }
        return None;
    }
    // {"msg": {"type": "agent_message", "message": ...}}
    if let Some(msg) = event.get("msg") {
        if msg.get("type").and_then(Value::as_str) == Some("agent_message") {
            return msg.get("message").and_then(Value::as_str).map(str::to_string);
        }
        return None;
    }
    // {"role": "assistant", "content": ...}
    if event.get("role").and_then(Value::as_str) == Some("assistant") {
        return content_text(event.get("content")?);
    }
    None
}

/// Content is either a string or an array of string or `{"text": ...}` parts.
fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let parts: Vec<&str> = parts
                .iter()
                .filter_map(|part| match part {
                    Value::String(s) => Some(s.as_str()),
                    part => part.get("text").and_then(Value::as_str),
                })
                .collect();
            (!parts.is_empty()).then(|| parts.join(""))
        }
        _ => None,
    }
}
