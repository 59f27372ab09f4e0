//! Framing and interpretation of the agent CLI's stream-json output.
//!
//! Output arrives in arbitrary chunks. [`JsonLineDecoder`] reassembles lines,
//! accumulates JSON objects that span several lines and hands everything
//! else back as plain text. [`StreamInterpreter`] maps decoded objects onto
//! [`QueryMessage`]s.

use serde_json::Value;

use super::PermissionRequest;
use super::QueryMessage;
use super::QueryResult;
use super::TokenUsage;

/// Accumulated JSON larger than this is dropped.
pub const MAX_JSON_ACCUMULATOR_BYTES: usize = 100_000;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Json(Value),
    Text { text: String, partial: bool },
}

#[derive(Debug, Default)]
pub struct JsonLineDecoder {
    line: String,
    /// Bytes of `line` already handed out as partial text.
    emitted: usize,
    accumulator: String,
    emit_partial: bool,
}

impl JsonLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also hand out the unterminated tail of plain-text lines, so prompts
    /// that wait on the same line become visible.
    pub fn with_partial_text() -> Self {
        Self {
            emit_partial: true,
            ..Self::default()
        }
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = chunk;
        while let Some(newline) = rest.find('\n') {
            self.line.push_str(&rest[..newline]);
            rest = &rest[newline + 1..];
            let line = std::mem::take(&mut self.line);
            let emitted = std::mem::take(&mut self.emitted);
            self.complete_line(&line, emitted, &mut frames);
        }
        self.line.push_str(rest);

        if self.emit_partial && self.accumulator.is_empty() {
            let pending = &self.line[self.emitted..];
            let starts_json = self.line.trim_start().starts_with('{');
            if !starts_json && !pending.trim().is_empty() {
                frames.push(Frame::Text {
                    text: pending.to_string(),
                    partial: true,
                });
                self.emitted = self.line.len();
            }
        }
        frames
    }

    /// Flush whatever is buffered at end of stream.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            let emitted = std::mem::take(&mut self.emitted);
            self.complete_line(&line, emitted, &mut frames);
        }
        if !self.accumulator.is_empty() {
            tracing::warn!(
                bytes = self.accumulator.len(),
                "dropping incomplete json at end of stream"
            );
            self.accumulator.clear();
        }
        frames
    }

    fn complete_line(&mut self, line: &str, emitted: usize, frames: &mut Vec<Frame>) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let trimmed = line.trim();
        if self.accumulator.is_empty() {
            if !trimmed.starts_with('{') {
                let remainder = line.get(emitted..).unwrap_or_default();
                if !remainder.trim().is_empty() || (emitted > 0 && !remainder.is_empty()) {
                    frames.push(Frame::Text {
                        text: remainder.to_string(),
                        partial: false,
                    });
                }
                return;
            }
        } else if trimmed.is_empty() {
            return;
        }
        self.accumulator.push_str(trimmed);
        match serde_json::from_str::<Value>(&self.accumulator) {
            Ok(value) => {
                self.accumulator.clear();
                frames.push(Frame::Json(value));
            }
            Err(err) if err.is_eof() => {
                if self.accumulator.len() > MAX_JSON_ACCUMULATOR_BYTES {
                    tracing::warn!(
                        bytes = self.accumulator.len(),
                        "json accumulator overflow; dropping buffered fragment"
                    );
                    self.accumulator.clear();
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed json line");
                self.accumulator.clear();
            }
        }
    }
}

/// Stateful mapping of stream-json objects to query messages.
#[derive(Debug, Default)]
pub struct StreamInterpreter {
    /// Message id announced by the last `message_start` stream event.
    current_message_id: Option<String>,
    /// Tool names by tool-use id, for labelling tool results.
    tool_names: std::collections::HashMap<String, String>,
}

impl StreamInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool_name(&self, tool_use_id: &str) -> Option<&str> {
        self.tool_names.get(tool_use_id).map(String::as_str)
    }

    pub fn interpret(&mut self, value: &Value) -> Vec<QueryMessage> {
        match value.get("type").and_then(Value::as_str) {
            Some("system") => interpret_system(value).into_iter().collect(),
            Some("assistant") => self.interpret_assistant(value),
            Some("user") => interpret_tool_results(value),
            Some("stream_event") => self.interpret_stream_event(value).into_iter().collect(),
            Some("result") => vec![QueryMessage::Result(interpret_result(value))],
            Some("control_request") => interpret_control_request(value).into_iter().collect(),
            Some(other) => {
                tracing::trace!(event_type = other, "ignoring stream-json event");
                Vec::new()
            }
            None => {
                tracing::debug!("stream-json object without a type");
                Vec::new()
            }
        }
    }

    fn interpret_assistant(&mut self, value: &Value) -> Vec<QueryMessage> {
        let Some(message) = value.get("message") else {
            return Vec::new();
        };
        let message_id = message
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut out = Vec::new();
        for block in message
            .get("content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        out.push(QueryMessage::Text {
                            message_id: message_id.clone(),
                            text: text.to_string(),
                            partial: false,
                        });
                    }
                }
                Some("tool_use") => {
                    let tool_use_id = string_field(block, "id").unwrap_or_default();
                    let name = string_field(block, "name").unwrap_or_default();
                    self.tool_names.insert(tool_use_id.clone(), name.clone());
                    out.push(QueryMessage::ToolUse {
                        message_id: message_id.clone(),
                        tool_use_id,
                        name,
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }
        if let (Some(message_id), Some(usage)) = (message_id, message.get("usage")) {
            out.push(QueryMessage::Usage {
                message_id,
                usage: parse_usage(usage),
            });
        }
        out
    }

    fn interpret_stream_event(&mut self, value: &Value) -> Option<QueryMessage> {
        let event = value.get("event")?;
        match event.get("type").and_then(Value::as_str)? {
            "message_start" => {
                self.current_message_id = event
                    .get("message")
                    .and_then(|m| m.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                None
            }
            "content_block_delta" => {
                let delta = event.get("delta")?;
                if delta.get("type").and_then(Value::as_str)? != "text_delta" {
                    return None;
                }
                Some(QueryMessage::Text {
                    message_id: self.current_message_id.clone(),
                    text: string_field(delta, "text")?,
                    partial: true,
                })
            }
            _ => None,
        }
    }
}

fn interpret_system(value: &Value) -> Option<QueryMessage> {
    if value.get("subtype").and_then(Value::as_str) != Some("init") {
        return None;
    }
    Some(QueryMessage::Init {
        conversation_id: string_field(value, "session_id")?,
        model: string_field(value, "model"),
    })
}

fn interpret_tool_results(value: &Value) -> Vec<QueryMessage> {
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
        .map(|block| QueryMessage::ToolResult {
            tool_use_id: string_field(block, "tool_use_id").unwrap_or_default(),
            output: content_text(block.get("content")),
            is_error: block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
        .collect()
}

fn interpret_result(value: &Value) -> QueryResult {
    let subtype = string_field(value, "subtype").unwrap_or_else(|| "success".to_string());
    let is_error = value
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(subtype != "success");
    QueryResult {
        id: string_field(value, "uuid"),
        subtype,
        is_error,
        text: string_field(value, "result"),
        cost_usd: value
            .get("total_cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        num_turns: value
            .get("num_turns")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        usage: value.get("usage").map(parse_usage),
    }
}

fn interpret_control_request(value: &Value) -> Option<QueryMessage> {
    let request = value.get("request")?;
    if request.get("subtype").and_then(Value::as_str)? != "can_use_tool" {
        return None;
    }
    Some(QueryMessage::PermissionRequest(PermissionRequest {
        request_id: string_field(value, "request_id")?,
        tool_name: string_field(request, "tool_name")?,
        input: request.get("input").cloned().unwrap_or(Value::Null),
        tool_use_id: string_field(request, "tool_use_id"),
    }))
}

/// Input tokens include cache reads and cache writes.
pub fn parse_usage(usage: &Value) -> TokenUsage {
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input_tokens: field("input_tokens")
            + field("cache_read_input_tokens")
            + field("cache_creation_input_tokens"),
        output_tokens: field("output_tokens"),
    }
}

fn string_field(value: &Value, name: &str) -> Option<String> {
    value.get(name).and_then(Value::as_str).map(str::to_string)
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn text(text: &str, partial: bool) -> Frame {
        Frame::Text {
            text: text.to_string(),
            partial,
        }
    }

    #[test]
    fn json_split_across_chunks_is_reassembled() {
        let mut decoder = JsonLineDecoder::new();
        assert!(decoder.push("{\"type\":\"sys").is_empty());
        assert_eq!(
            decoder.push("tem\"}\nplain line\n"),
            vec![Frame::Json(json!({"type": "system"})), text("plain line", false)]
        );
    }

    #[test]
    fn multi_line_json_is_accumulated() {
        let mut decoder = JsonLineDecoder::new();
        let frames = decoder.push("{\n  \"type\": \"result\",\n  \"total_cost_usd\": 0.5\n}\n");
        assert_eq!(
            frames,
            vec![Frame::Json(json!({"type": "result", "total_cost_usd": 0.5}))]
        );
    }

    #[test]
    fn malformed_json_is_skipped() {
        let mut decoder = JsonLineDecoder::new();
        let frames = decoder.push("{not json}\n{\"type\":\"ok\"}\n");
        assert_eq!(frames, vec![Frame::Json(json!({"type": "ok"}))]);
    }

    #[test]
    fn oversized_accumulator_is_dropped() {
        let mut decoder = JsonLineDecoder::new();
        let huge = format!("{{\"a\":\"{}\n", "x".repeat(MAX_JSON_ACCUMULATOR_BYTES));
        assert!(decoder.push(&huge).is_empty());
        assert_eq!(
            decoder.push("{\"type\":\"next\"}\n"),
            vec![Frame::Json(json!({"type": "next"}))]
        );
    }

    #[test]
    fn partial_text_is_emitted_once() {
        let mut decoder = JsonLineDecoder::with_partial_text();
        assert_eq!(decoder.push("Proceed? (y/n) "), vec![text("Proceed? (y/n) ", true)]);
        assert_eq!(decoder.push("y\r\nnext"), vec![text("y", false), text("next", true)]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn assistant_message_yields_text_tools_and_usage() {
        let mut interpreter = StreamInterpreter::new();
        let messages = interpreter.interpret(&json!({
            "type": "assistant",
            "message": {
                "id": "msg_1",
                "content": [
                    {"type": "text", "text": "Running tests"},
                    {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "cargo test"}}
                ],
                "usage": {"input_tokens": 10, "cache_read_input_tokens": 5, "output_tokens": 7}
            }
        }));
        assert_eq!(
            messages,
            vec![
                QueryMessage::Text {
                    message_id: Some("msg_1".to_string()),
                    text: "Running tests".to_string(),
                    partial: false
                },
                QueryMessage::ToolUse {
                    message_id: Some("msg_1".to_string()),
                    tool_use_id: "toolu_1".to_string(),
                    name: "Bash".to_string(),
                    input: json!({"command": "cargo test"})
                },
                QueryMessage::Usage {
                    message_id: "msg_1".to_string(),
                    usage: TokenUsage {
                        input_tokens: 15,
                        output_tokens: 7
                    }
                },
            ]
        );
        assert_eq!(interpreter.tool_name("toolu_1"), Some("Bash"));
    }

    #[test]
    fn init_result_and_permission_requests() {
        let mut interpreter = StreamInterpreter::new();
        assert_eq!(
            interpreter.interpret(&json!({"type": "system", "subtype": "init", "session_id": "conv-1", "model": "m"})),
            vec![QueryMessage::Init {
                conversation_id: "conv-1".to_string(),
                model: Some("m".to_string())
            }]
        );

        let result = interpreter.interpret(&json!({
            "type": "result", "subtype": "error_max_budget_usd", "is_error": true,
            "total_cost_usd": 2.1, "uuid": "r1"
        }));
        match result.as_slice() {
            [QueryMessage::Result(result)] => {
                assert!(result.is_error);
                assert!(result.is_budget_exhausted());
                assert_eq!(result.cost_usd, 2.1);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(
            interpreter.interpret(&json!({
                "type": "control_request",
                "request_id": "req-1",
                "request": {"subtype": "can_use_tool", "tool_name": "Bash", "input": {"command": "ls"}, "tool_use_id": "t1"}
            })),
            vec![QueryMessage::PermissionRequest(PermissionRequest {
                request_id: "req-1".to_string(),
                tool_name: "Bash".to_string(),
                input: json!({"command": "ls"}),
                tool_use_id: Some("t1".to_string()),
            })]
        );
    }

    #[test]
    fn stream_deltas_carry_the_started_message_id() {
        let mut interpreter = StreamInterpreter::new();
        assert!(interpreter
            .interpret(&json!({"type": "stream_event", "event": {"type": "message_start", "message": {"id": "msg_9"}}}))
            .is_empty());
        assert_eq!(
            interpreter.interpret(&json!({
                "type": "stream_event",
                "event": {"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hel"}}
            })),
            vec![QueryMessage::Text {
                message_id: Some("msg_9".to_string()),
                text: "Hel".to_string(),
                partial: true
            }]
        );
    }
}
