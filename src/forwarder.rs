use std::path::PathBuf;

use serde_json::Value;

use crate::protocol::ServerEvent;

/// Tool names whose input declares a screenshot file on disk.
const SCREENSHOT_TOOLS: &[&str] = &["mcp__playwright__browser_take_screenshot"];

/// Stateful mapper from agent stream-json events to client events.
///
/// The agent CLI emits `content_block_start` / `content_block_delta` /
/// `content_block_stop` while streaming, plus an `assistant` event carrying
/// the complete content blocks after each turn. Streaming events drive
/// real-time output; the assistant aggregate is a fallback used only when no
/// streaming events fired, since replaying both would duplicate text.
pub struct EventForwarder {
    saw_streaming: bool,
    active_tool: Option<String>,
    tool_input_json: String,
    tool_start_sent: bool,
    /// Image file paths produced during this turn, in emission order.
    pub image_paths: Vec<String>,
    cwd: PathBuf,
}

impl EventForwarder {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            saw_streaming: false,
            active_tool: None,
            tool_input_json: String::new(),
            tool_start_sent: false,
            image_paths: Vec::new(),
            cwd,
        }
    }

    /// Translates one upstream event into zero or more client events.
    pub fn handle(&mut self, event: &Value, conversation_id: &str) -> Vec<ServerEvent> {
        match event.get("type").and_then(Value::as_str) {
            Some("content_block_start") => self.on_block_start(event, conversation_id),
            Some("content_block_delta") => self.on_block_delta(event, conversation_id),
            Some("content_block_stop") => self.on_block_stop(conversation_id),
            Some("assistant") => self.on_assistant(event, conversation_id),
            _ => Vec::new(),
        }
    }

    fn on_block_start(&mut self, event: &Value, conversation_id: &str) -> Vec<ServerEvent> {
        self.saw_streaming = true;
        let block = &event["content_block"];
        if block.get("type").and_then(Value::as_str) != Some("tool_use") {
            return Vec::new();
        }
        let tool = block
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.tool_input_json.clear();
        self.tool_start_sent = false;

        // Some blocks arrive with their input already complete.
        let summary = summarize_tool_input(&tool, &block["input"]);
        let out = if summary.is_empty() {
            Vec::new()
        } else {
            self.tool_start_sent = true;
            vec![ServerEvent::ToolStart {
                tool: tool.clone(),
                input_summary: summary,
                conversation_id: conversation_id.to_string(),
            }]
        };
        self.active_tool = Some(tool);
        out
    }

    fn on_block_delta(&mut self, event: &Value, conversation_id: &str) -> Vec<ServerEvent> {
        self.saw_streaming = true;
        let delta = &event["delta"];
        match delta.get("type").and_then(Value::as_str) {
            Some("text_delta") => vec![ServerEvent::TextDelta {
                text: delta
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                conversation_id: conversation_id.to_string(),
            }],
            Some("input_json_delta") if self.active_tool.is_some() => {
                self.tool_input_json
                    .push_str(delta.get("partial_json").and_then(Value::as_str).unwrap_or_default());
                // Emit the deferred tool_start as soon as the buffer parses.
                if !self.tool_start_sent && self.tool_input_json.len() > 5 {
                    if let Ok(input) = serde_json::from_str::<Value>(&self.tool_input_json) {
                        let tool = self.active_tool.clone().unwrap_or_default();
                        let summary = summarize_tool_input(&tool, &input);
                        if !summary.is_empty() {
                            self.tool_start_sent = true;
                            return vec![ServerEvent::ToolStart {
                                tool,
                                input_summary: summary,
                                conversation_id: conversation_id.to_string(),
                            }];
                        }
                    }
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_block_stop(&mut self, conversation_id: &str) -> Vec<ServerEvent> {
        let Some(tool) = self.active_tool.take() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if !self.tool_start_sent {
            let summary = match serde_json::from_str::<Value>(&self.tool_input_json) {
                Ok(input) => summarize_tool_input(&tool, &input),
                Err(_) => truncate(&self.tool_input_json, 80),
            };
            out.push(ServerEvent::ToolStart {
                tool: tool.clone(),
                input_summary: summary,
                conversation_id: conversation_id.to_string(),
            });
        }
        if SCREENSHOT_TOOLS.contains(&tool.as_str()) {
            if let Some(filename) = serde_json::from_str::<Value>(&self.tool_input_json)
                .ok()
                .and_then(|input| input.get("filename").and_then(Value::as_str).map(str::to_string))
            {
                out.push(self.record_image(&filename, conversation_id));
            }
        }
        self.tool_input_json.clear();
        self.tool_start_sent = false;
        out.push(ServerEvent::ToolDone {
            conversation_id: conversation_id.to_string(),
        });
        out
    }

    fn on_assistant(&mut self, event: &Value, conversation_id: &str) -> Vec<ServerEvent> {
        if self.saw_streaming {
            return Vec::new();
        }
        let blocks = event["message"]
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut out = Vec::new();
        for block in &blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => out.push(ServerEvent::TextDelta {
                    text: block
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    conversation_id: conversation_id.to_string(),
                }),
                Some("tool_use") => {
                    let tool = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    out.push(ServerEvent::ToolStart {
                        tool: tool.clone(),
                        input_summary: summarize_tool_input(&tool, &block["input"]),
                        conversation_id: conversation_id.to_string(),
                    });
                    if SCREENSHOT_TOOLS.contains(&tool.as_str()) {
                        if let Some(filename) =
                            block["input"].get("filename").and_then(Value::as_str)
                        {
                            let filename = filename.to_string();
                            out.push(self.record_image(&filename, conversation_id));
                        }
                    }
                    out.push(ServerEvent::ToolDone {
                        conversation_id: conversation_id.to_string(),
                    });
                }
                _ => {}
            }
        }
        out
    }

    fn record_image(&mut self, filename: &str, conversation_id: &str) -> ServerEvent {
        let resolved = if std::path::Path::new(filename).is_absolute() {
            PathBuf::from(filename)
        } else {
            self.cwd.join(filename)
        };
        let path = resolved.to_string_lossy().to_string();
        self.image_paths.push(path.clone());
        ServerEvent::Image {
            path,
            conversation_id: conversation_id.to_string(),
        }
    }
}

/// Human-readable one-liner for a tool invocation; display only, so every
/// miss degrades to an empty string.
pub fn summarize_tool_input(tool: &str, input: &Value) -> String {
    let str_field = |key: &str| input.get(key).and_then(Value::as_str).map(str::to_string);
    match tool {
        "Read" | "Glob" | "Grep" => str_field("file_path")
            .or_else(|| str_field("pattern"))
            .or_else(|| str_field("path"))
            .unwrap_or_default(),
        "Edit" | "Write" => str_field("file_path").unwrap_or_default(),
        "Bash" => truncate(&str_field("command").unwrap_or_default(), 80),
        "Task" => str_field("description")
            .unwrap_or_else(|| truncate(&str_field("prompt").unwrap_or_default(), 80)),
        "TodoWrite" => {
            let todos = input.get("todos").and_then(Value::as_array).cloned().unwrap_or_default();
            let in_progress = todos.iter().find(|t| {
                t.get("status").and_then(Value::as_str) == Some("in_progress")
            });
            match in_progress {
                Some(todo) => todo
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                None => format!("{} items", todos.len()),
            }
        }
        "WebSearch" => str_field("query").unwrap_or_default(),
        "WebFetch" => str_field("url").unwrap_or_default(),
        "NotebookEdit" => str_field("notebook_path").unwrap_or_default(),
        _ => input
            .as_object()
            .and_then(|obj| {
                obj.values()
                    .find_map(|v| v.as_str().filter(|s| !s.is_empty()))
            })
            .map(|s| truncate(s, 80))
            .unwrap_or_default(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn forwarder() -> EventForwarder {
        EventForwarder::new(PathBuf::from("/work"))
    }

    #[test]
    fn streams_text_deltas() {
        let mut fwd = forwarder();
        let out = fwd.handle(
            &json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "hi"}}),
            "c1",
        );
        assert!(matches!(
            &out[..],
            [ServerEvent::TextDelta { text, .. }] if text == "hi"
        ));
    }

    #[test]
    fn assistant_fallback_suppressed_after_streaming() {
        let mut fwd = forwarder();
        fwd.handle(
            &json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "streamed"}}),
            "c1",
        );
        let out = fwd.handle(
            &json!({"type": "assistant", "message": {"content": [
                {"type": "text", "text": "aggregate"}
            ]}}),
            "c1",
        );
        assert!(out.is_empty(), "aggregate must not replay streamed text");
    }

    #[test]
    fn assistant_fallback_synthesizes_tool_sequence() {
        let mut fwd = forwarder();
        let out = fwd.handle(
            &json!({"type": "assistant", "message": {"content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "name": "Read", "input": {"file_path": "src/main.rs"}}
            ]}}),
            "c1",
        );
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], ServerEvent::TextDelta { .. }));
        assert!(matches!(
            &out[1],
            ServerEvent::ToolStart { input_summary, .. } if input_summary == "src/main.rs"
        ));
        assert!(matches!(&out[2], ServerEvent::ToolDone { .. }));
    }

    #[test]
    fn deferred_tool_start_emitted_exactly_once() {
        let mut fwd = forwarder();
        let start = fwd.handle(
            &json!({"type": "content_block_start", "content_block": {
                "type": "tool_use", "name": "Bash", "input": {}
            }}),
            "c1",
        );
        assert!(start.is_empty(), "no summary yet, start is deferred");

        // Input arrives in chunks; only the chunk that completes the JSON
        // produces the tool_start.
        let first = fwd.handle(
            &json!({"type": "content_block_delta", "delta": {
                "type": "input_json_delta", "partial_json": "{\"command\": \"ls"
            }}),
            "c1",
        );
        assert!(first.is_empty());
        let second = fwd.handle(
            &json!({"type": "content_block_delta", "delta": {
                "type": "input_json_delta", "partial_json": " -la\"}"
            }}),
            "c1",
        );
        assert!(matches!(
            &second[..],
            [ServerEvent::ToolStart { input_summary, .. }] if input_summary == "ls -la"
        ));

        let stop = fwd.handle(&json!({"type": "content_block_stop"}), "c1");
        assert!(
            matches!(&stop[..], [ServerEvent::ToolDone { .. }]),
            "no second tool_start on stop"
        );
    }

    #[test]
    fn block_stop_falls_back_to_raw_buffer() {
        let mut fwd = forwarder();
        fwd.handle(
            &json!({"type": "content_block_start", "content_block": {
                "type": "tool_use", "name": "Bash", "input": {}
            }}),
            "c1",
        );
        fwd.handle(
            &json!({"type": "content_block_delta", "delta": {
                "type": "input_json_delta", "partial_json": "{\"command\": \"trunc"
            }}),
            "c1",
        );
        let out = fwd.handle(&json!({"type": "content_block_stop"}), "c1");
        assert!(matches!(
            &out[0],
            ServerEvent::ToolStart { input_summary, .. } if input_summary.contains("trunc")
        ));
        assert!(matches!(&out[1], ServerEvent::ToolDone { .. }));
    }

    #[test]
    fn screenshot_tool_records_image_path() {
        let mut fwd = forwarder();
        fwd.handle(
            &json!({"type": "content_block_start", "content_block": {
                "type": "tool_use",
                "name": "mcp__playwright__browser_take_screenshot",
                "input": {}
            }}),
            "c1",
        );
        fwd.handle(
            &json!({"type": "content_block_delta", "delta": {
                "type": "input_json_delta",
                "partial_json": "{\"filename\": \"shot.png\"}"
            }}),
            "c1",
        );
        let out = fwd.handle(&json!({"type": "content_block_stop"}), "c1");
        assert!(out.iter().any(|e| matches!(
            e,
            ServerEvent::Image { path, .. } if path == "/work/shot.png"
        )));
        assert_eq!(fwd.image_paths, vec!["/work/shot.png".to_string()]);
    }

    #[test]
    fn summarizer_covers_common_tools() {
        assert_eq!(
            summarize_tool_input("Read", &json!({"file_path": "a.rs"})),
            "a.rs"
        );
        assert_eq!(
            summarize_tool_input("Grep", &json!({"pattern": "fn main"})),
            "fn main"
        );
        let long = "x".repeat(100);
        let summary = summarize_tool_input("Bash", &json!({"command": long}));
        assert_eq!(summary.len(), 83);
        assert!(summary.ends_with("..."));
        assert_eq!(
            summarize_tool_input("TodoWrite", &json!({"todos": [
                {"content": "a", "status": "pending"},
                {"content": "b", "status": "in_progress"}
            ]})),
            "b"
        );
        assert_eq!(
            summarize_tool_input("TodoWrite", &json!({"todos": [{"content": "a", "status": "pending"}]})),
            "1 items"
        );
        assert_eq!(
            summarize_tool_input("mcp__custom__thing", &json!({"n": 1, "target": "widget"})),
            "widget"
        );
        assert_eq!(summarize_tool_input("WebSearch", &json!({})), "");
    }
}
