//! Translates the assistant CLI's newline-delimited JSON stream into typed
//! events.
//!
//! The CLI emits heterogeneous record shapes; classification branches on the
//! `type` field and token-usage synthesis is a separate pass applied per
//! record. Lines that fail to decode are logged and skipped, never surfaced
//! as errors.

use sb_core::limits::{BASH_SUMMARY_CHARS, TOOL_RESULT_SUMMARY_CHARS};
use sb_core::text::truncate_chars;
use sb_core::types::TokenUsage;
use sb_protocol::StreamEvent;
use serde_json::Value;

// ---------------------------------------------------------------------------
// StreamParser
// ---------------------------------------------------------------------------

/// Stateful chunk-to-event translator. Single-owner, non-concurrent.
///
/// An incomplete trailing line is buffered across `parse` calls, so feeding
/// the same bytes in any chunking yields the same event sequence.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: String,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any buffered partial line.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Consume a chunk of CLI stdout and return the events it completes.
    pub fn parse(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(record) => events.extend(classify(&record)),
                Err(error) => {
                    tracing::debug!(%error, "discarding unparseable stream line");
                }
            }
        }
        events
    }
}

// ---------------------------------------------------------------------------
// Record classification
// ---------------------------------------------------------------------------

/// Map one well-formed record to zero or more events.
fn classify(record: &Value) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    match record.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            if let Some(text) = assistant_text(record) {
                events.push(StreamEvent::AssistantMessage { text });
            }
            if let Some(usage) = record.pointer("/message/usage").filter(|u| u.is_object()) {
                events.push(StreamEvent::TokenUsage {
                    usage: usage_from_snake_case(usage),
                });
            }
        }
        Some("tool_use") => {
            let tool = record
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("tool")
                .to_string();
            let summary = tool_summary(&tool, record.get("input").unwrap_or(&Value::Null));
            events.push(StreamEvent::ToolUseBegin { tool, summary });
        }
        Some("ask_user") => {
            let summary = record
                .get("question")
                .and_then(Value::as_str)
                .unwrap_or("AskUserQuestion")
                .to_string();
            events.push(StreamEvent::ToolUseBegin {
                tool: "AskUserQuestion".to_string(),
                summary,
            });
        }
        Some("tool_result") => {
            let tool = record
                .get("tool_name")
                .or_else(|| record.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("tool")
                .to_string();
            let content = content_text(record.get("content").unwrap_or(&Value::Null));
            let is_error = record
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            events.push(StreamEvent::ToolUseEnd {
                tool,
                summary: truncate_chars(&content, TOOL_RESULT_SUMMARY_CHARS),
                success: !is_error,
            });
        }
        Some("result") => {
            let text = record
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let session_id = record
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            events.push(StreamEvent::Result { text, session_id });
            if let Some(usage) = result_usage(record) {
                events.push(StreamEvent::TokenUsage { usage });
            }
        }
        Some("rate_limit_event") => {
            if let Some(info) = record.get("rate_limit_info") {
                events.push(StreamEvent::RateLimit { info: info.clone() });
            }
        }
        _ => {
            if let Some(usage) = record.get("usage").filter(|u| u.is_object()) {
                events.push(StreamEvent::TokenUsage {
                    usage: usage_from_snake_case(usage),
                });
            }
        }
    }

    events
}

/// Extract assistant text from either record nesting.
///
/// Older CLI builds put the content array at the top level; newer ones nest
/// it under `message`. Both are accepted; text blocks are concatenated.
fn assistant_text(record: &Value) -> Option<String> {
    let content = record
        .pointer("/message/content")
        .or_else(|| record.get("content"))?;
    let blocks = content.as_array()?;

    let mut text = String::new();
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(part) = block.get("text").and_then(Value::as_str) {
                text.push_str(part);
            }
        }
    }
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// One-line summary for a tool invocation, shaped per tool.
fn tool_summary(tool: &str, input: &Value) -> String {
    let str_field = |key: &str| input.get(key).and_then(Value::as_str);

    match tool {
        "Read" | "Edit" | "Write" => {
            let path = str_field("file_path").or_else(|| str_field("path")).unwrap_or("?");
            format!("{tool}: {path}")
        }
        "Bash" => {
            let command = str_field("command").unwrap_or("");
            format!("Bash: {}", truncate_chars(command, BASH_SUMMARY_CHARS))
        }
        "Grep" => {
            let pattern = str_field("pattern").unwrap_or("?");
            let path = str_field("path").unwrap_or(".");
            format!("Grep: {pattern} in {path}")
        }
        "Glob" => {
            let pattern = str_field("pattern").unwrap_or("?");
            format!("Glob: {pattern}")
        }
        "AskUserQuestion" => str_field("question").unwrap_or(tool).to_string(),
        _ => tool.to_string(),
    }
}

/// Flatten tool-result content, which may be a bare string or a block array.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Token usage for a `result` record: per-model aggregation when present,
/// otherwise the top-level `usage` object, otherwise nothing.
fn result_usage(record: &Value) -> Option<TokenUsage> {
    if let Some(models) = record.get("modelUsage").and_then(Value::as_object) {
        let total = models
            .values()
            .map(usage_from_camel_case)
            .fold(TokenUsage::default(), TokenUsage::saturating_add);
        return Some(total);
    }
    record
        .get("usage")
        .filter(|usage| usage.is_object())
        .map(usage_from_snake_case)
}

/// Usage counters in the CLI's snake_case shape; missing fields are zero.
fn usage_from_snake_case(usage: &Value) -> TokenUsage {
    let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input: field("input_tokens"),
        output: field("output_tokens"),
        cache_read: field("cache_read_input_tokens"),
        cache_write: field("cache_creation_input_tokens"),
    }
}

/// Usage counters in the per-model camelCase shape.
fn usage_from_camel_case(usage: &Value) -> TokenUsage {
    let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input: field("inputTokens"),
        output: field("outputTokens"),
        cache_read: field("cacheReadInputTokens"),
        cache_write: field("cacheCreationInputTokens"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut StreamParser, chunks: &[&str]) -> Vec<StreamEvent> {
        chunks.iter().flat_map(|c| parser.parse(c)).collect()
    }

    #[test]
    fn carries_partial_line_across_chunks() {
        let mut parser = StreamParser::new();
        let events = parse_all(
            &mut parser,
            &[
                r#"{"type":"result","resu"#,
                "lt\":\"ok\",\"session_id\":null}\n",
            ],
        );
        let results: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Result { .. }))
            .collect();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0],
            &StreamEvent::Result {
                text: "ok".into(),
                session_id: None
            }
        );
    }

    #[test]
    fn chunking_does_not_change_the_event_sequence() {
        let stream = concat!(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hi"}]}}"#,
            "\n",
            r#"{"type":"tool_use","name":"Bash","input":{"command":"ls"}}"#,
            "\n",
            r#"{"type":"result","result":"done","session_id":"s9"}"#,
            "\n",
        );

        let mut whole = StreamParser::new();
        let expected = whole.parse(stream);

        for split in [1, 10, 40, stream.len() - 1] {
            let mut parser = StreamParser::new();
            let events = parse_all(&mut parser, &[&stream[..split], &stream[split..]]);
            assert_eq!(events, expected, "split at {split} diverged");
        }
    }

    #[test]
    fn assistant_record_supports_both_nestings() {
        let mut parser = StreamParser::new();
        let nested = parser.parse(
            "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"a\"}]}}\n",
        );
        let direct =
            parser.parse("{\"type\":\"assistant\",\"content\":[{\"type\":\"text\",\"text\":\"b\"}]}\n");
        assert_eq!(nested, vec![StreamEvent::AssistantMessage { text: "a".into() }]);
        assert_eq!(direct, vec![StreamEvent::AssistantMessage { text: "b".into() }]);
    }

    #[test]
    fn assistant_record_emits_usage_alongside_text() {
        let mut parser = StreamParser::new();
        let line = concat!(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hi"}],"#,
            r#""usage":{"input_tokens":10,"output_tokens":2}}}"#,
            "\n"
        );
        let events = parser.parse(line);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::AssistantMessage { text: "Hi".into() });
        assert_eq!(
            events[1],
            StreamEvent::TokenUsage {
                usage: TokenUsage {
                    input: 10,
                    output: 2,
                    cache_read: 0,
                    cache_write: 0
                }
            }
        );
    }

    #[test]
    fn assistant_record_without_text_block_emits_nothing() {
        let mut parser = StreamParser::new();
        let events = parser.parse(
            "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"id\":\"t1\"}]}}\n",
        );
        assert!(events.is_empty());
    }

    #[test]
    fn bash_summary_is_truncated_to_sixty_chars() {
        let command = "x".repeat(100);
        let line = format!(
            "{{\"type\":\"tool_use\",\"name\":\"Bash\",\"input\":{{\"command\":\"{command}\"}}}}\n"
        );
        let mut parser = StreamParser::new();
        let events = parser.parse(&line);
        match &events[0] {
            StreamEvent::ToolUseBegin { tool, summary } => {
                assert_eq!(tool, "Bash");
                let body = summary.strip_prefix("Bash: ").unwrap();
                assert_eq!(body.chars().count(), 60);
            }
            other => panic!("expected tool_use_begin, got {other:?}"),
        }
    }

    #[test]
    fn file_tools_show_the_path() {
        let mut parser = StreamParser::new();
        let events = parser.parse(
            "{\"type\":\"tool_use\",\"name\":\"Read\",\"input\":{\"file_path\":\"/src/lib.rs\"}}\n",
        );
        assert_eq!(
            events,
            vec![StreamEvent::ToolUseBegin {
                tool: "Read".into(),
                summary: "Read: /src/lib.rs".into()
            }]
        );
    }

    #[test]
    fn grep_and_glob_show_patterns() {
        let mut parser = StreamParser::new();
        let events = parser.parse(concat!(
            r#"{"type":"tool_use","name":"Grep","input":{"pattern":"fn main","path":"src"}}"#,
            "\n",
            r#"{"type":"tool_use","name":"Glob","input":{"pattern":"**/*.rs"}}"#,
            "\n",
        ));
        assert_eq!(
            events[0],
            StreamEvent::ToolUseBegin {
                tool: "Grep".into(),
                summary: "Grep: fn main in src".into()
            }
        );
        assert_eq!(
            events[1],
            StreamEvent::ToolUseBegin {
                tool: "Glob".into(),
                summary: "Glob: **/*.rs".into()
            }
        );
    }

    #[test]
    fn unknown_tool_falls_back_to_its_name() {
        let mut parser = StreamParser::new();
        let events = parser.parse("{\"type\":\"tool_use\",\"name\":\"WebSearch\",\"input\":{}}\n");
        assert_eq!(
            events,
            vec![StreamEvent::ToolUseBegin {
                tool: "WebSearch".into(),
                summary: "WebSearch".into()
            }]
        );
    }

    #[test]
    fn ask_user_record_maps_to_ask_user_question_tool() {
        let mut parser = StreamParser::new();
        let events = parser.parse("{\"type\":\"ask_user\",\"question\":\"Deploy to prod?\"}\n");
        assert_eq!(
            events,
            vec![StreamEvent::ToolUseBegin {
                tool: "AskUserQuestion".into(),
                summary: "Deploy to prod?".into()
            }]
        );
    }

    #[test]
    fn tool_result_maps_is_error_and_truncates_content() {
        let content = "y".repeat(200);
        let line = format!(
            "{{\"type\":\"tool_result\",\"tool_name\":\"Bash\",\"content\":\"{content}\",\"is_error\":true}}\n"
        );
        let mut parser = StreamParser::new();
        let events = parser.parse(&line);
        match &events[0] {
            StreamEvent::ToolUseEnd { tool, summary, success } => {
                assert_eq!(tool, "Bash");
                assert!(!success);
                assert_eq!(summary.chars().count(), 80);
            }
            other => panic!("expected tool_use_end, got {other:?}"),
        }
    }

    #[test]
    fn tool_result_block_array_content_is_flattened() {
        let mut parser = StreamParser::new();
        let events = parser.parse(concat!(
            r#"{"type":"tool_result","tool_name":"Read","content":[{"type":"text","text":"file contents"}]}"#,
            "\n",
        ));
        assert_eq!(
            events,
            vec![StreamEvent::ToolUseEnd {
                tool: "Read".into(),
                summary: "file contents".into(),
                success: true
            }]
        );
    }

    #[test]
    fn result_record_sums_per_model_usage() {
        let line = concat!(
            r#"{"type":"result","result":"Hi","session_id":"s1","modelUsage":{"#,
            r#""big-model":{"inputTokens":10,"outputTokens":2,"cacheReadInputTokens":3,"cacheCreationInputTokens":1},"#,
            r#""small-model":{"inputTokens":5,"outputTokens":1}}}"#,
            "\n"
        );
        let mut parser = StreamParser::new();
        let events = parser.parse(line);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            StreamEvent::Result {
                text: "Hi".into(),
                session_id: Some("s1".into())
            }
        );
        assert_eq!(
            events[1],
            StreamEvent::TokenUsage {
                usage: TokenUsage {
                    input: 15,
                    output: 3,
                    cache_read: 3,
                    cache_write: 1
                }
            }
        );
    }

    #[test]
    fn result_record_falls_back_to_top_level_usage() {
        let line = concat!(
            r#"{"type":"result","result":"Hi","usage":{"input_tokens":7,"output_tokens":4}}"#,
            "\n"
        );
        let mut parser = StreamParser::new();
        let events = parser.parse(line);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            StreamEvent::TokenUsage {
                usage: TokenUsage {
                    input: 7,
                    output: 4,
                    cache_read: 0,
                    cache_write: 0
                }
            }
        );
    }

    #[test]
    fn result_record_without_usage_emits_only_the_result() {
        let mut parser = StreamParser::new();
        let events = parser.parse("{\"type\":\"result\",\"result\":\"Hi\"}\n");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn rate_limit_event_requires_info() {
        let mut parser = StreamParser::new();
        let with_info =
            parser.parse("{\"type\":\"rate_limit_event\",\"rate_limit_info\":{\"status\":\"throttled\"}}\n");
        assert!(matches!(with_info[0], StreamEvent::RateLimit { .. }));

        let without = parser.parse("{\"type\":\"rate_limit_event\"}\n");
        assert!(without.is_empty());
    }

    #[test]
    fn unknown_record_with_usage_yields_token_usage() {
        let mut parser = StreamParser::new();
        let events =
            parser.parse("{\"type\":\"mystery\",\"usage\":{\"input_tokens\":3}}\n");
        assert_eq!(
            events,
            vec![StreamEvent::TokenUsage {
                usage: TokenUsage {
                    input: 3,
                    output: 0,
                    cache_read: 0,
                    cache_write: 0
                }
            }]
        );
    }

    #[test]
    fn unknown_record_without_usage_is_silent() {
        let mut parser = StreamParser::new();
        assert!(parser.parse("{\"type\":\"system\",\"subtype\":\"init\"}\n").is_empty());
    }

    #[test]
    fn bad_lines_are_skipped_and_parsing_continues() {
        let mut parser = StreamParser::new();
        let events = parser.parse("not json at all\n{\"type\":\"result\",\"result\":\"ok\"}\n");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn empty_lines_are_skipped() {
        let mut parser = StreamParser::new();
        assert!(parser.parse("\n\n  \n").is_empty());
    }

    #[test]
    fn reset_drops_the_partial_tail() {
        let mut parser = StreamParser::new();
        parser.parse(r#"{"type":"result","#);
        parser.reset();
        let events = parser.parse("{\"type\":\"result\",\"result\":\"ok\"}\n");
        assert_eq!(events.len(), 1);
    }
}
