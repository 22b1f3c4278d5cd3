use sb_core::types::TokenUsage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A typed element emitted by the worker's stream parser and relayed to the
/// coordinator inside `task:stream` frames.
///
/// The variant tags are the wire names; the coordinator folds each variant
/// into task state in arrival order, which is what makes begin/end tool
/// matching work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    AssistantMessage {
        text: String,
    },
    ToolUseBegin {
        tool: String,
        summary: String,
    },
    ToolUseEnd {
        tool: String,
        summary: String,
        success: bool,
    },
    /// Cumulative counters; each occurrence replaces the previous values.
    TokenUsage {
        usage: TokenUsage,
    },
    Result {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    RateLimit {
        info: Value,
    },
    Error {
        message: String,
    },
}
