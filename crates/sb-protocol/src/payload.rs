//! Typed payload schemas, one per message kind.
//!
//! Field names are camelCase on the wire. All of these round-trip through
//! the raw `payload` value of an [`crate::Envelope`].

use sb_core::types::{Attachment, PermissionMode, TokenUsage, WorkerStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// `worker:register` -- sent by a worker immediately after connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    /// Shared secret; compared in constant time on the coordinator.
    pub secret: String,
    pub name: String,
    pub os: String,
    pub runtime_version: String,
    /// Version string of the assistant CLI, when the worker knows it.
    #[serde(default)]
    pub cli_version: String,
    pub default_cwd: String,
    #[serde(default)]
    pub allowed_dirs: Vec<String>,
    pub protocol_version: String,
}

/// `worker:register_ack` -- coordinator's reply; `success:false` is followed
/// by a transport close.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAckPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// `worker:heartbeat` -- liveness plus the worker's view of its own state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatAckPayload {}

// ---------------------------------------------------------------------------
// Task lifecycle
// ---------------------------------------------------------------------------

/// `task:assign` -- everything a worker needs to start a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignPayload {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub team_mode: bool,
    /// Session to resume; the worker forwards it to the CLI untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// `task:complete` -- terminal success.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub result_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// `task:error` -- terminal failure; partial output and tokens are allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// `task:cancel` -- advisory abort request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Questions and permissions
// ---------------------------------------------------------------------------

/// `task:question` -- out-of-band user-facing question from the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionPayload {
    pub question_id: String,
    /// Opaque to the core; the chat adapter renders it.
    pub body: Value,
}

/// `task:answer` -- routed back to the worker that asked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPayload {
    pub question_id: String,
    pub body: Value,
}

/// `task:permission` -- tool-use authorisation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestPayload {
    pub request_id: String,
    pub tool: String,
    #[serde(default)]
    pub input: Value,
}

/// `task:permission_response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponsePayload {
    pub request_id: String,
    pub approve: bool,
}

// ---------------------------------------------------------------------------
// File transfer
// ---------------------------------------------------------------------------

/// `file:transfer` -- attachment bytes, base64-encoded, delivered before
/// the owning `task:assign`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferPayload {
    pub file_name: String,
    pub mime: String,
    pub data: String,
}

/// `file:transfer_ack` -- correlated by `(taskId, fileName)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferAckPayload {
    pub file_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Envelope, MessageKind};

    #[test]
    fn register_round_trips_through_envelope() {
        let payload = RegisterPayload {
            secret: "s3cret".into(),
            name: "w1".into(),
            os: "linux".into(),
            runtime_version: "1.80.0".into(),
            cli_version: "2.1.0".into(),
            default_cwd: "/home/dev".into(),
            allowed_dirs: vec!["/home/dev".into()],
            protocol_version: crate::PROTOCOL_VERSION.into(),
        };
        let env = Envelope::from_payload(MessageKind::WorkerRegister, &payload).unwrap();
        let text = env.encode().unwrap();
        let back: RegisterPayload = Envelope::decode(&text).unwrap().payload_as().unwrap();
        assert_eq!(back.name, "w1");
        assert_eq!(back.protocol_version, "1.0.0");
    }

    #[test]
    fn assign_uses_camel_case_field_names() {
        let payload = AssignPayload {
            prompt: "hello".into(),
            cwd: Some("/srv/repo".into()),
            permission_mode: PermissionMode::Auto,
            team_mode: false,
            session_id: Some("s1".into()),
            attachments: vec![],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["permissionMode"], "auto");
        assert_eq!(json["sessionId"], "s1");
        assert!(json.get("team_mode").is_none());
    }

    #[test]
    fn error_payload_defaults_usage() {
        let raw = r#"{"code":"TIMEOUT","message":"task timed out"}"#;
        let payload: TaskErrorPayload = serde_json::from_str(raw).unwrap();
        assert!(payload.usage.is_zero());
        assert!(payload.result_text.is_none());
    }

    #[test]
    fn heartbeat_carries_worker_state() {
        let payload = HeartbeatPayload {
            status: WorkerStatus::Busy,
            current_task_id: Some("task-7".into()),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "busy");
        assert_eq!(json["currentTaskId"], "task-7");
    }
}
