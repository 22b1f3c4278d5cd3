use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not a valid envelope: bad JSON, missing `type`,
    /// `payload`, or `timestamp`, or an unknown message tag.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The envelope decoded but its payload does not match the schema for
    /// its message kind.
    #[error("bad {kind} payload: {reason}")]
    Payload { kind: MessageKind, reason: String },
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "worker:register")]
    WorkerRegister,
    #[serde(rename = "worker:register_ack")]
    WorkerRegisterAck,
    #[serde(rename = "worker:heartbeat")]
    WorkerHeartbeat,
    #[serde(rename = "worker:heartbeat_ack")]
    WorkerHeartbeatAck,
    #[serde(rename = "task:assign")]
    TaskAssign,
    #[serde(rename = "task:stream")]
    TaskStream,
    #[serde(rename = "task:complete")]
    TaskComplete,
    #[serde(rename = "task:error")]
    TaskError,
    #[serde(rename = "task:cancel")]
    TaskCancel,
    #[serde(rename = "task:question")]
    TaskQuestion,
    #[serde(rename = "task:answer")]
    TaskAnswer,
    #[serde(rename = "task:permission")]
    TaskPermission,
    #[serde(rename = "task:permission_response")]
    TaskPermissionResponse,
    #[serde(rename = "file:transfer")]
    FileTransfer,
    #[serde(rename = "file:transfer_ack")]
    FileTransferAck,
    #[serde(rename = "team:update")]
    TeamUpdate,
}

impl MessageKind {
    /// The wire name carried in the envelope `type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::WorkerRegister => "worker:register",
            MessageKind::WorkerRegisterAck => "worker:register_ack",
            MessageKind::WorkerHeartbeat => "worker:heartbeat",
            MessageKind::WorkerHeartbeatAck => "worker:heartbeat_ack",
            MessageKind::TaskAssign => "task:assign",
            MessageKind::TaskStream => "task:stream",
            MessageKind::TaskComplete => "task:complete",
            MessageKind::TaskError => "task:error",
            MessageKind::TaskCancel => "task:cancel",
            MessageKind::TaskQuestion => "task:question",
            MessageKind::TaskAnswer => "task:answer",
            MessageKind::TaskPermission => "task:permission",
            MessageKind::TaskPermissionResponse => "task:permission_response",
            MessageKind::FileTransfer => "file:transfer",
            MessageKind::FileTransferAck => "file:transfer_ack",
            MessageKind::TeamUpdate => "team:update",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The uniform wrapper around every control-plane message.
///
/// `payload` stays a raw JSON value at this layer; a `null` payload is a
/// valid envelope, a missing one is not. Receivers parse it with
/// [`Envelope::payload_as`] once they have dispatched on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Value,
    /// Milliseconds since the Unix epoch at send time.
    pub timestamp: i64,
    #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "workerId", default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
            task_id: None,
            worker_id: None,
        }
    }

    /// Build an envelope from a typed payload.
    pub fn from_payload<T: Serialize>(kind: MessageKind, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parse the raw payload into the typed schema for this message kind.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolError::Payload {
            kind: self.kind,
            reason: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
