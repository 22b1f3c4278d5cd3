use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` for the three states a task can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

// ---------------------------------------------------------------------------
// PermissionMode
// ---------------------------------------------------------------------------

/// How the assistant CLI is allowed to use tools for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Edits are applied without prompting; everything else still asks.
    AcceptEdits,
    /// All tool use is pre-approved (maps to the CLI's skip-permissions flag).
    Auto,
    /// Every tool use requires explicit confirmation.
    #[default]
    Confirm,
}

// ---------------------------------------------------------------------------
// WorkerStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Busy,
    /// Only seen transiently while a worker is being deregistered.
    Offline,
}

// ---------------------------------------------------------------------------
// Tool history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Completed,
    Error,
}

/// One entry in a task's chronological tool history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: String,
    pub summary: String,
    pub status: ToolStatus,
    pub timestamp: DateTime<Utc>,
}

impl ToolInvocation {
    pub fn running(tool: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            summary: summary.into(),
            status: ToolStatus::Running,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// A file the requester attached to a task.
///
/// `local_path` is `None` until the worker has acknowledged the transfer;
/// when the transfer step fails the task still runs and the assistant sees
/// the attachment by reference in the prompt instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_name: String,
    pub mime: String,
    pub size_bytes: u64,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

// ---------------------------------------------------------------------------
// TokenUsage
// ---------------------------------------------------------------------------

/// Cumulative token counters for one task.
///
/// Workers report cumulative values, so consumers overwrite rather than add.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl TokenUsage {
    pub fn is_zero(&self) -> bool {
        *self == TokenUsage::default()
    }

    /// Component-wise sum, saturating; used when aggregating per-model usage.
    pub fn saturating_add(self, other: TokenUsage) -> TokenUsage {
        TokenUsage {
            input: self.input.saturating_add(other.input),
            output: self.output.saturating_add(other.output),
            cache_read: self.cache_read.saturating_add(other.cache_read),
            cache_write: self.cache_write.saturating_add(other.cache_write),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskSpec
// ---------------------------------------------------------------------------

/// Everything the admission path needs to create a task.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub prompt: String,
    pub cwd: Option<String>,
    pub permission_mode: PermissionMode,
    pub team_mode: bool,
    pub continue_session: bool,
    /// Session id to resume, when `continue_session` is set.
    pub resume_session_id: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Dispatch prefers this worker when it is online.
    pub preferred_worker: Option<String>,
    pub requester_id: Option<String>,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One invocation of the assistant CLI and its aggregated lifecycle state.
///
/// Created by admission, mutated only by the task manager, retained in
/// memory until process exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub cwd: Option<String>,
    pub permission_mode: PermissionMode,
    pub team_mode: bool,
    pub continue_session: bool,
    /// Session id this task resumes, if any.
    pub resume_session_id: Option<String>,
    /// Session id the CLI reported for this task's own run.
    pub session_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub tool_history: Vec<ToolInvocation>,
    pub result_text: String,
    pub error_message: Option<String>,
    pub usage: TokenUsage,
    pub preferred_worker: Option<String>,
    pub requester_id: Option<String>,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, spec: TaskSpec) -> Self {
        Self {
            id: id.into(),
            prompt: spec.prompt,
            status: TaskStatus::Queued,
            worker_id: None,
            cwd: spec.cwd,
            permission_mode: spec.permission_mode,
            team_mode: spec.team_mode,
            continue_session: spec.continue_session,
            resume_session_id: spec.resume_session_id,
            session_id: None,
            attachments: spec.attachments,
            tool_history: Vec::new(),
            result_text: String::new(),
            error_message: None,
            usage: TokenUsage::default(),
            preferred_worker: spec.preferred_worker,
            requester_id: spec.requester_id,
            message_id: spec.message_id,
            thread_id: spec.thread_id,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_cannot_transition() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for target in [
                TaskStatus::Queued,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn queued_can_run_or_cancel_only() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn permission_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&PermissionMode::AcceptEdits).unwrap(),
            "\"acceptEdits\""
        );
        assert_eq!(serde_json::to_string(&PermissionMode::Auto).unwrap(), "\"auto\"");
        assert_eq!(
            serde_json::to_string(&PermissionMode::Confirm).unwrap(),
            "\"confirm\""
        );
    }

    #[test]
    fn usage_saturating_add_sums_fields() {
        let a = TokenUsage {
            input: 10,
            output: 2,
            cache_read: 1,
            cache_write: 0,
        };
        let b = TokenUsage {
            input: 5,
            output: 3,
            cache_read: 0,
            cache_write: 7,
        };
        let sum = a.saturating_add(b);
        assert_eq!(sum.input, 15);
        assert_eq!(sum.output, 5);
        assert_eq!(sum.cache_read, 1);
        assert_eq!(sum.cache_write, 7);
    }

    #[test]
    fn new_task_starts_queued_and_zeroed() {
        let task = Task::new("task-1", TaskSpec {
            prompt: "hello".into(),
            ..TaskSpec::default()
        });
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.usage.is_zero());
        assert!(task.tool_history.is_empty());
        assert!(task.worker_id.is_none());
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
    }
}
