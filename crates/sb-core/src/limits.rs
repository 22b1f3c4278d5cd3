//! Operational constants shared by both sides of the control plane.
//!
//! These values are part of the wire-level contract; changing any of them
//! breaks compatibility with deployed peers.

/// Interval between `worker:heartbeat` frames.
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// A worker silent for this long is treated as disconnected.
pub const HEARTBEAT_WATCHDOG_MS: u64 = 60_000;

/// Reconnect backoff: first delay.
pub const RECONNECT_BASE_MS: u64 = 1_000;

/// Reconnect backoff: ceiling.
pub const RECONNECT_CAP_MS: u64 = 60_000;

/// Reconnect backoff jitter, as a fraction of the delay (plus or minus).
pub const RECONNECT_JITTER: f64 = 0.2;

/// Overall task deadline, enforced independently on both sides.
pub const TASK_TIMEOUT_MS: u64 = 600_000;

/// Maximum number of queued tasks; admission fails beyond this.
pub const QUEUE_CAPACITY: usize = 50;

/// Hard cap on a single chat message.
pub const CHAT_MESSAGE_CAP: usize = 2_000;

/// Hard cap on a single embed field.
pub const EMBED_FIELD_CAP: usize = 4_096;

/// Minimum interval between stream-update notifications per task.
pub const STREAM_THROTTLE_MS: u64 = 1_000;

/// Attachments larger than this are rejected at admission.
pub const ATTACHMENT_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// Budget for downloading and transferring all of a task's attachments.
pub const TRANSFER_BUDGET_MS: u64 = 10_000;

/// A connected socket must complete registration within this window.
pub const AUTH_DEADLINE_MS: u64 = 10_000;

/// Grace period between SIGTERM and SIGKILL when stopping the CLI.
pub const KILL_GRACE_MS: u64 = 5_000;

/// Character budget for a Bash command in a tool summary.
pub const BASH_SUMMARY_CHARS: usize = 60;

/// Character budget for tool-result content in a tool summary.
pub const TOOL_RESULT_SUMMARY_CHARS: usize = 80;

/// Character budget for a prompt shown in status output.
pub const PROMPT_PREVIEW_CHARS: usize = 200;
