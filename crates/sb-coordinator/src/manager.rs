//! Owns the task state machine: FIFO admission, dispatch, stream
//! aggregation, timeouts, cancellation, and continuation bookkeeping.
//!
//! Tasks live here from creation until process exit. Every terminal
//! transition happens exactly once: it clears the task's timers, releases
//! the worker, publishes the matching event, and advances the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use sb_core::limits::{
    ATTACHMENT_MAX_BYTES, QUEUE_CAPACITY, STREAM_THROTTLE_MS, TASK_TIMEOUT_MS, TRANSFER_BUDGET_MS,
};
use sb_core::types::{Task, TaskSpec, TaskStatus, ToolInvocation, ToolStatus};
use sb_protocol::payload::{
    AnswerPayload, AssignPayload, CancelPayload, CompletePayload, PermissionResponsePayload,
    TaskErrorPayload,
};
use sb_protocol::{Envelope, MessageKind, StreamEvent};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{CoordinatorEvent, EventBus};
use crate::registry::WorkerRegistry;
use crate::transfer::AttachmentTransfers;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task queue is full")]
    QueueFull,
    #[error("attachment {file_name} is {size} bytes, over the 8 MiB cap")]
    AttachmentTooLarge { file_name: String, size: u64 },
}

// ---------------------------------------------------------------------------
// Tuning
// ---------------------------------------------------------------------------

/// Timer settings; production values come from the shared limits, tests
/// shrink them.
#[derive(Debug, Clone, Copy)]
pub struct ManagerTuning {
    pub task_timeout: Duration,
    pub throttle: Duration,
    pub transfer_budget: Duration,
}

impl Default for ManagerTuning {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_millis(TASK_TIMEOUT_MS),
            throttle: Duration::from_millis(STREAM_THROTTLE_MS),
            transfer_budget: Duration::from_millis(TRANSFER_BUDGET_MS),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerPurpose {
    Timeout,
    ThrottleTrailing,
}

/// Continuation bookkeeping for one completed task.
#[derive(Debug, Clone)]
struct SessionRecord {
    task_id: String,
    prompt: String,
    worker_id: Option<String>,
    cwd: Option<String>,
    session_id: String,
}

struct ManagerInner {
    tasks: HashMap<String, Task>,
    queue: VecDeque<String>,
    next_id: u64,
    sessions: Vec<SessionRecord>,
    /// Live timers per task, keyed by purpose; all aborted on terminal
    /// transition so a successor task never sees a stale firing.
    timers: HashMap<String, HashMap<TimerPurpose, JoinHandle<()>>>,
    /// Last stream-update emission per task.
    last_update: HashMap<String, Instant>,
}

// ---------------------------------------------------------------------------
// TaskManager
// ---------------------------------------------------------------------------

pub struct TaskManager {
    inner: Mutex<ManagerInner>,
    registry: Arc<WorkerRegistry>,
    transfers: Arc<AttachmentTransfers>,
    bus: EventBus,
    tuning: ManagerTuning,
    weak: Weak<TaskManager>,
}

impl TaskManager {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        transfers: Arc<AttachmentTransfers>,
        bus: EventBus,
    ) -> Arc<Self> {
        Self::with_tuning(registry, transfers, bus, ManagerTuning::default())
    }

    pub fn with_tuning(
        registry: Arc<WorkerRegistry>,
        transfers: Arc<AttachmentTransfers>,
        bus: EventBus,
        tuning: ManagerTuning,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(ManagerInner {
                tasks: HashMap::new(),
                queue: VecDeque::new(),
                next_id: 0,
                sessions: Vec::new(),
                timers: HashMap::new(),
                last_update: HashMap::new(),
            }),
            registry,
            transfers,
            bus,
            tuning,
            weak: weak.clone(),
        })
    }

    // -- Admission ----------------------------------------------------------

    /// Admit a task into the queue.
    ///
    /// Oversized attachments and a full queue are both admission errors the
    /// caller surfaces to the requester.
    pub async fn create_task(&self, spec: TaskSpec) -> Result<Task, TaskError> {
        for attachment in &spec.attachments {
            if attachment.size_bytes > ATTACHMENT_MAX_BYTES {
                return Err(TaskError::AttachmentTooLarge {
                    file_name: attachment.file_name.clone(),
                    size: attachment.size_bytes,
                });
            }
        }

        let task = {
            let mut inner = self.inner.lock().await;
            if inner.queue.len() >= QUEUE_CAPACITY {
                return Err(TaskError::QueueFull);
            }
            inner.next_id += 1;
            let id = format!("task-{}", inner.next_id);
            let task = Task::new(&id, spec);
            inner.queue.push_back(id.clone());
            inner.tasks.insert(id, task.clone());
            task
        };

        info!(task_id = %task.id, "task queued");
        self.bus
            .publish(CoordinatorEvent::TaskQueued { task: task.clone() });
        Ok(task)
    }

    // -- Dispatch -----------------------------------------------------------

    /// Advance the queue: assign queued tasks to available workers.
    ///
    /// Idempotent; a no-op on an empty queue or with no online worker. The
    /// head stays queued until a worker is available.
    pub async fn dispatch_next(&self) {
        loop {
            let claimed = {
                let mut inner = self.inner.lock().await;
                let Some(head) = inner.queue.front().cloned() else {
                    return;
                };
                let preferred = inner
                    .tasks
                    .get(&head)
                    .and_then(|task| task.preferred_worker.clone());
                let Some(worker_id) = self.registry.available_worker(preferred.as_deref()).await
                else {
                    return;
                };

                inner.queue.pop_front();
                let Some(task) = inner.tasks.get_mut(&head) else {
                    continue;
                };
                task.status = TaskStatus::Running;
                task.worker_id = Some(worker_id.clone());
                task.started_at = Some(Utc::now());
                let snapshot = task.clone();

                self.registry.mark_busy(&worker_id, &head).await;
                self.arm_timeout(&mut inner, &head);
                (snapshot, worker_id)
            };

            let (mut task, worker_id) = claimed;
            info!(task_id = %task.id, worker = %worker_id, "dispatching task");

            // Attachment delivery happens before the assignment so the
            // worker can hand local paths to the CLI.
            if task.attachments.iter().any(|a| a.local_path.is_none()) {
                self.transfers
                    .resolve(
                        &self.registry,
                        &worker_id,
                        &task.id,
                        &mut task.attachments,
                        self.tuning.transfer_budget,
                    )
                    .await;
                let mut inner = self.inner.lock().await;
                if let Some(stored) = inner.tasks.get_mut(&task.id) {
                    stored.attachments = task.attachments.clone();
                }
            }

            let assign = AssignPayload {
                prompt: task.prompt.clone(),
                cwd: task.cwd.clone(),
                permission_mode: task.permission_mode,
                team_mode: task.team_mode,
                session_id: if task.continue_session {
                    task.resume_session_id.clone()
                } else {
                    None
                },
                attachments: task.attachments.clone(),
            };
            let envelope = match Envelope::from_payload(MessageKind::TaskAssign, &assign) {
                Ok(envelope) => envelope.with_task(&task.id).with_worker(&worker_id),
                Err(error) => {
                    warn!(task_id = %task.id, %error, "failed to encode assignment");
                    self.fail_task(&task.id, "failed to encode assignment").await;
                    continue;
                }
            };

            if !self.registry.send_to_worker(&worker_id, envelope).await {
                warn!(task_id = %task.id, worker = %worker_id, "assignment send failed");
                self.fail_task(&task.id, "worker transport closed during dispatch")
                    .await;
                continue;
            }

            let snapshot = self.task(&task.id).await.unwrap_or(task);
            self.bus
                .publish(CoordinatorEvent::TaskStarted { task: snapshot });
        }
    }

    // -- Stream aggregation -------------------------------------------------

    /// Fold one stream event into task state.
    ///
    /// Updates for tasks that are not Running are dropped silently; late
    /// frames after cancel or disconnect are expected.
    pub async fn handle_stream(&self, task_id: &str, event: StreamEvent) {
        let snapshot = {
            let mut inner = self.inner.lock().await;
            let Some(task) = inner.tasks.get_mut(task_id) else {
                debug!(task_id, "stream update for unknown task dropped");
                return;
            };
            if task.status != TaskStatus::Running {
                debug!(task_id, status = %task.status, "late stream update dropped");
                return;
            }

            match event {
                StreamEvent::AssistantMessage { text } => task.result_text.push_str(&text),
                StreamEvent::ToolUseBegin { tool, summary } => {
                    task.tool_history.push(ToolInvocation::running(tool, summary));
                }
                StreamEvent::ToolUseEnd { tool, summary, success } => {
                    match task
                        .tool_history
                        .iter_mut()
                        .rev()
                        .find(|entry| entry.tool == tool && entry.status == ToolStatus::Running)
                    {
                        Some(entry) => {
                            entry.summary = summary;
                            entry.status = if success {
                                ToolStatus::Completed
                            } else {
                                ToolStatus::Error
                            };
                        }
                        None => debug!(task_id, tool, "tool end without matching begin"),
                    }
                }
                // Cumulative values from the worker; overwrite, never add.
                StreamEvent::TokenUsage { usage } => task.usage = usage,
                StreamEvent::Result { text, session_id } => {
                    task.result_text = text;
                    if session_id.is_some() {
                        task.session_id = session_id;
                    }
                }
                StreamEvent::Error { message } => task.error_message = Some(message),
                StreamEvent::RateLimit { info } => {
                    debug!(task_id, ?info, "assistant reported a rate limit");
                }
            }
            task.clone()
        };

        self.publish_throttled(snapshot).await;
    }

    /// Debounce `TaskStreamUpdate` to one emission per throttle window, with
    /// a single trailing emission for updates that landed inside it.
    async fn publish_throttled(&self, task: Task) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let last = inner.last_update.get(&task.id).copied();

        let within_window = match last {
            Some(last) => now.duration_since(last) < self.tuning.throttle,
            None => false,
        };

        if !within_window {
            inner.last_update.insert(task.id.clone(), now);
            drop(inner);
            self.bus
                .publish(CoordinatorEvent::TaskStreamUpdate { task });
            return;
        }

        let elapsed = now.duration_since(last.unwrap_or(now));
        let delay = self.tuning.throttle.saturating_sub(elapsed);
        let timers = inner.timers.entry(task.id.clone()).or_default();
        if timers.contains_key(&TimerPurpose::ThrottleTrailing) {
            return; // collapses into the already-scheduled trailing update
        }
        let manager = self.weak.clone();
        let task_id = task.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.emit_trailing_update(&task_id).await;
            }
        });
        timers.insert(TimerPurpose::ThrottleTrailing, handle);
    }

    async fn emit_trailing_update(&self, task_id: &str) {
        let snapshot = {
            let mut inner = self.inner.lock().await;
            if let Some(timers) = inner.timers.get_mut(task_id) {
                timers.remove(&TimerPurpose::ThrottleTrailing);
            }
            let snapshot = inner
                .tasks
                .get(task_id)
                .filter(|task| task.status == TaskStatus::Running)
                .cloned();
            if snapshot.is_some() {
                inner.last_update.insert(task_id.to_string(), Instant::now());
            }
            snapshot
        };
        if let Some(task) = snapshot {
            self.bus.publish(CoordinatorEvent::TaskStreamUpdate { task });
        }
    }

    // -- Terminal transitions -----------------------------------------------

    /// `task:complete` from the assigned worker.
    pub async fn handle_complete(&self, task_id: &str, payload: CompletePayload) {
        let outcome = {
            let mut inner = self.inner.lock().await;
            let Some(task) = inner.tasks.get_mut(task_id) else {
                return;
            };
            if task.status != TaskStatus::Running {
                debug!(task_id, "completion for non-running task dropped");
                return;
            }
            if !payload.result_text.is_empty() {
                task.result_text = payload.result_text;
            }
            if payload.session_id.is_some() {
                task.session_id = payload.session_id;
            }
            if !payload.usage.is_zero() {
                task.usage = payload.usage;
            }
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            let snapshot = task.clone();

            if let Some(session_id) = snapshot.session_id.clone() {
                inner.sessions.push(SessionRecord {
                    task_id: snapshot.id.clone(),
                    prompt: snapshot.prompt.clone(),
                    worker_id: snapshot.worker_id.clone(),
                    cwd: snapshot.cwd.clone(),
                    session_id,
                });
            }
            Self::clear_task_timers(&mut inner, task_id);
            snapshot
        };

        info!(task_id, "task completed");
        self.release_and_publish(outcome, true).await;
    }

    /// `task:error` from the assigned worker.
    pub async fn handle_error(&self, task_id: &str, payload: TaskErrorPayload) {
        let outcome = {
            let mut inner = self.inner.lock().await;
            let Some(task) = inner.tasks.get_mut(task_id) else {
                return;
            };
            if task.status != TaskStatus::Running {
                debug!(task_id, "error for non-running task dropped");
                return;
            }
            if let Some(result_text) = payload.result_text {
                task.result_text = result_text;
            }
            if !payload.usage.is_zero() {
                task.usage = payload.usage;
            }
            task.error_message = Some(format!("{}: {}", payload.code, payload.message));
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
            let snapshot = task.clone();
            Self::clear_task_timers(&mut inner, task_id);
            snapshot
        };

        warn!(task_id, error = %outcome.error_message.as_deref().unwrap_or("-"), "task failed");
        self.release_and_publish(outcome, false).await;
    }

    /// Fail a running task from the coordinator side (disconnects, send
    /// failures).
    pub async fn fail_task(&self, task_id: &str, message: &str) {
        self.handle_error(
            task_id,
            TaskErrorPayload {
                code: "WORKER_DISCONNECT".to_string(),
                message: message.to_string(),
                result_text: None,
                usage: Default::default(),
            },
        )
        .await;
    }

    /// Cancel a task.
    ///
    /// Queued tasks are dequeued; running tasks get an advisory
    /// `task:cancel` and transition immediately, without waiting for the
    /// worker. Returns `false` for terminal or unknown tasks.
    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> bool {
        let (snapshot, worker_id) = {
            let mut inner = self.inner.lock().await;
            let Some(task) = inner.tasks.get_mut(task_id) else {
                return false;
            };
            match task.status {
                TaskStatus::Queued => {
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(Utc::now());
                    task.error_message = Some(reason.to_string());
                    let snapshot = task.clone();
                    inner.queue.retain(|id| id != task_id);
                    Self::clear_task_timers(&mut inner, task_id);
                    (snapshot, None)
                }
                TaskStatus::Running => {
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(Utc::now());
                    task.error_message = Some(reason.to_string());
                    let worker_id = task.worker_id.clone();
                    let snapshot = task.clone();
                    Self::clear_task_timers(&mut inner, task_id);
                    (snapshot, worker_id)
                }
                _ => return false,
            }
        };

        info!(task_id, reason, "task cancelled");
        if let Some(worker_id) = &worker_id {
            match Envelope::from_payload(
                MessageKind::TaskCancel,
                &CancelPayload {
                    reason: Some(reason.to_string()),
                },
            ) {
                Ok(envelope) => {
                    self.registry
                        .send_to_worker(worker_id, envelope.with_task(task_id).with_worker(worker_id))
                        .await;
                }
                Err(error) => warn!(task_id, %error, "failed to encode cancel frame"),
            }
            self.registry.release(worker_id).await;
        }

        self.bus
            .publish(CoordinatorEvent::TaskCancelled { task: snapshot });
        self.schedule_dispatch();
        true
    }

    /// Fail whatever task the departed worker was running.
    pub async fn handle_worker_disconnect(&self, worker_id: &str) {
        let running = {
            let inner = self.inner.lock().await;
            inner
                .tasks
                .values()
                .find(|task| {
                    task.status == TaskStatus::Running
                        && task.worker_id.as_deref() == Some(worker_id)
                })
                .map(|task| task.id.clone())
        };
        if let Some(task_id) = running {
            self.fail_task(&task_id, &format!("worker {worker_id} disconnected"))
                .await;
        }
    }

    // -- Questions, permissions, team updates --------------------------------

    pub async fn handle_question(&self, task_id: &str, payload: Value) {
        self.bus.publish(CoordinatorEvent::TaskQuestion {
            task_id: task_id.to_string(),
            payload,
        });
    }

    pub async fn handle_permission(&self, task_id: &str, payload: Value) {
        self.bus.publish(CoordinatorEvent::TaskPermission {
            task_id: task_id.to_string(),
            payload,
        });
    }

    pub async fn handle_team_update(&self, worker_id: &str, payload: Value) {
        self.bus.publish(CoordinatorEvent::TeamUpdate {
            worker_id: worker_id.to_string(),
            payload,
        });
    }

    /// Route an answer back to the worker running the task.
    pub async fn answer(&self, task_id: &str, payload: AnswerPayload) -> bool {
        self.route_to_task_worker(task_id, MessageKind::TaskAnswer, &payload)
            .await
    }

    /// Route a permission decision back to the worker running the task.
    pub async fn respond_permission(
        &self,
        task_id: &str,
        payload: PermissionResponsePayload,
    ) -> bool {
        self.route_to_task_worker(task_id, MessageKind::TaskPermissionResponse, &payload)
            .await
    }

    async fn route_to_task_worker<T: serde::Serialize>(
        &self,
        task_id: &str,
        kind: MessageKind,
        payload: &T,
    ) -> bool {
        let worker_id = {
            let inner = self.inner.lock().await;
            inner.tasks.get(task_id).and_then(|task| task.worker_id.clone())
        };
        let Some(worker_id) = worker_id else {
            return false;
        };
        let Ok(envelope) = Envelope::from_payload(kind, payload) else {
            return false;
        };
        self.registry
            .send_to_worker(&worker_id, envelope.with_task(task_id).with_worker(&worker_id))
            .await
    }

    // -- Queries ------------------------------------------------------------

    pub async fn task(&self, task_id: &str) -> Option<Task> {
        let inner = self.inner.lock().await;
        inner.tasks.get(task_id).cloned()
    }

    pub async fn tasks(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        inner.tasks.values().cloned().collect()
    }

    pub async fn queue_len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.queue.len()
    }

    /// Most recent continuation session for a `(worker, cwd)` tuple.
    pub async fn session_for(
        &self,
        worker_id: Option<&str>,
        cwd: Option<&str>,
    ) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .iter()
            .rev()
            .find(|record| {
                record.worker_id.as_deref() == worker_id && record.cwd.as_deref() == cwd
            })
            .map(|record| record.session_id.clone())
    }

    // -- Internals ----------------------------------------------------------

    /// Arm the per-task timeout; expiry self-cancels with reason "timeout".
    fn arm_timeout(&self, inner: &mut ManagerInner, task_id: &str) {
        let manager = self.weak.clone();
        let id = task_id.to_string();
        let timeout = self.tuning.task_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                warn!(task_id = %id, "task timeout expired");
                manager.cancel_task(&id, "timeout").await;
            }
        });
        inner
            .timers
            .entry(task_id.to_string())
            .or_default()
            .insert(TimerPurpose::Timeout, handle);
    }

    fn clear_task_timers(inner: &mut ManagerInner, task_id: &str) {
        if let Some(timers) = inner.timers.remove(task_id) {
            for (_, handle) in timers {
                handle.abort();
            }
        }
        inner.last_update.remove(task_id);
    }

    /// Common tail of a worker-reported terminal transition.
    async fn release_and_publish(&self, task: Task, completed: bool) {
        if let Some(worker_id) = task.worker_id.clone() {
            self.registry.release(&worker_id).await;
        }
        let event = if completed {
            CoordinatorEvent::TaskCompleted { task }
        } else {
            CoordinatorEvent::TaskFailed { task }
        };
        self.bus.publish(event);
        self.schedule_dispatch();
    }

    fn schedule_dispatch(&self) {
        let manager = self.weak.clone();
        tokio::spawn(async move {
            if let Some(manager) = manager.upgrade() {
                manager.dispatch_next().await;
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
