//! Maps control-plane frames to executor work and executor outcomes back to
//! control-plane frames.
//!
//! A worker holds at most one running task; the runner enforces that and
//! owns the terminal bookkeeping (scratch-dir cleanup, current-task state).

use std::sync::Arc;

use base64::Engine;
use sb_core::config::WorkerConfig;
use sb_core::types::WorkerStatus;
use sb_protocol::payload::{
    AnswerPayload, AssignPayload, CompletePayload, FileTransferAckPayload, FileTransferPayload,
    PermissionResponsePayload, QuestionPayload, TaskErrorPayload,
};
use sb_protocol::{Envelope, MessageKind, StreamEvent};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::executor::{self, TaskExecutor};

/// Drives one assignment at a time through the executor.
#[derive(Clone)]
pub struct TaskRunner {
    config: Arc<WorkerConfig>,
    executor: Arc<TaskExecutor>,
    outbound: mpsc::Sender<Envelope>,
    current: Arc<Mutex<Option<String>>>,
}

impl TaskRunner {
    pub fn new(
        config: Arc<WorkerConfig>,
        executor: Arc<TaskExecutor>,
        outbound: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            config,
            executor,
            outbound,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Status pair reported in heartbeats.
    pub async fn status(&self) -> (WorkerStatus, Option<String>) {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(task_id) => (WorkerStatus::Busy, Some(task_id.clone())),
            None => (WorkerStatus::Online, None),
        }
    }

    /// `task:assign` -- start the CLI for a task, or refuse when busy.
    pub async fn handle_assign(&self, envelope: &Envelope) {
        let Some(task_id) = envelope.task_id.clone() else {
            warn!("dropping task:assign without taskId");
            return;
        };
        let assign: AssignPayload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "dropping malformed task:assign");
                return;
            }
        };

        {
            let mut current = self.current.lock().await;
            if let Some(running) = current.as_ref() {
                warn!(task_id, running, "refusing assignment while busy");
                self.send_error(
                    &task_id,
                    TaskErrorPayload {
                        code: "SPAWN_ERROR".to_string(),
                        message: format!("worker is already running {running}"),
                        result_text: None,
                        usage: Default::default(),
                    },
                )
                .await;
                return;
            }
            *current = Some(task_id.clone());
        }

        let runner = self.clone();
        tokio::spawn(async move {
            runner.execute(task_id, assign).await;
        });
    }

    async fn execute(&self, task_id: String, assign: AssignPayload) {
        info!(task_id, "starting assigned task");

        let (event_tx, mut event_rx) = mpsc::channel::<StreamEvent>(256);

        // Relay parsed events upstream while the CLI runs.
        let relay = {
            let runner = self.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    runner.relay_event(&task_id, event).await;
                }
            })
        };

        let outcome = self.executor.run(&task_id, &assign, event_tx).await;
        let _ = relay.await;

        match outcome {
            Ok(report) => {
                if report.timed_out {
                    self.send_error(
                        &task_id,
                        TaskErrorPayload {
                            code: "TIMEOUT".to_string(),
                            message: "task timed out".to_string(),
                            result_text: non_empty(report.result_text),
                            usage: report.usage,
                        },
                    )
                    .await;
                } else if report.exit.is_success() {
                    match Envelope::from_payload(
                        MessageKind::TaskComplete,
                        &CompletePayload {
                            result_text: report.result_text,
                            session_id: report.session_id,
                            usage: report.usage,
                        },
                    ) {
                        Ok(envelope) => {
                            self.send(
                                envelope.with_task(&task_id).with_worker(&self.config.name),
                            )
                            .await;
                        }
                        Err(error) => {
                            warn!(task_id, %error, "failed to encode completion frame");
                        }
                    }
                } else {
                    let message = report
                        .error_message
                        .or_else(|| non_empty(report.stderr))
                        .unwrap_or_else(|| "assistant CLI exited abnormally".to_string());
                    self.send_error(
                        &task_id,
                        TaskErrorPayload {
                            code: report.exit.error_code(),
                            message,
                            result_text: non_empty(report.result_text),
                            usage: report.usage,
                        },
                    )
                    .await;
                }
            }
            Err(error) => {
                self.send_error(
                    &task_id,
                    TaskErrorPayload {
                        code: error.code().to_string(),
                        message: error.to_string(),
                        result_text: None,
                        usage: Default::default(),
                    },
                )
                .await;
            }
        }

        executor::cleanup_task_dir(&task_id).await;
        let mut current = self.current.lock().await;
        if current.as_deref() == Some(task_id.as_str()) {
            *current = None;
        }
    }

    /// Forward one stream event; an assistant question additionally raises
    /// the out-of-band `task:question` flow.
    async fn relay_event(&self, task_id: &str, event: StreamEvent) {
        if let StreamEvent::ToolUseBegin { tool, summary } = &event {
            if tool == "AskUserQuestion" {
                let question = QuestionPayload {
                    question_id: uuid::Uuid::new_v4().to_string(),
                    body: serde_json::json!({ "question": summary }),
                };
                if let Ok(envelope) = Envelope::from_payload(MessageKind::TaskQuestion, &question) {
                    self.send(envelope.with_task(task_id).with_worker(&self.config.name))
                        .await;
                }
            }
        }

        if let Ok(envelope) = Envelope::from_payload(MessageKind::TaskStream, &event) {
            self.send(envelope.with_task(task_id).with_worker(&self.config.name))
                .await;
        }
    }

    /// `task:cancel` -- kill the CLI; the abnormal exit produces the
    /// follow-up `task:error`, which the coordinator drops for an already
    /// cancelled task.
    pub async fn handle_cancel(&self, envelope: &Envelope) {
        let Some(task_id) = envelope.task_id.as_deref() else {
            warn!("dropping task:cancel without taskId");
            return;
        };
        if !self.executor.cancel(task_id).await {
            info!(task_id, "cancel for task with no running CLI");
        }
    }

    /// `file:transfer` -- materialise an attachment before its assignment.
    pub async fn handle_file_transfer(&self, envelope: &Envelope) {
        let Some(task_id) = envelope.task_id.clone() else {
            warn!("dropping file:transfer without taskId");
            return;
        };
        let transfer: FileTransferPayload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "dropping malformed file:transfer");
                return;
            }
        };

        let ack = match base64::engine::general_purpose::STANDARD.decode(&transfer.data) {
            Ok(bytes) => match executor::write_attachment(&task_id, &transfer.file_name, &bytes).await
            {
                Ok(path) => FileTransferAckPayload {
                    file_name: transfer.file_name,
                    success: true,
                    local_path: Some(path.display().to_string()),
                    message: None,
                },
                Err(error) => FileTransferAckPayload {
                    file_name: transfer.file_name,
                    success: false,
                    local_path: None,
                    message: Some(error.to_string()),
                },
            },
            Err(error) => FileTransferAckPayload {
                file_name: transfer.file_name,
                success: false,
                local_path: None,
                message: Some(format!("invalid base64 payload: {error}")),
            },
        };

        if let Ok(envelope) = Envelope::from_payload(MessageKind::FileTransferAck, &ack) {
            self.send(envelope.with_task(&task_id).with_worker(&self.config.name))
                .await;
        }
    }

    /// `task:answer` -- the CLI runs with stdin closed, so answers reach the
    /// assistant through a session-continuation follow-up task; nothing to
    /// write here.
    pub async fn handle_answer(&self, envelope: &Envelope) {
        match envelope.payload_as::<AnswerPayload>() {
            Ok(answer) => {
                info!(
                    task_id = envelope.task_id.as_deref().unwrap_or("-"),
                    question_id = %answer.question_id,
                    "answer received; reply travels via session continuation"
                );
            }
            Err(error) => warn!(%error, "dropping malformed task:answer"),
        }
    }

    /// `task:permission_response` -- same stdin-closed contract as answers.
    pub async fn handle_permission_response(&self, envelope: &Envelope) {
        match envelope.payload_as::<PermissionResponsePayload>() {
            Ok(response) => {
                info!(
                    task_id = envelope.task_id.as_deref().unwrap_or("-"),
                    request_id = %response.request_id,
                    approve = response.approve,
                    "permission response received"
                );
            }
            Err(error) => warn!(%error, "dropping malformed task:permission_response"),
        }
    }

    async fn send_error(&self, task_id: &str, payload: TaskErrorPayload) {
        if let Ok(envelope) = Envelope::from_payload(MessageKind::TaskError, &payload) {
            self.send(envelope.with_task(task_id).with_worker(&self.config.name))
                .await;
        }
    }

    async fn send(&self, envelope: Envelope) {
        if self.outbound.send(envelope).await.is_err() {
            warn!("outbound channel closed; frame dropped");
        }
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CliInvocation, CliProcess, CliSpawner, ExecutorError, ExitKind, KillHandle};
    use async_trait::async_trait;
    use sb_core::types::PermissionMode;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::oneshot;

    struct ScriptedSpawner {
        stdout: Vec<u8>,
        exit: ExitKind,
    }

    #[async_trait]
    impl CliSpawner for ScriptedSpawner {
        fn spawn(&self, _invocation: CliInvocation) -> Result<CliProcess, ExecutorError> {
            let (stdout_tx, stdout_rx) = mpsc::channel(64);
            let (_stderr_tx, stderr_rx) = mpsc::channel(64);
            let (exit_tx, exit_rx) = oneshot::channel();
            let (kill_tx, _kill_rx) = oneshot::channel();

            let stdout = self.stdout.clone();
            let exit = self.exit.clone();
            tokio::spawn(async move {
                let _ = stdout_tx.send(stdout).await;
                drop(stdout_tx);
                let _ = exit_tx.send(exit);
            });

            Ok(CliProcess {
                stdout: stdout_rx,
                stderr: stderr_rx,
                exit: exit_rx,
                kill: KillHandle::new(kill_tx),
            })
        }
    }

    fn test_config() -> Arc<WorkerConfig> {
        let cwd = std::env::temp_dir();
        let vars: HashMap<String, String> = [
            ("SWITCHBOARD_URL", "ws://localhost:9740/ws"),
            ("SWITCHBOARD_SHARED_SECRET", "s3cret"),
            ("SWITCHBOARD_WORKER_NAME", "w1"),
            ("SWITCHBOARD_DEFAULT_CWD", cwd.to_str().unwrap()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Arc::new(WorkerConfig::from_lookup(|k| vars.get(k).cloned()).unwrap())
    }

    fn runner_with(
        stdout: &str,
        exit: ExitKind,
    ) -> (TaskRunner, mpsc::Receiver<Envelope>) {
        let config = test_config();
        let spawner = Arc::new(ScriptedSpawner {
            stdout: stdout.as_bytes().to_vec(),
            exit,
        });
        let executor = Arc::new(TaskExecutor::with_spawner(spawner, Arc::clone(&config)));
        let (tx, rx) = mpsc::channel(256);
        (TaskRunner::new(config, executor, tx), rx)
    }

    fn assign_envelope(task_id: &str) -> Envelope {
        Envelope::from_payload(
            MessageKind::TaskAssign,
            &AssignPayload {
                prompt: "hello".into(),
                cwd: None,
                permission_mode: PermissionMode::Confirm,
                team_mode: false,
                session_id: None,
                attachments: vec![],
            },
        )
        .unwrap()
        .with_task(task_id)
    }

    async fn drain_until(
        rx: &mut mpsc::Receiver<Envelope>,
        kind: MessageKind,
    ) -> (Vec<Envelope>, Envelope) {
        let mut seen = Vec::new();
        loop {
            let envelope = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("channel closed");
            if envelope.kind == kind {
                return (seen, envelope);
            }
            seen.push(envelope);
        }
    }

    #[tokio::test]
    async fn successful_run_emits_streams_then_complete() {
        let stream = concat!(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hi"}]}}"#,
            "\n",
            r#"{"type":"result","result":"Hi","session_id":"s1","usage":{"input_tokens":10,"output_tokens":2}}"#,
            "\n"
        );
        let (runner, mut rx) = runner_with(stream, ExitKind::Code(0));

        runner.handle_assign(&assign_envelope("task-1")).await;

        let (streams, complete) = drain_until(&mut rx, MessageKind::TaskComplete).await;
        assert!(streams.iter().all(|e| e.kind == MessageKind::TaskStream));
        assert_eq!(streams.len(), 3);

        let payload: CompletePayload = complete.payload_as().unwrap();
        assert_eq!(payload.result_text, "Hi");
        assert_eq!(payload.session_id.as_deref(), Some("s1"));
        assert_eq!(payload.usage.input, 10);
        assert_eq!(complete.task_id.as_deref(), Some("task-1"));
        assert_eq!(complete.worker_id.as_deref(), Some("w1"));

        let (status, current) = runner.status().await;
        assert_eq!(status, WorkerStatus::Online);
        assert!(current.is_none());
    }

    #[tokio::test]
    async fn abnormal_exit_emits_error_with_exit_code() {
        let (runner, mut rx) = runner_with("", ExitKind::Code(3));
        runner.handle_assign(&assign_envelope("task-2")).await;

        let (_, error) = drain_until(&mut rx, MessageKind::TaskError).await;
        let payload: TaskErrorPayload = error.payload_as().unwrap();
        assert_eq!(payload.code, "EXIT_3");
    }

    #[tokio::test]
    async fn busy_worker_refuses_second_assignment() {
        let (runner, mut rx) = runner_with("", ExitKind::Code(0));

        // Claim the slot directly, then assign.
        *runner.current.lock().await = Some("task-a".into());
        runner.handle_assign(&assign_envelope("task-b")).await;

        let (_, error) = drain_until(&mut rx, MessageKind::TaskError).await;
        assert_eq!(error.task_id.as_deref(), Some("task-b"));
        let payload: TaskErrorPayload = error.payload_as().unwrap();
        assert_eq!(payload.code, "SPAWN_ERROR");
        assert!(payload.message.contains("task-a"));
    }

    #[tokio::test]
    async fn ask_user_event_raises_task_question() {
        let stream = concat!(
            r#"{"type":"ask_user","question":"Deploy?"}"#,
            "\n",
            r#"{"type":"result","result":"done"}"#,
            "\n"
        );
        let (runner, mut rx) = runner_with(stream, ExitKind::Code(0));
        runner.handle_assign(&assign_envelope("task-3")).await;

        let (before, _complete) = drain_until(&mut rx, MessageKind::TaskComplete).await;
        let question = before
            .iter()
            .find(|e| e.kind == MessageKind::TaskQuestion)
            .expect("expected a task:question frame");
        let payload: QuestionPayload = question.payload_as().unwrap();
        assert_eq!(payload.body["question"], json!("Deploy?"));
    }

    #[tokio::test]
    async fn file_transfer_writes_and_acks_with_local_path() {
        let (runner, mut rx) = runner_with("", ExitKind::Code(0));

        let data = base64::engine::general_purpose::STANDARD.encode(b"file body");
        let envelope = Envelope::from_payload(
            MessageKind::FileTransfer,
            &FileTransferPayload {
                file_name: "input.txt".into(),
                mime: "text/plain".into(),
                data,
            },
        )
        .unwrap()
        .with_task("task-ft");

        runner.handle_file_transfer(&envelope).await;

        let (_, ack) = drain_until(&mut rx, MessageKind::FileTransferAck).await;
        let payload: FileTransferAckPayload = ack.payload_as().unwrap();
        assert!(payload.success);
        let path = payload.local_path.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"file body");

        executor::cleanup_task_dir("task-ft").await;
    }

    #[tokio::test]
    async fn file_transfer_rejects_bad_base64() {
        let (runner, mut rx) = runner_with("", ExitKind::Code(0));

        let envelope = Envelope::from_payload(
            MessageKind::FileTransfer,
            &FileTransferPayload {
                file_name: "input.txt".into(),
                mime: "text/plain".into(),
                data: "not base64!!!".into(),
            },
        )
        .unwrap()
        .with_task("task-ft2");

        runner.handle_file_transfer(&envelope).await;

        let (_, ack) = drain_until(&mut rx, MessageKind::FileTransferAck).await;
        let payload: FileTransferAckPayload = ack.payload_as().unwrap();
        assert!(!payload.success);
        assert!(payload.local_path.is_none());
    }
}
