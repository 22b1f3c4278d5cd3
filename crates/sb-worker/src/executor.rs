//! Spawns and supervises the assistant CLI for one task at a time.
//!
//! The CLI runs as a one-shot: stdin is closed right after spawn, stdout is
//! fed through the stream parser, stderr is kept in a bounded buffer for
//! error reporting. Termination is two-stage (SIGTERM, then SIGKILL after a
//! grace period) and exit is only classified after both stdio streams have
//! drained, so trailing stderr is never lost.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sb_core::config::WorkerConfig;
use sb_core::limits::{KILL_GRACE_MS, TASK_TIMEOUT_MS};
use sb_core::types::{Attachment, PermissionMode, TokenUsage};
use sb_protocol::payload::AssignPayload;
use sb_protocol::StreamEvent;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::parser::StreamParser;

/// Program name of the assistant CLI on the worker's PATH.
pub const ASSISTANT_CLI: &str = "claude";

/// Environment variables with this prefix are stripped before spawn so the
/// child never inherits state from a parent assistant session.
const STRIPPED_ENV_PREFIX: &str = "CLAUDE";

const STDERR_CAP: usize = 16 * 1024;
const IO_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("working directory {0} does not exist")]
    MissingCwd(String),
    #[error("working directory {0} is not allowed on this worker")]
    DirectoryNotAllowed(String),
    #[error("failed to spawn assistant CLI: {0}")]
    Spawn(String),
}

impl ExecutorError {
    /// Wire error code carried in `task:error`.
    pub fn code(&self) -> &'static str {
        match self {
            ExecutorError::MissingCwd(_) | ExecutorError::Spawn(_) => "SPAWN_ERROR",
            ExecutorError::DirectoryNotAllowed(_) => "DIRECTORY_NOT_ALLOWED",
        }
    }
}

// ---------------------------------------------------------------------------
// Exit classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    Code(i32),
    Signal(String),
}

impl ExitKind {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitKind::Code(0))
    }

    /// Wire error code for an abnormal exit: `EXIT_<n>` or `EXIT_<signal>`.
    pub fn error_code(&self) -> String {
        match self {
            ExitKind::Code(code) => format!("EXIT_{code}"),
            ExitKind::Signal(signal) => format!("EXIT_{signal}"),
        }
    }
}

fn exit_kind(status: std::process::ExitStatus) -> ExitKind {
    if let Some(code) = status.code() {
        return ExitKind::Code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitKind::Signal(signal_name(signal));
        }
    }
    ExitKind::Code(-1)
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        other => format!("SIG{other}"),
    }
}

// ---------------------------------------------------------------------------
// CliSpawner trait (for testability)
// ---------------------------------------------------------------------------

/// What to run; the spawner decides how.
#[derive(Debug, Clone)]
pub struct CliInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Requests termination of a running CLI process. Cloneable so the runner
/// can cancel from outside the supervising loop.
#[derive(Clone)]
pub struct KillHandle(Arc<std::sync::Mutex<Option<oneshot::Sender<()>>>>);

impl KillHandle {
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self(Arc::new(std::sync::Mutex::new(Some(tx))))
    }

    /// Idempotent; later calls are no-ops.
    pub fn kill(&self) {
        // An Option<Sender> stays structurally sound even if a holder
        // panicked, so recover the guard rather than propagate the poison.
        let mut slot = self
            .0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tx) = slot.take() {
            let _ = tx.send(());
        }
    }
}

/// A running CLI child, abstracted to channels so tests can fake one.
pub struct CliProcess {
    pub stdout: mpsc::Receiver<Vec<u8>>,
    pub stderr: mpsc::Receiver<Vec<u8>>,
    pub exit: oneshot::Receiver<ExitKind>,
    pub kill: KillHandle,
}

/// Abstraction over process spawning so tests can inject a mock.
#[async_trait]
pub trait CliSpawner: Send + Sync {
    fn spawn(&self, invocation: CliInvocation) -> Result<CliProcess, ExecutorError>;
}

// ---------------------------------------------------------------------------
// TokioCliSpawner
// ---------------------------------------------------------------------------

/// Real spawner backed by `tokio::process`.
pub struct TokioCliSpawner;

#[async_trait]
impl CliSpawner for TokioCliSpawner {
    fn spawn(&self, invocation: CliInvocation) -> Result<CliProcess, ExecutorError> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, _) in std::env::vars() {
            if key.starts_with(STRIPPED_ENV_PREFIX) {
                command.env_remove(&key);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| ExecutorError::Spawn(e.to_string()))?;

        // One-shot contract: the CLI must not wait for interactive input.
        drop(child.stdin.take());

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdout_tx, stdout_rx) = mpsc::channel(IO_CHANNEL_CAPACITY);
        let (stderr_tx, stderr_rx) = mpsc::channel(IO_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        if let Some(stdout) = stdout {
            tokio::spawn(pump(stdout, stdout_tx));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(pump(stderr, stderr_tx));
        }
        tokio::spawn(supervise(child, kill_rx, exit_tx));

        Ok(CliProcess {
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit: exit_rx,
            kill: KillHandle::new(kill_tx),
        })
    }
}

/// Copy a child stream into a channel until EOF.
async fn pump<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Wait for the child, honouring a kill request with the two-stage
/// SIGTERM/SIGKILL sequence.
async fn supervise(
    mut child: tokio::process::Child,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<ExitKind>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        requested = &mut kill_rx => {
            if requested.is_ok() {
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                match tokio::time::timeout(Duration::from_millis(KILL_GRACE_MS), child.wait()).await
                {
                    Ok(status) => status,
                    Err(_) => {
                        let _ = child.kill().await;
                        child.wait().await
                    }
                }
            } else {
                child.wait().await
            }
        }
    };

    let kind = match status {
        Ok(status) => exit_kind(status),
        Err(error) => {
            warn!(%error, "failed to reap assistant CLI");
            ExitKind::Code(-1)
        }
    };
    let _ = exit_tx.send(kind);
}

// ---------------------------------------------------------------------------
// Argument and prompt assembly
// ---------------------------------------------------------------------------

/// CLI argument vector for one task.
pub fn build_cli_args(
    prompt: &str,
    permission_mode: PermissionMode,
    session_id: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        prompt.to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];
    if permission_mode == PermissionMode::Auto {
        args.push("--dangerouslySkipPermissions".to_string());
    }
    if let Some(session_id) = session_id {
        args.push("--resume".to_string());
        args.push(session_id.to_string());
    }
    args
}

/// Append attachment references to the prompt after a blank line.
///
/// Attachments that never made it to local disk are referenced by their
/// source URL so the assistant still knows about them.
pub fn build_prompt(prompt: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return prompt.to_string();
    }
    let mut out = String::from(prompt);
    out.push('\n');
    for attachment in attachments {
        let reference = attachment
            .local_path
            .as_deref()
            .unwrap_or(attachment.source_url.as_str());
        out.push('\n');
        out.push_str("[Attached file: ");
        out.push_str(reference);
        out.push(']');
    }
    out
}

// ---------------------------------------------------------------------------
// Task temp directory
// ---------------------------------------------------------------------------

/// Scratch directory for one task's attachments.
pub fn task_dir(task_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("switchboard-{task_id}"))
}

/// Write one transferred attachment into the task's scratch directory.
pub async fn write_attachment(
    task_id: &str,
    file_name: &str,
    bytes: &[u8],
) -> std::io::Result<PathBuf> {
    if file_name.contains('/') || file_name.contains('\\') || file_name.contains('\0') {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid attachment file name {file_name:?}"),
        ));
    }
    let dir = task_dir(task_id);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(file_name);
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

/// Remove the task's scratch directory; called on every terminal outcome.
pub async fn cleanup_task_dir(task_id: &str) {
    let dir = task_dir(task_id);
    if let Err(error) = tokio::fs::remove_dir_all(&dir).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            debug!(%error, path = %dir.display(), "failed to remove task scratch dir");
        }
    }
}

// ---------------------------------------------------------------------------
// TaskExecutor
// ---------------------------------------------------------------------------

/// Everything the worker learned from one CLI run.
#[derive(Debug)]
pub struct ExecutionReport {
    /// Text of the last `result` event, if any.
    pub result_text: String,
    pub session_id: Option<String>,
    /// Last cumulative usage reported on the stream.
    pub usage: TokenUsage,
    /// Last protocol-level error message seen on the stream.
    pub error_message: Option<String>,
    /// Bounded stderr capture; the fallback error message.
    pub stderr: String,
    pub exit: ExitKind,
    pub timed_out: bool,
}

/// Runs the assistant CLI for assigned tasks and supervises the child.
pub struct TaskExecutor {
    spawner: Arc<dyn CliSpawner>,
    config: Arc<WorkerConfig>,
    timeout: Duration,
    /// Kill handles for in-flight tasks, keyed by task id.
    active: Mutex<HashMap<String, KillHandle>>,
}

impl TaskExecutor {
    pub fn new(config: Arc<WorkerConfig>) -> Self {
        Self::with_spawner(Arc::new(TokioCliSpawner), config)
    }

    /// Custom spawner, used by tests.
    pub fn with_spawner(spawner: Arc<dyn CliSpawner>, config: Arc<WorkerConfig>) -> Self {
        Self {
            spawner,
            config,
            timeout: Duration::from_millis(TASK_TIMEOUT_MS),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Override the safety-net timeout; tests use short values.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Kill the CLI for a task, if it is still running.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let active = self.active.lock().await;
        match active.get(task_id) {
            Some(handle) => {
                info!(task_id, "killing assistant CLI on cancel");
                handle.kill();
                true
            }
            None => false,
        }
    }

    /// Run the CLI for one assignment, forwarding parsed stream events as
    /// they arrive, and return the final report.
    pub async fn run(
        &self,
        task_id: &str,
        assign: &AssignPayload,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<ExecutionReport, ExecutorError> {
        let cwd = assign
            .cwd
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.default_cwd.clone());

        if !self.config.is_dir_allowed(&cwd) {
            return Err(ExecutorError::DirectoryNotAllowed(cwd.display().to_string()));
        }
        if !dir_exists(&cwd).await {
            return Err(ExecutorError::MissingCwd(cwd.display().to_string()));
        }

        let prompt = build_prompt(&assign.prompt, &assign.attachments);
        let invocation = CliInvocation {
            program: ASSISTANT_CLI.to_string(),
            args: build_cli_args(&prompt, assign.permission_mode, assign.session_id.as_deref()),
            cwd,
        };

        info!(
            task_id,
            resume = assign.session_id.is_some(),
            attachments = assign.attachments.len(),
            "spawning assistant CLI"
        );
        let mut process = self.spawner.spawn(invocation)?;

        {
            let mut active = self.active.lock().await;
            active.insert(task_id.to_string(), process.kill.clone());
        }

        let report = self.collect(task_id, &mut process, events).await;

        {
            let mut active = self.active.lock().await;
            active.remove(task_id);
        }

        Ok(report)
    }

    /// Drain stdout/stderr to EOF, then classify the exit.
    async fn collect(
        &self,
        task_id: &str,
        process: &mut CliProcess,
        events: mpsc::Sender<StreamEvent>,
    ) -> ExecutionReport {
        let mut parser = StreamParser::new();
        let mut report = ExecutionReport {
            result_text: String::new(),
            session_id: None,
            usage: TokenUsage::default(),
            error_message: None,
            stderr: String::new(),
            exit: ExitKind::Code(-1),
            timed_out: false,
        };

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                _ = &mut deadline, if !report.timed_out => {
                    warn!(task_id, timeout_ms = self.timeout.as_millis() as u64, "task timed out, killing CLI");
                    report.timed_out = true;
                    process.kill.kill();
                }
                chunk = process.stdout.recv(), if stdout_open => {
                    match chunk {
                        Some(bytes) => {
                            let text = String::from_utf8_lossy(&bytes);
                            for event in parser.parse(&text) {
                                self.absorb(&mut report, &event);
                                if events.send(event).await.is_err() {
                                    debug!(task_id, "event receiver dropped");
                                }
                            }
                        }
                        None => stdout_open = false,
                    }
                }
                chunk = process.stderr.recv(), if stderr_open => {
                    match chunk {
                        Some(bytes) => {
                            let remaining = STDERR_CAP.saturating_sub(report.stderr.len());
                            if remaining > 0 {
                                let text = String::from_utf8_lossy(&bytes);
                                let take = remaining.min(text.len());
                                report.stderr.push_str(&text[..floor_char_boundary(&text, take)]);
                            }
                        }
                        None => stderr_open = false,
                    }
                }
            }
        }

        report.exit = match (&mut process.exit).await {
            Ok(kind) => kind,
            Err(_) => ExitKind::Code(-1),
        };
        info!(task_id, exit = ?report.exit, timed_out = report.timed_out, "assistant CLI finished");
        report
    }

    /// Track the last result, usage, and error seen on the stream.
    fn absorb(&self, report: &mut ExecutionReport, event: &StreamEvent) {
        match event {
            StreamEvent::Result { text, session_id } => {
                report.result_text = text.clone();
                if session_id.is_some() {
                    report.session_id = session_id.clone();
                }
            }
            StreamEvent::TokenUsage { usage } => report.usage = *usage,
            StreamEvent::Error { message } => report.error_message = Some(message.clone()),
            _ => {}
        }
    }
}

async fn dir_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// Largest byte index `<= max` that lands on a char boundary.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut index = max;
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
