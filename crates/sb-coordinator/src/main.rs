//! Coordinator binary: loads env configuration, starts the transport
//! server, and logs task lifecycle events for operators.

use anyhow::{Context, Result};
use sb_coordinator::events::CoordinatorEvent;
use sb_coordinator::Coordinator;
use sb_core::config::CoordinatorConfig;
use sb_core::limits::PROMPT_PREVIEW_CHARS;
use sb_core::text::truncate_chars;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    sb_telemetry::logging::init_logging("sb-coordinator", "info");

    let config =
        CoordinatorConfig::from_env().context("failed to load coordinator configuration")?;
    let coordinator = Coordinator::new(config.shared_secret.clone());

    // Operator-facing status log; the chat adapter subscribes the same way.
    let events = coordinator.bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            match event {
                CoordinatorEvent::TaskQueued { task } => {
                    info!(
                        task_id = %task.id,
                        prompt = %truncate_chars(&task.prompt, PROMPT_PREVIEW_CHARS),
                        "queued"
                    );
                }
                CoordinatorEvent::TaskStarted { task } => {
                    info!(task_id = %task.id, worker = %task.worker_id.as_deref().unwrap_or("-"), "started");
                }
                CoordinatorEvent::TaskCompleted { task } => {
                    info!(task_id = %task.id, tokens_in = task.usage.input, tokens_out = task.usage.output, "completed");
                }
                CoordinatorEvent::TaskFailed { task } => {
                    info!(task_id = %task.id, error = %task.error_message.as_deref().unwrap_or("-"), "failed");
                }
                CoordinatorEvent::TaskCancelled { task } => {
                    info!(task_id = %task.id, "cancelled");
                }
                CoordinatorEvent::WorkerConnected { worker } => {
                    info!(worker = %worker.name, os = %worker.os, "worker connected");
                }
                CoordinatorEvent::WorkerDisconnected { worker_id, had_running_task } => {
                    info!(worker = %worker_id, had_running_task, "worker disconnected");
                }
                _ => {}
            }
        }
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "switchboard coordinator listening");

    let app = coordinator.router();
    tokio::select! {
        result = axum::serve(listener, app) => result.context("transport server failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            Ok(())
        }
    }
}
