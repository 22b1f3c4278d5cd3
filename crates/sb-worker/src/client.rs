//! WebSocket client that keeps a worker attached to its coordinator.
//!
//! Every (re)connect runs the register handshake from scratch; anything in
//! flight when the link drops is considered lost, because the coordinator
//! fails the running task on disconnect.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use sb_core::config::WorkerConfig;
use sb_core::limits::{
    AUTH_DEADLINE_MS, HEARTBEAT_INTERVAL_MS, RECONNECT_BASE_MS, RECONNECT_CAP_MS, RECONNECT_JITTER,
};
use sb_protocol::payload::{HeartbeatPayload, RegisterAckPayload, RegisterPayload};
use sb_protocol::{Envelope, MessageKind, PROTOCOL_VERSION};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::executor::TaskExecutor;
use crate::runner::TaskRunner;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff with a fixed jitter factor applied; the factor is
/// split out so tests can pin it.
pub fn backoff_with_factor(attempt: u32, jitter_factor: f64) -> Duration {
    let exp = RECONNECT_BASE_MS
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(RECONNECT_CAP_MS);
    Duration::from_millis((exp as f64 * jitter_factor).round() as u64)
}

/// Delay before reconnect attempt `attempt` (0-based), with ±20% jitter.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(-RECONNECT_JITTER..=RECONNECT_JITTER);
    backoff_with_factor(attempt, 1.0 + jitter)
}

// ---------------------------------------------------------------------------
// WorkerClient
// ---------------------------------------------------------------------------

pub struct WorkerClient {
    config: Arc<WorkerConfig>,
    runner: TaskRunner,
    outbound_rx: mpsc::Receiver<Envelope>,
}

impl WorkerClient {
    pub fn new(config: WorkerConfig) -> Self {
        let config = Arc::new(config);
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let executor = Arc::new(TaskExecutor::new(Arc::clone(&config)));
        let runner = TaskRunner::new(Arc::clone(&config), executor, outbound_tx);
        Self {
            config,
            runner,
            outbound_rx,
        }
    }

    /// Connect, serve, and reconnect forever.
    pub async fn run(mut self) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            match self.session().await {
                Ok(()) => {
                    info!("connection to coordinator closed");
                    attempt = 0;
                }
                Err(error) => {
                    warn!(%error, "coordinator session failed");
                }
            }

            let delay = reconnect_delay(attempt);
            attempt = attempt.saturating_add(1);
            info!(delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    /// One connected session: handshake, then serve until the link drops.
    async fn session(&mut self) -> Result<()> {
        info!(url = %self.config.coordinator_url, "connecting to coordinator");
        let (ws, _) = tokio_tungstenite::connect_async(&self.config.coordinator_url)
            .await
            .context("WebSocket connect failed")?;
        let (mut write, mut read) = ws.split();

        let register = RegisterPayload {
            secret: self.config.shared_secret.clone(),
            name: self.config.name.clone(),
            os: std::env::consts::OS.to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            cli_version: String::new(),
            default_cwd: self.config.default_cwd.display().to_string(),
            allowed_dirs: self
                .config
                .allowed_dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        let frame = Envelope::from_payload(MessageKind::WorkerRegister, &register)?
            .with_worker(&self.config.name)
            .encode()?;
        write.send(Message::Text(frame)).await?;

        let ack = tokio::time::timeout(Duration::from_millis(AUTH_DEADLINE_MS), async {
            while let Some(frame) = read.next().await {
                if let Message::Text(text) = frame? {
                    match Envelope::decode(&text) {
                        Ok(envelope) if envelope.kind == MessageKind::WorkerRegisterAck => {
                            return Ok(envelope.payload_as::<RegisterAckPayload>()?);
                        }
                        Ok(envelope) => {
                            debug!(kind = %envelope.kind, "frame before register ack, ignoring");
                        }
                        Err(error) => warn!(%error, "dropping malformed frame"),
                    }
                }
            }
            bail!("connection closed during registration")
        })
        .await
        .context("registration timed out")??;

        if !ack.success {
            bail!(
                "registration rejected: {}",
                ack.message.as_deref().unwrap_or("no reason given")
            );
        }
        if let Some(message) = ack.message.as_deref() {
            // Non-fatal notes, e.g. a protocol version mismatch warning.
            info!(message, "registered with coordinator");
        } else {
            info!("registered with coordinator");
        }

        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                outbound = self.outbound_rx.recv() => {
                    match outbound {
                        Some(envelope) => {
                            let text = envelope.encode()?;
                            if write.send(Message::Text(text)).await.is_err() {
                                return Ok(());
                            }
                        }
                        None => bail!("runner outbound channel closed"),
                    }
                }

                _ = heartbeat.tick() => {
                    let (status, current_task_id) = self.runner.status().await;
                    let envelope = Envelope::from_payload(
                        MessageKind::WorkerHeartbeat,
                        &HeartbeatPayload { status, current_task_id },
                    )?
                    .with_worker(&self.config.name);
                    if write.send(Message::Text(envelope.encode()?)).await.is_err() {
                        return Ok(());
                    }
                }

                inbound = read.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => self.dispatch(&text).await,
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {} // ping/pong/binary
                        Some(Err(error)) => {
                            warn!(%error, "transport error");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "dropping malformed frame");
                return;
            }
        };

        match envelope.kind {
            MessageKind::TaskAssign => self.runner.handle_assign(&envelope).await,
            MessageKind::TaskCancel => self.runner.handle_cancel(&envelope).await,
            MessageKind::FileTransfer => self.runner.handle_file_transfer(&envelope).await,
            MessageKind::TaskAnswer => self.runner.handle_answer(&envelope).await,
            MessageKind::TaskPermissionResponse => {
                self.runner.handle_permission_response(&envelope).await
            }
            MessageKind::WorkerHeartbeatAck => {
                debug!("heartbeat acknowledged");
            }
            MessageKind::WorkerRegisterAck => {} // already handled at handshake
            other => warn!(kind = %other, "unexpected frame from coordinator"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
