//! Out-of-band attachment delivery.
//!
//! Before a `task:assign`, dispatch downloads each attachment from its
//! source URL and ships the bytes to the assigned worker as a
//! `file:transfer` frame, waiting for the correlated ack. Acks correlate by
//! `(taskId, fileName)`. The whole step runs under one per-task budget;
//! anything that fails is downgraded to a warning and the task runs with
//! the attachment referenced by URL instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use sb_core::types::Attachment;
use sb_protocol::payload::{FileTransferAckPayload, FileTransferPayload};
use sb_protocol::{Envelope, MessageKind};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::registry::WorkerRegistry;

type TransferKey = (String, String);

pub struct AttachmentTransfers {
    client: reqwest::Client,
    pending: Mutex<HashMap<TransferKey, oneshot::Sender<FileTransferAckPayload>>>,
}

impl AttachmentTransfers {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver every unresolved attachment to `worker_id`, filling in
    /// `local_path` from the worker's acks. Runs inside `budget`; on budget
    /// exhaustion the remaining attachments keep `local_path = None`.
    pub async fn resolve(
        &self,
        registry: &Arc<WorkerRegistry>,
        worker_id: &str,
        task_id: &str,
        attachments: &mut [Attachment],
        budget: Duration,
    ) {
        if attachments.iter().all(|a| a.local_path.is_some()) {
            return;
        }

        let outcome = tokio::time::timeout(budget, async {
            for attachment in attachments.iter_mut() {
                if attachment.local_path.is_some() {
                    continue;
                }
                match self
                    .transfer_one(registry, worker_id, task_id, attachment)
                    .await
                {
                    Ok(local_path) => attachment.local_path = Some(local_path),
                    Err(reason) => {
                        warn!(
                            task_id,
                            file = %attachment.file_name,
                            reason,
                            "attachment transfer failed, task will reference it by URL"
                        );
                    }
                }
            }
        })
        .await;

        if outcome.is_err() {
            warn!(task_id, "attachment transfer budget exhausted");
            // Forget any still-pending correlations for this task.
            let mut pending = self.pending.lock().await;
            pending.retain(|(pending_task, _), _| pending_task != task_id);
        }
    }

    async fn transfer_one(
        &self,
        registry: &Arc<WorkerRegistry>,
        worker_id: &str,
        task_id: &str,
        attachment: &Attachment,
    ) -> Result<String, String> {
        let response = self
            .client
            .get(&attachment.source_url)
            .send()
            .await
            .map_err(|e| format!("download failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("download failed: HTTP {}", response.status()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| format!("download failed: {e}"))?;

        let key = (task_id.to_string(), attachment.file_name.clone());
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(key.clone(), ack_tx);
        }

        let payload = FileTransferPayload {
            file_name: attachment.file_name.clone(),
            mime: attachment.mime.clone(),
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
        };
        let envelope = match Envelope::from_payload(MessageKind::FileTransfer, &payload) {
            Ok(envelope) => envelope.with_task(task_id).with_worker(worker_id),
            Err(error) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&key);
                return Err(format!("failed to encode transfer frame: {error}"));
            }
        };

        if !registry.send_to_worker(worker_id, envelope).await {
            let mut pending = self.pending.lock().await;
            pending.remove(&key);
            return Err("worker transport closed".to_string());
        }

        let ack = ack_rx
            .await
            .map_err(|_| "transfer correlation dropped".to_string())?;
        if ack.success {
            ack.local_path
                .ok_or_else(|| "ack missing local path".to_string())
        } else {
            Err(ack
                .message
                .unwrap_or_else(|| "worker rejected transfer".to_string()))
        }
    }

    /// Resolve the pending transfer matching `(taskId, fileName)`.
    pub async fn handle_ack(&self, task_id: &str, ack: FileTransferAckPayload) {
        let key = (task_id.to_string(), ack.file_name.clone());
        let waiter = {
            let mut pending = self.pending.lock().await;
            pending.remove(&key)
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(ack);
            }
            None => debug!(task_id, file = %ack.file_name, "uncorrelated transfer ack"),
        }
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Default for AttachmentTransfers {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
