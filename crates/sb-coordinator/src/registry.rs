//! Tracks connected workers, authenticates registration, supervises
//! heartbeats, and selects workers for dispatch.
//!
//! The registry owns every worker record and its transport handle; the task
//! manager asks it for workers and sends frames through it, never the other
//! way around. Disconnections (socket close and watchdog expiry alike) are
//! announced on the event bus.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sb_core::limits::HEARTBEAT_WATCHDOG_MS;
use sb_core::types::WorkerStatus;
use sb_protocol::payload::{
    HeartbeatAckPayload, HeartbeatPayload, RegisterAckPayload, RegisterPayload,
};
use sb_protocol::{Envelope, MessageKind, PROTOCOL_VERSION};
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{CoordinatorEvent, EventBus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registration secret mismatch")]
    AuthFailure,
}

// ---------------------------------------------------------------------------
// WorkerInfo
// ---------------------------------------------------------------------------

/// Public snapshot of a registered worker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub name: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<String>,
    pub os: String,
    pub runtime_version: String,
    pub cli_version: String,
    pub default_cwd: String,
    pub allowed_dirs: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

struct WorkerEntry {
    info: WorkerInfo,
    handle: mpsc::Sender<Envelope>,
    watchdog: Option<JoinHandle<()>>,
}

impl Drop for WorkerEntry {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerRegistry
// ---------------------------------------------------------------------------

struct RegistryInner {
    workers: HashMap<String, WorkerEntry>,
    /// Registration order; round-robin walks this.
    order: Vec<String>,
    rr_index: usize,
}

pub struct WorkerRegistry {
    inner: Mutex<RegistryInner>,
    bus: EventBus,
    secret: String,
    watchdog_threshold: Duration,
    weak: Weak<WorkerRegistry>,
}

impl WorkerRegistry {
    pub fn new(secret: impl Into<String>, bus: EventBus) -> Arc<Self> {
        Self::with_watchdog_threshold(secret, bus, Duration::from_millis(HEARTBEAT_WATCHDOG_MS))
    }

    /// Custom watchdog threshold; tests use short values.
    pub fn with_watchdog_threshold(
        secret: impl Into<String>,
        bus: EventBus,
        threshold: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(RegistryInner {
                workers: HashMap::new(),
                order: Vec::new(),
                rr_index: 0,
            }),
            bus,
            secret: secret.into(),
            watchdog_threshold: threshold,
            weak: weak.clone(),
        })
    }

    /// Authenticate and record a worker.
    ///
    /// On success the ack is written through the new transport handle and a
    /// `WorkerConnected` event is published. A re-registration under an
    /// existing name replaces the old record; dropping the old handle closes
    /// the stale connection's writer.
    pub async fn register(
        &self,
        payload: RegisterPayload,
        handle: mpsc::Sender<Envelope>,
    ) -> Result<WorkerInfo, RegistryError> {
        let provided = payload.secret.as_bytes();
        if !bool::from(provided.ct_eq(self.secret.as_bytes())) {
            warn!(worker = %payload.name, "registration rejected: bad secret");
            return Err(RegistryError::AuthFailure);
        }

        let version_note = if payload.protocol_version != PROTOCOL_VERSION {
            warn!(
                worker = %payload.name,
                theirs = %payload.protocol_version,
                ours = PROTOCOL_VERSION,
                "protocol version mismatch"
            );
            Some(format!(
                "protocol version mismatch: coordinator speaks {PROTOCOL_VERSION}, worker speaks {}",
                payload.protocol_version
            ))
        } else {
            None
        };

        let now = Utc::now();
        let info = WorkerInfo {
            name: payload.name.clone(),
            status: WorkerStatus::Online,
            current_task_id: None,
            os: payload.os,
            runtime_version: payload.runtime_version,
            cli_version: payload.cli_version,
            default_cwd: payload.default_cwd,
            allowed_dirs: payload.allowed_dirs,
            connected_at: now,
            last_heartbeat: now,
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.workers.remove(&info.name).is_some() {
                info!(worker = %info.name, "replacing existing registration");
            } else {
                inner.order.push(info.name.clone());
            }
            let mut entry = WorkerEntry {
                info: info.clone(),
                handle,
                watchdog: None,
            };
            self.arm_watchdog(&mut entry);
            inner.workers.insert(info.name.clone(), entry);
        }

        let ack = RegisterAckPayload {
            success: true,
            message: version_note,
        };
        match Envelope::from_payload(MessageKind::WorkerRegisterAck, &ack) {
            Ok(envelope) => {
                self.send_to_worker(&info.name, envelope.with_worker(&info.name))
                    .await;
            }
            Err(error) => warn!(worker = %info.name, %error, "failed to encode register ack"),
        }

        info!(worker = %info.name, os = %info.os, "worker registered");
        self.bus.publish(CoordinatorEvent::WorkerConnected {
            worker: info.clone(),
        });
        Ok(info)
    }

    /// Refresh liveness from an inbound heartbeat and ack it.
    pub async fn heartbeat(&self, worker_id: &str, payload: HeartbeatPayload) {
        {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.workers.get_mut(worker_id) else {
                warn!(worker = worker_id, "heartbeat from unregistered worker");
                return;
            };
            entry.info.last_heartbeat = Utc::now();
            entry.info.current_task_id = payload.current_task_id;
            self.arm_watchdog(entry);
        }

        match Envelope::from_payload(MessageKind::WorkerHeartbeatAck, &HeartbeatAckPayload::default())
        {
            Ok(envelope) => {
                self.send_to_worker(worker_id, envelope.with_worker(worker_id))
                    .await;
            }
            Err(error) => warn!(worker = worker_id, %error, "failed to encode heartbeat ack"),
        }
    }

    /// Deregister only when `handle` still identifies the registered
    /// connection. A replaced socket closing late must not evict its
    /// successor registration under the same name.
    pub async fn deregister_connection(&self, worker_id: &str, handle: &mpsc::Sender<Envelope>) {
        let is_current = {
            let inner = self.inner.lock().await;
            inner
                .workers
                .get(worker_id)
                .map(|entry| entry.handle.same_channel(handle))
                .unwrap_or(false)
        };
        if is_current {
            self.deregister(worker_id).await;
        } else {
            debug!(worker = worker_id, "stale connection closed, registration kept");
        }
    }

    /// Remove a worker and announce the disconnect.
    ///
    /// Socket close and watchdog expiry both land here; the task manager
    /// reacts to the published event by failing the worker's running task.
    pub async fn deregister(&self, worker_id: &str) {
        let removed = {
            let mut inner = self.inner.lock().await;
            let removed = inner.workers.remove(worker_id);
            if removed.is_some() {
                inner.order.retain(|name| name != worker_id);
            }
            removed
        };

        let Some(mut entry) = removed else {
            return;
        };
        entry.info.status = WorkerStatus::Offline;
        let had_running_task = entry.info.current_task_id.is_some();

        info!(worker = worker_id, had_running_task, "worker deregistered");
        self.bus.publish(CoordinatorEvent::WorkerDisconnected {
            worker_id: worker_id.to_string(),
            had_running_task,
        });
    }

    /// Pick a worker for dispatch.
    ///
    /// The preferred worker wins when it is online; otherwise the next
    /// online worker by round-robin over current membership. The index is
    /// advanced modulo the membership size on each probe, so a shrinking
    /// membership wraps naturally.
    pub async fn available_worker(&self, preferred: Option<&str>) -> Option<String> {
        let mut inner = self.inner.lock().await;

        if let Some(name) = preferred {
            if let Some(entry) = inner.workers.get(name) {
                if entry.info.status == WorkerStatus::Online {
                    return Some(name.to_string());
                }
            }
        }

        let len = inner.order.len();
        for _ in 0..len {
            let index = inner.rr_index % inner.order.len();
            inner.rr_index = inner.rr_index.wrapping_add(1);
            let name = inner.order[index].clone();
            if inner.workers[&name].info.status == WorkerStatus::Online {
                return Some(name);
            }
        }
        None
    }

    /// Mark a worker busy with the given task.
    pub async fn mark_busy(&self, worker_id: &str, task_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.workers.get_mut(worker_id) {
            entry.info.status = WorkerStatus::Busy;
            entry.info.current_task_id = Some(task_id.to_string());
        }
    }

    /// Return a worker to the online pool after a terminal transition.
    pub async fn release(&self, worker_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.workers.get_mut(worker_id) {
            entry.info.status = WorkerStatus::Online;
            entry.info.current_task_id = None;
        }
    }

    /// Serialise and write iff the transport is open; no buffering beyond
    /// the connection's write channel.
    pub async fn send_to_worker(&self, worker_id: &str, envelope: Envelope) -> bool {
        let handle = {
            let inner = self.inner.lock().await;
            match inner.workers.get(worker_id) {
                Some(entry) => entry.handle.clone(),
                None => return false,
            }
        };
        match handle.send(envelope).await {
            Ok(()) => true,
            Err(_) => {
                debug!(worker = worker_id, "transport closed, frame dropped");
                false
            }
        }
    }

    pub async fn worker(&self, worker_id: &str) -> Option<WorkerInfo> {
        let inner = self.inner.lock().await;
        inner.workers.get(worker_id).map(|entry| entry.info.clone())
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|name| inner.workers.get(name).map(|entry| entry.info.clone()))
            .collect()
    }

    /// (Re)arm the heartbeat watchdog for one entry. Expiry is handled
    /// exactly like a socket close.
    fn arm_watchdog(&self, entry: &mut WorkerEntry) {
        if let Some(old) = entry.watchdog.take() {
            old.abort();
        }
        let registry = self.weak.clone();
        let name = entry.info.name.clone();
        let threshold = self.watchdog_threshold;
        entry.watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            if let Some(registry) = registry.upgrade() {
                warn!(worker = %name, "heartbeat watchdog expired");
                registry.deregister(&name).await;
            }
        }));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
