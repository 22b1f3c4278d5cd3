use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sb_core::types::Task;
use serde_json::Value;

use crate::registry::WorkerInfo;

// ---------------------------------------------------------------------------
// CoordinatorEvent
// ---------------------------------------------------------------------------

/// Everything the chat adapter (and any other subscriber) can observe.
///
/// Each variant is published exactly once per transition, from the task
/// that performed the transition. Task-carrying variants hold a snapshot
/// taken at publish time.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    TaskQueued { task: Task },
    TaskStarted { task: Task },
    /// Debounced to at most one per second per task.
    TaskStreamUpdate { task: Task },
    TaskCompleted { task: Task },
    TaskFailed { task: Task },
    TaskCancelled { task: Task },
    TaskQuestion { task_id: String, payload: Value },
    TaskPermission { task_id: String, payload: Value },
    WorkerConnected { worker: WorkerInfo },
    WorkerDisconnected { worker_id: String, had_running_task: bool },
    TeamUpdate { worker_id: String, payload: Value },
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

type Subscribers = Vec<flume::Sender<CoordinatorEvent>>;

/// Fan-out point for coordinator lifecycle events.
///
/// Consumers (the chat adapter, the registry/manager glue, operator status
/// logging) each hold their own flume receiver; a publish walks the
/// subscriber list once and drops entries whose receiving end has gone
/// away. Handles clone cheaply and all share one subscriber list, so any
/// component can hand out subscriptions.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new subscription.
    ///
    /// Delivery starts with the next publish; earlier events are not
    /// replayed.
    pub fn subscribe(&self) -> flume::Receiver<CoordinatorEvent> {
        let (tx, rx) = flume::unbounded();
        self.lock_subscribers().push(tx);
        rx
    }

    /// Deliver one event to every live subscriber, pruning dead ones.
    pub fn publish(&self, event: CoordinatorEvent) {
        self.lock_subscribers()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Subscribers> {
        // The sender list stays structurally sound even if a publisher
        // panicked mid-send, so recover the guard instead of propagating.
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
