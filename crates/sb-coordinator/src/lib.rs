//! Switchboard coordinator: worker registry, task manager, event bus, and
//! the transport server that ties them together.

pub mod events;
pub mod manager;
pub mod registry;
pub mod server;
pub mod transfer;

use std::sync::Arc;

use events::{CoordinatorEvent, EventBus};
use manager::TaskManager;
use registry::WorkerRegistry;
use tracing::debug;
use transfer::AttachmentTransfers;

/// The assembled coordinator core.
///
/// The chat adapter subscribes to `bus` and drives `manager`; the transport
/// server feeds both. A background glue task reacts to registry events:
/// a connect unblocks dispatch, a disconnect fails the worker's running
/// task.
pub struct Coordinator {
    pub registry: Arc<WorkerRegistry>,
    pub manager: Arc<TaskManager>,
    pub transfers: Arc<AttachmentTransfers>,
    pub bus: EventBus,
}

impl Coordinator {
    pub fn new(shared_secret: impl Into<String>) -> Self {
        let bus = EventBus::new();
        let registry = WorkerRegistry::new(shared_secret, bus.clone());
        let transfers = Arc::new(AttachmentTransfers::new());
        let manager = TaskManager::new(Arc::clone(&registry), Arc::clone(&transfers), bus.clone());

        let coordinator = Self {
            registry,
            manager,
            transfers,
            bus,
        };
        coordinator.spawn_glue();
        coordinator
    }

    /// Build the axum router serving the worker control plane.
    pub fn router(&self) -> axum::Router {
        server::router(Arc::new(server::ServerState {
            registry: Arc::clone(&self.registry),
            manager: Arc::clone(&self.manager),
            transfers: Arc::clone(&self.transfers),
        }))
    }

    /// Wire registry events back into the task manager.
    fn spawn_glue(&self) {
        let events = self.bus.subscribe();
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                match event {
                    CoordinatorEvent::WorkerConnected { worker } => {
                        debug!(worker = %worker.name, "worker online, advancing queue");
                        manager.dispatch_next().await;
                    }
                    CoordinatorEvent::WorkerDisconnected { worker_id, .. } => {
                        manager.handle_worker_disconnect(&worker_id).await;
                    }
                    _ => {}
                }
            }
        });
    }
}
