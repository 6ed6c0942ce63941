//! Worker registry: durable directory of workers plus live connectivity.
//!
//! Every mutation is written through to the `WorkerStore` before the call
//! returns. Directory changes (`register`, `unregister`) only take effect
//! once the save succeeds. Connectivity and stats changes apply in memory
//! even when the save fails, since they mirror the live socket.
//!
//! Workers are kept in id order, which is also the order `list_online`
//! reports them in.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::FleetError;
use crate::fleet::model::{
    Capabilities, ConnectionHandle, TaskOutcome, Worker, WorkerStatus, normalize_tags,
};
use crate::fleet::store::WorkerStore;

/// Registration request for a worker.
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub description: String,
    pub capabilities: Capabilities,
    pub tags: Vec<String>,
}

pub struct WorkerRegistry {
    workers: RwLock<BTreeMap<Uuid, Worker>>,
    store: Arc<dyn WorkerStore>,
}

impl WorkerRegistry {
    /// Load the persisted directory.
    ///
    /// A new process has no live connections, so every record comes back
    /// offline with its connection cleared.
    pub async fn load(store: Arc<dyn WorkerStore>) -> Result<Self, FleetError> {
        let mut workers = BTreeMap::new();
        for mut worker in store.load().await? {
            worker.status = WorkerStatus::Offline;
            worker.connection = None;
            workers.insert(worker.id, worker);
        }
        info!(count = workers.len(), "Loaded worker directory");
        Ok(Self {
            workers: RwLock::new(workers),
            store,
        })
    }

    async fn persist(&self, workers: &BTreeMap<Uuid, Worker>) -> Result<(), FleetError> {
        let snapshot: Vec<Worker> = workers.values().cloned().collect();
        self.store.save(&snapshot).await.inspect_err(|e| {
            warn!(error = %e, "Failed to persist worker directory");
        })
    }

    /// Save `next` and only then make it the live directory.
    async fn commit(
        &self,
        workers: &mut BTreeMap<Uuid, Worker>,
        next: BTreeMap<Uuid, Worker>,
    ) -> Result<(), FleetError> {
        self.persist(&next).await?;
        *workers = next;
        Ok(())
    }

    /// Register a worker, upserting on hostname.
    pub async fn register(&self, registration: Registration) -> Result<Worker, FleetError> {
        let mut workers = self.workers.write().await;
        let hostname = registration.capabilities.hostname.clone();

        let existing = workers
            .values()
            .find(|w| w.hostname().eq_ignore_ascii_case(&hostname))
            .cloned();
        let is_new = existing.is_none();

        let worker = match existing {
            Some(mut worker) => {
                worker.name = registration.name;
                worker.description = registration.description;
                worker.capabilities = registration.capabilities;
                worker.tags = normalize_tags(registration.tags);
                worker.last_seen = Utc::now();
                worker
            }
            None => Worker::new(
                registration.name,
                registration.description,
                registration.capabilities,
                registration.tags,
            ),
        };

        let mut next = workers.clone();
        next.insert(worker.id, worker.clone());
        self.commit(&mut workers, next).await?;

        if is_new {
            info!(worker_id = %worker.id, hostname = %hostname, name = %worker.name, "Worker registered");
        } else {
            info!(worker_id = %worker.id, hostname = %hostname, "Worker re-registered");
        }
        Ok(worker)
    }

    /// Remove a worker. Returns whether it existed.
    pub async fn unregister(&self, id: Uuid) -> Result<bool, FleetError> {
        let mut workers = self.workers.write().await;
        if !workers.contains_key(&id) {
            return Ok(false);
        }
        let mut next = workers.clone();
        next.remove(&id);
        self.commit(&mut workers, next).await?;
        info!(worker_id = %id, "Worker unregistered");
        Ok(true)
    }

    /// Mark a worker online on the given connection.
    pub async fn set_online(
        &self,
        id: Uuid,
        connection: ConnectionHandle,
    ) -> Result<Worker, FleetError> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(&id)
            .ok_or(FleetError::WorkerNotFound { id })?;
        worker.status = WorkerStatus::Online;
        worker.last_seen = Utc::now();
        worker.connection = Some(connection);
        let snapshot = worker.clone();
        info!(worker_id = %id, name = %snapshot.name, "Worker online");

        self.persist(&workers).await?;
        Ok(snapshot)
    }

    /// Mark a worker offline and drop its connection handle.
    pub async fn set_offline(&self, id: Uuid) -> Result<(), FleetError> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(&id)
            .ok_or(FleetError::WorkerNotFound { id })?;
        worker.status = WorkerStatus::Offline;
        worker.last_seen = Utc::now();
        worker.connection = None;
        info!(worker_id = %id, "Worker offline");

        self.persist(&workers).await
    }

    /// Worker-reported status change (e.g. busy / online) on a live connection.
    pub async fn set_status(&self, id: Uuid, status: WorkerStatus) -> Result<(), FleetError> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(&id)
            .ok_or(FleetError::WorkerNotFound { id })?;
        if worker.status == status {
            worker.last_seen = Utc::now();
            return Ok(());
        }
        debug!(worker_id = %id, from = %worker.status, to = %status, "Worker status changed");
        worker.status = status;
        worker.last_seen = Utc::now();

        self.persist(&workers).await
    }

    /// Refresh last-seen without persisting; heartbeats are frequent.
    pub async fn touch(&self, id: Uuid) {
        if let Some(worker) = self.workers.write().await.get_mut(&id) {
            worker.last_seen = Utc::now();
        }
    }

    /// Fold a task resolution into the worker's stats.
    pub async fn record_task_result(
        &self,
        id: Uuid,
        outcome: TaskOutcome,
    ) -> Result<(), FleetError> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(&id)
            .ok_or(FleetError::WorkerNotFound { id })?;
        worker.record_outcome(outcome);
        worker.last_seen = Utc::now();
        debug!(
            worker_id = %id,
            task_count = worker.task_count,
            error_count = worker.error_count,
            avg_latency_ms = worker.avg_latency_ms,
            "Worker stats updated"
        );

        self.persist(&workers).await
    }

    /// Reverse lookup from a live connection.
    pub async fn find_by_connection(&self, connection_id: Uuid) -> Option<Worker> {
        self.workers
            .read()
            .await
            .values()
            .find(|w| w.connection.as_ref().is_some_and(|c| c.id() == connection_id))
            .cloned()
    }

    /// Look up a worker by id, or by display name / hostname (case-insensitive).
    pub async fn find(&self, key: &str) -> Option<Worker> {
        let workers = self.workers.read().await;
        if let Ok(id) = Uuid::parse_str(key) {
            return workers.get(&id).cloned();
        }
        workers
            .values()
            .find(|w| w.name.eq_ignore_ascii_case(key) || w.hostname().eq_ignore_ascii_case(key))
            .cloned()
    }

    pub async fn get(&self, id: Uuid) -> Option<Worker> {
        self.workers.read().await.get(&id).cloned()
    }

    /// Connected workers able to take work, in id order.
    pub async fn list_online(&self) -> Vec<Worker> {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.status.is_available() && w.connection.is_some())
            .cloned()
            .collect()
    }

    /// Every known worker, in id order.
    pub async fn list(&self) -> Vec<Worker> {
        self.workers.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.workers.read().await.len()
    }
}
