use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Unique identifier for a registered worker process.
///
/// Issued by the store at registration time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A worker's registry row.
///
/// The seeking and working flags are mutually exclusive by construction:
/// a worker that has claimed work clears seeking and sets working in one
/// transaction before processing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub added_on: DateTime<Utc>,
    pub active: bool,
    pub activated_on: DateTime<Utc>,
    pub activation_expires_on: Option<DateTime<Utc>>,
    pub deactivated_on: Option<DateTime<Utc>>,
    pub getting_work: bool,
    pub getting_work_on: Option<DateTime<Utc>>,
    pub getting_work_expires_on: Option<DateTime<Utc>>,
    pub working: bool,
    pub working_on: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
}

/// Registry of active worker processes.
///
/// Registrations expire unless refreshed; the janitor deactivates workers
/// whose activation lapsed while they were quiescent, and clears the
/// seeking flag of workers stuck looking for work. A working worker is
/// never purged.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Register a new worker, returning its server-issued id.
    async fn register(
        &self,
        name: &str,
        expires_on: DateTime<Utc>,
    ) -> Result<WorkerId>;

    /// Extend a worker's activation by `lifetime` from now (heartbeat).
    /// Returns the new expiration instant.
    async fn refresh(
        &self,
        worker: WorkerId,
        lifetime: Duration,
    ) -> Result<DateTime<Utc>>;

    /// Mark the worker as looking for work until `expires_on`.
    async fn begin_seeking(
        &self,
        worker: WorkerId,
        expires_on: DateTime<Utc>,
    ) -> Result<()>;

    /// Clear the worker's seeking state.
    async fn done_seeking(&self, worker: WorkerId) -> Result<()>;

    /// Transition the worker from seeking to working in one transaction.
    ///
    /// Splitting this across transactions would open a window where the
    /// janitor sees the worker neither seeking nor working and purges it.
    async fn enter_working(&self, worker: WorkerId) -> Result<()>;

    /// Set or clear the worker's working flag.
    async fn set_working(&self, worker: WorkerId, working: bool) -> Result<()>;

    /// Deactivate the worker (graceful unregistration).
    async fn deactivate(&self, worker: WorkerId) -> Result<()>;

    /// Deactivate workers whose activation expired while neither seeking
    /// nor working. Returns the number of workers affected.
    async fn purge_expired_workers(&self) -> Result<u64>;

    /// Clear the seeking flag of workers whose seek expired while not
    /// working. Returns the number of workers affected.
    async fn purge_expired_seekers(&self) -> Result<u64>;

    /// All registered workers, for the admin surface.
    async fn list_workers(&self) -> Result<Vec<Worker>>;

    /// A single worker by id, for the admin surface.
    async fn get_worker(&self, worker: WorkerId) -> Result<Worker>;

    /// Remove a worker row entirely, for the admin surface.
    async fn delete_worker(&self, worker: WorkerId) -> Result<()>;
}
