//! Periodic reconciliation tasks.
//!
//! Four purge loops plus the registration heartbeat, each on its own
//! interval with short-lived transactions. All of them are idempotent and
//! safe to run concurrently with any worker: the purge predicates exclude
//! workers that are seeking or working, so an active worker is never
//! swept out from under its claim.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::queue::EventQueue;
use crate::registry::{WorkerId, WorkerRegistry};
use crate::runtime::drain::DrainSignal;

fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: std::time::Duration,
    drain: DrainSignal,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = drain.draining() => {
                    info!(task = name, "janitor task drained");
                    break;
                }
                _ = tokio::time::sleep(interval) => tick().await,
            }
        }
    })
}

/// Keep the worker's registration alive by extending its activation ahead
/// of expiry.
pub fn spawn_heartbeat<S>(
    store: Arc<S>,
    worker: WorkerId,
    refresh_interval: std::time::Duration,
    worker_lifetime: chrono::Duration,
    drain: DrainSignal,
) -> JoinHandle<()>
where
    S: WorkerRegistry + 'static,
{
    spawn_periodic("heartbeat", refresh_interval, drain, move || {
        let store = Arc::clone(&store);
        async move {
            match store.refresh(worker, worker_lifetime).await {
                Ok(expires_on) => {
                    info!(worker = %worker, %expires_on, "refreshed worker registration");
                }
                Err(err) => {
                    error!(worker = %worker, %err, "refreshing worker registration failed");
                }
            }
        }
    })
}

/// Deactivate workers whose activation expired while quiescent, then clear
/// any claims still held by inactive workers.
///
/// The two run back to back so a freshly deactivated worker's claims are
/// recycled in the same sweep.
pub fn spawn_worker_purge<S>(
    store: Arc<S>,
    interval: std::time::Duration,
    drain: DrainSignal,
) -> JoinHandle<()>
where
    S: WorkerRegistry + EventQueue + 'static,
{
    spawn_periodic("purge-workers", interval, drain, move || {
        let store = Arc::clone(&store);
        async move {
            match store.purge_expired_workers().await {
                Ok(purged) => info!(purged, "purged expired workers"),
                Err(err) => {
                    error!(%err, "purging expired workers failed");
                    return;
                }
            }
            match store.reclaim_inactive_worker_claims().await {
                Ok(reclaimed) => {
                    info!(reclaimed, "reset claims of inactive workers")
                }
                Err(err) => {
                    error!(%err, "resetting claims of inactive workers failed")
                }
            }
        }
    })
}

/// Clear the seeking flag of workers stuck looking for work past their
/// seek expiration.
pub fn spawn_seeker_purge<S>(
    store: Arc<S>,
    interval: std::time::Duration,
    drain: DrainSignal,
) -> JoinHandle<()>
where
    S: WorkerRegistry + 'static,
{
    spawn_periodic("purge-seekers", interval, drain, move || {
        let store = Arc::clone(&store);
        async move {
            match store.purge_expired_seekers().await {
                Ok(purged) => info!(purged, "purged expired work seekers"),
                Err(err) => error!(%err, "purging expired work seekers failed"),
            }
        }
    })
}

/// Release events whose claim expired without being processed.
pub fn spawn_claim_purge<S>(
    store: Arc<S>,
    interval: std::time::Duration,
    drain: DrainSignal,
) -> JoinHandle<()>
where
    S: EventQueue + 'static,
{
    spawn_periodic("purge-claims", interval, drain, move || {
        let store = Arc::clone(&store);
        async move {
            match store.reclaim_expired_claims().await {
                Ok(reclaimed) => info!(reclaimed, "purged expired work claims"),
                Err(err) => error!(%err, "purging expired work claims failed"),
            }
        }
    })
}
