/// Lease-aware drain signalling.
pub mod drain;
/// Janitor and heartbeat tasks.
pub mod janitor;
/// The per-process event consumer.
pub mod worker_loop;

pub use drain::DrainSignal;
pub use janitor::{
    spawn_claim_purge, spawn_heartbeat, spawn_seeker_purge, spawn_worker_purge,
};
pub use worker_loop::WorkerLoop;
