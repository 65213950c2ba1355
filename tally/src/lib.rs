//! Tally - durable per-user CPU-hour accounting.
//!
//! Job-state notifications from a message broker become usage events in a
//! database-backed work queue; a pool of registered workers leases those
//! events, applies each one exactly once to the owning user's running
//! total, and forwards the update to an external quota service.
//!
//! # Core Concepts
//!
//! - **Event**: a recorded intent to mutate a user's total ([`UsageEvent`],
//!   [`WorkItem`]). The event table doubles as the work queue.
//!
//! - **Claim**: a time-bounded lease a worker takes on an event. Claims
//!   expire rather than lock: a crashed worker's events are recycled by the
//!   janitor instead of holding transactions across processes.
//!
//! - **Worker**: a registered consumer process with a heartbeat-extended
//!   activation ([`Worker`], [`WorkerRegistry`]). The [`WorkerLoop`] walks
//!   seeking → claiming → working → done each iteration.
//!
//! - **Janitor**: periodic reconciliation tasks that deactivate expired
//!   workers, clear stuck seekers, and recycle lapsed claims
//!   ([`runtime::janitor`]).
//!
//! - **Totals**: per-user decimal running totals over half-open effective
//!   ranges ([`UserTotal`], [`TotalsStore`]), mutated transactionally under
//!   a row lock.
//!
//! # Storage
//!
//! The PostgreSQL implementation lives in [`persistence::PgStore`]; the
//! schema is shipped in `migrations/001_initial_schema.sql`. Tests run
//! against the in-memory store from the `tally-testkit` crate.

/// Composite admin operations (recalculate, resend).
pub mod admin;

/// Service and persistence configuration.
pub mod config;

/// CPU-hour arithmetic for finished jobs.
pub mod cpuhours;

/// Failure taxonomy.
pub mod error;

/// Usage events, event kinds, and work-queue items.
pub mod event;

/// Job records and the usage-calculation seam.
pub mod jobs;

/// PostgreSQL persistence.
pub mod persistence;

/// Outbound usage updates and the publisher seam.
pub mod publisher;

/// The event queue seam.
pub mod queue;

/// The inbound job-update recorder.
pub mod recorder;

/// The worker registry seam.
pub mod registry;

/// Worker loop, janitor tasks, and drain signalling.
pub mod runtime;

/// Tracing spans for the worker lifecycle.
pub mod telemetry;

/// Per-user totals and the transactional applier seam.
pub mod totals;

pub use config::{EndDateRetry, PersistenceConfig, UsageConfig};
pub use cpuhours::{cpu_hours, usage_basis, UsageCalculation};
pub use error::{Result, UsageError};
pub use event::{apply_to_total, EventId, EventKind, UsageEvent, WorkItem};
pub use jobs::{Job, JobCatalog, JobId};
pub use publisher::{
    update_for_item, usages_subject, LoggingPublisher, UsagePublisher,
    UsageUpdate,
};
pub use queue::EventQueue;
pub use recorder::{JobState, JobUpdate, Recorder};
pub use registry::{Worker, WorkerId, WorkerRegistry};
pub use runtime::{DrainSignal, WorkerLoop};
pub use totals::{TotalsStore, UserId, UserRef, UserTotal};
