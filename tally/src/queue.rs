use async_trait::async_trait;
use chrono::Duration;

use crate::error::Result;
use crate::event::{EventId, UsageEvent, WorkItem};
use crate::registry::WorkerId;

/// The usage-event table interpreted as a lease-based work queue.
///
/// There is no long-held row lock across processing: the claim columns and
/// their expiration are the only concurrency control, and the janitor
/// recycles claims whose lease lapsed or whose worker went inactive.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Insert a new event with default work-queue state.
    async fn record_event(&self, event: &UsageEvent) -> Result<EventId>;

    /// Events currently eligible for a claim, oldest first, at most
    /// `limit` of them.
    ///
    /// Eligible means: unclaimed, unprocessed, not in flight, attempts
    /// below the budget, and any previous claim expired.
    async fn eligible_events(&self, limit: i64) -> Result<Vec<WorkItem>>;

    /// Claim an event for `worker` and mark it in flight, all in one
    /// transaction: sets the claim columns, `processing = true`, and
    /// increments the attempt counter.
    ///
    /// Returns `false` when the guarded update matched no row: another
    /// worker won the race or the event stopped being eligible.
    async fn claim_event(
        &self,
        event: EventId,
        worker: WorkerId,
        claim_ttl: Duration,
    ) -> Result<bool>;

    /// Mark the event processed and clear the worker's working flag in one
    /// transaction. Irreversible.
    async fn finish_event(&self, event: EventId, worker: WorkerId) -> Result<()>;

    /// Abandon an in-flight event after a processing failure: clears
    /// `processing` (leaving the claim to expire naturally) and the
    /// worker's working flag. The attempt already spent stays counted.
    async fn release_event(&self, event: EventId, worker: WorkerId)
        -> Result<()>;

    /// Clear the claim of every unprocessed event whose lease expired,
    /// including a stale `processing` flag left behind by a crashed
    /// worker. Idempotent. Returns the number of events affected.
    ///
    /// The claim's expiration instant itself is left in place; eligibility
    /// already treats it as passed.
    async fn reclaim_expired_claims(&self) -> Result<u64>;

    /// Clear the claim (and any stale `processing` flag) of every
    /// unprocessed event held by an inactive worker. Returns the number of
    /// events affected.
    async fn reclaim_inactive_worker_claims(&self) -> Result<u64>;

    /// All events, including parked ones past their attempt budget, for
    /// the admin surface.
    async fn list_events(&self) -> Result<Vec<WorkItem>>;

    /// All events created by the named user, for the admin surface.
    async fn list_events_for_user(&self, username: &str)
        -> Result<Vec<WorkItem>>;

    /// A single event by id, for the admin surface.
    async fn get_event(&self, event: EventId) -> Result<WorkItem>;

    /// Overwrite an event's fields, for the admin surface. Operators use
    /// this to reset attempt counters on parked events.
    async fn update_event(&self, item: &WorkItem) -> Result<()>;

    /// Delete an event, for the admin surface.
    async fn delete_event(&self, event: EventId) -> Result<()>;
}
