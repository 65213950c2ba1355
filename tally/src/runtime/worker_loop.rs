use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::UsageConfig;
use crate::error::Result;
use crate::event::WorkItem;
use crate::publisher::{self, UsagePublisher};
use crate::queue::EventQueue;
use crate::registry::{WorkerId, WorkerRegistry};
use crate::runtime::drain::DrainSignal;
use crate::telemetry;
use crate::totals::TotalsStore;

/// The per-process event consumer.
///
/// Each iteration walks seeking → claiming → working → done: mark the
/// worker as seeking, list eligible events, claim the first one, apply it
/// to the owning user's total, publish the update, and finish. Every step
/// failure is logged and the loop continues; only a drain ends it, and
/// only between iterations, so an event mid-flight still gets its finish
/// transaction before the loop exits.
///
/// The total-update transaction and the finish transaction commit
/// separately. A crash between the two can re-lease the event and apply it
/// twice; operators close such gaps with the admin recalculate operation.
pub struct WorkerLoop<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    config: UsageConfig,
    worker_id: WorkerId,
    worker_name: String,
    subject: String,
    drain: DrainSignal,
}

impl<S, P> WorkerLoop<S, P>
where
    S: EventQueue + WorkerRegistry + TotalsStore,
    P: UsagePublisher,
{
    pub fn new(
        store: Arc<S>,
        publisher: Arc<P>,
        config: UsageConfig,
        worker_id: WorkerId,
        worker_name: impl Into<String>,
        drain: DrainSignal,
    ) -> Self {
        let subject = publisher::usages_subject(&config.usage_subject_prefix);
        Self {
            store,
            publisher,
            config,
            worker_id,
            worker_name: worker_name.into(),
            subject,
            drain,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Run until drained.
    pub async fn run(&self) {
        info!(
            worker = %self.worker_id,
            name = %self.worker_name,
            "worker loop starting"
        );

        while !self.drain.is_draining() {
            self.iteration().await;
        }

        info!(worker = %self.worker_id, "worker loop drained");
    }

    /// One pass over the queue. Returns the id of the processed event for
    /// the integration tests; `None` when the iteration did no work.
    pub async fn iteration(&self) -> Option<WorkItem> {
        let span = telemetry::worker_iteration_span(
            &self.worker_id.to_string(),
            &self.worker_name,
        );
        let _guard = span.enter();

        let seek_expires = Utc::now() + self.config.seeking_lifetime();
        if let Err(err) = self
            .store
            .begin_seeking(self.worker_id, seek_expires)
            .await
        {
            error!(worker = %self.worker_id, %err, "could not begin seeking");
            self.pause(std::time::Duration::from_millis(100)).await;
            return None;
        }

        debug!(worker = %self.worker_id, "looking for work");

        let items = match self.store.eligible_events(self.config.batch_size).await {
            Ok(items) => items,
            Err(err) => {
                error!(worker = %self.worker_id, %err, "could not list eligible events");
                self.stop_seeking().await;
                self.idle().await;
                return None;
            }
        };

        debug!(
            worker = %self.worker_id,
            candidates = items.len(),
            "eligible events fetched"
        );

        let Some(item) = items.into_iter().next() else {
            self.stop_seeking().await;
            self.idle().await;
            return None;
        };

        // Batch listing and claiming race against other workers; losing
        // the guarded update just means someone else got there first.
        match self
            .store
            .claim_event(item.id, self.worker_id, self.config.claim_lifetime())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(worker = %self.worker_id, event = %item.id, "lost claim race");
                self.stop_seeking().await;
                return None;
            }
            Err(err) => {
                error!(worker = %self.worker_id, event = %item.id, %err, "claim failed");
                self.stop_seeking().await;
                return None;
            }
        }

        info!(worker = %self.worker_id, event = %item.id, "claimed event");

        if let Err(err) = self.store.enter_working(self.worker_id).await {
            error!(worker = %self.worker_id, %err, "could not enter working state");
            return None;
        }

        match self.process(&item).await {
            Ok(()) => {
                if let Err(err) =
                    self.store.finish_event(item.id, self.worker_id).await
                {
                    error!(
                        worker = %self.worker_id,
                        event = %item.id,
                        %err,
                        "could not finish event"
                    );
                    return None;
                }
                info!(worker = %self.worker_id, event = %item.id, "finished event");
                Some(item)
            }
            Err(err) => {
                error!(
                    worker = %self.worker_id,
                    event = %item.id,
                    %err,
                    "processing failed, releasing event"
                );
                if let Err(err) =
                    self.store.release_event(item.id, self.worker_id).await
                {
                    error!(
                        worker = %self.worker_id,
                        event = %item.id,
                        %err,
                        "could not release event"
                    );
                }
                None
            }
        }
    }

    /// Apply the event to its user's total, then publish the update.
    ///
    /// Publication is best-effort: a failed send is logged and the event
    /// still finishes, since the total already committed.
    async fn process(&self, item: &WorkItem) -> Result<()> {
        let span = telemetry::apply_span(
            &item.id.to_string(),
            item.event.kind.as_str(),
        );
        let _guard = span.enter();

        let total = self
            .store
            .apply_event(item, self.config.new_user_total_days)
            .await?;

        match publisher::update_for_item(item, &total.username) {
            Ok(Some(update)) => {
                let span =
                    telemetry::publish_span(&self.subject, &total.username);
                let _guard = span.enter();
                if let Err(err) =
                    self.publisher.publish(&self.subject, &update).await
                {
                    warn!(
                        event = %item.id,
                        user = %total.username,
                        %err,
                        "publishing usage update failed; total is committed"
                    );
                }
            }
            Ok(None) => {
                debug!(event = %item.id, "event kind is not published");
            }
            Err(err) => {
                warn!(event = %item.id, %err, "could not build usage update");
            }
        }

        Ok(())
    }

    async fn stop_seeking(&self) {
        if let Err(err) = self.store.done_seeking(self.worker_id).await {
            error!(worker = %self.worker_id, %err, "could not stop seeking");
        }
    }

    async fn idle(&self) {
        self.pause(std::time::Duration::from_secs(self.config.idle_sleep_secs))
            .await;
    }

    async fn pause(&self, duration: std::time::Duration) {
        tokio::select! {
            _ = self.drain.draining() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}
