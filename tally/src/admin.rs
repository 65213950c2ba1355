//! Composite operations backing the external admin surface.
//!
//! The HTTP layer is a thin passthrough over the store traits for listings
//! and single-row CRUD; the two operations here compose several store
//! calls and live in the core so the passthrough stays thin.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::config::EndDateRetry;
use crate::error::{Result, UsageError};
use crate::event::{EventKind, UsageEvent};
use crate::jobs::JobCatalog;
use crate::publisher::{self, UsagePublisher, UsageUpdate};
use crate::queue::EventQueue;
use crate::totals::TotalsStore;

/// Rebuild a user's total from their jobs in `[from, to]`.
///
/// Recomputes CPU hours for every calculable job in the window, then emits
/// a `Reset(0)` event followed by one `Add` per job. The events flow
/// through the ordinary queue, so the rebuilt total lands once the workers
/// drain them. Callers should quiesce event production for the user first;
/// Reset does not commute with concurrent Adds.
///
/// Returns the number of Add events enqueued.
pub async fn recalculate_for_user<S>(
    store: &S,
    retry: EndDateRetry,
    username: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<usize>
where
    S: TotalsStore + JobCatalog + EventQueue,
{
    let user = store.user_id(username).await?;
    let jobs = store.calculable_jobs(user, from, to).await?;
    if jobs.is_empty() {
        return Err(UsageError::NotFound("calculable jobs"));
    }

    info!(
        user = %username,
        jobs = jobs.len(),
        %from,
        %to,
        "recalculating cpu-hour total"
    );

    let mut calculations = Vec::with_capacity(jobs.len());
    for job in jobs {
        let calc = store.compute_usage(job, retry).await?;
        debug!(job = %job, cpu_hours = %calc.cpu_hours, "recalculated job usage");
        calculations.push(calc);
    }

    store
        .record_event(&UsageEvent::now(EventKind::Reset, Decimal::ZERO, user))
        .await?;

    let mut enqueued = 0;
    for calc in calculations {
        store
            .record_event(&UsageEvent::now(EventKind::Add, calc.cpu_hours, user))
            .await?;
        enqueued += 1;
    }

    Ok(enqueued)
}

/// Re-publish a user's current total to the quota sink.
///
/// The reconciliation path for updates lost to publish failures or a crash
/// between the total commit and the publication.
pub async fn resend_total_for_user<S, P>(
    store: &S,
    sink: &P,
    subject_prefix: &str,
    username: &str,
) -> Result<()>
where
    S: TotalsStore,
    P: UsagePublisher,
{
    let total = store.current_total_for_user(username).await?;

    let value = total.total.to_f64().ok_or_else(|| {
        UsageError::Arithmetic(format!(
            "total {} is not representable as f64",
            total.total
        ))
    })?;

    let update = UsageUpdate::add(&total.username, value, Utc::now());
    let subject = publisher::usages_subject(subject_prefix);
    sink.publish(&subject, &update).await?;

    info!(user = %username, total = %total.total, "resent current total");
    Ok(())
}
