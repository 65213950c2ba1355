//! Tracing spans for the worker lifecycle.
//!
//! Helpers that name the phases an event moves through so log lines from
//! concurrent workers stay attributable.

use tracing::{info_span, Span};

/// Span covering one full pass of the worker loop.
#[must_use]
pub fn worker_iteration_span(worker_id: &str, worker_name: &str) -> Span {
    info_span!(
        "tally.iteration",
        worker.id = %worker_id,
        worker.name = %worker_name,
    )
}

/// Span covering the application of one event to a total.
#[must_use]
pub fn apply_span(event_id: &str, kind: &str) -> Span {
    info_span!(
        "tally.apply",
        event.id = %event_id,
        event.kind = %kind,
    )
}

/// Span covering one outbound publication.
#[must_use]
pub fn publish_span(subject: &str, username: &str) -> Span {
    info_span!(
        "tally.publish",
        subject = %subject,
        user = %username,
    )
}
