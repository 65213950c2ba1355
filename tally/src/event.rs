use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, UsageError};
use crate::registry::WorkerId;
use crate::totals::UserId;

/// Unique identifier for a usage event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Create a new event ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The effect a usage event has on a user's running total.
///
/// `Calculate` is the kind emitted by the recorder for a finished job; it
/// applies exactly like `Add`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventKind {
    Add,
    Subtract,
    Reset,
    Calculate,
}

impl EventKind {
    /// The enumerator-table name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "cpu.hours.add",
            EventKind::Subtract => "cpu.hours.subtract",
            EventKind::Reset => "cpu.hours.reset",
            EventKind::Calculate => "cpu.hours.calculate",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu.hours.add" => Ok(EventKind::Add),
            "cpu.hours.subtract" => Ok(EventKind::Subtract),
            "cpu.hours.reset" => Ok(EventKind::Reset),
            "cpu.hours.calculate" => Ok(EventKind::Calculate),
            other => Err(UsageError::Malformed(format!(
                "unknown event kind: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for EventKind {
    type Error = UsageError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_string()
    }
}

/// A recorded intent to mutate a user's CPU-hour total.
///
/// This is the insertable portion of an event; the work-queue bookkeeping
/// lives on [`WorkItem`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageEvent {
    pub record_date: DateTime<Utc>,
    pub effective_date: DateTime<Utc>,
    pub kind: EventKind,
    pub value: Decimal,
    pub created_by: UserId,
}

impl UsageEvent {
    /// Build an event stamped with the current instant for both dates.
    pub fn now(kind: EventKind, value: Decimal, created_by: UserId) -> Self {
        let now = Utc::now();
        Self {
            record_date: now,
            effective_date: now,
            kind,
            value,
            created_by,
        }
    }
}

/// A usage event together with its work-queue state.
///
/// A work item is a superset of an event: the same row, read back with the
/// claim, processing, and attempt-accounting columns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: EventId,
    #[serde(flatten)]
    pub event: UsageEvent,
    pub claimed: bool,
    pub claimed_by: Option<WorkerId>,
    pub claimed_on: Option<DateTime<Utc>>,
    pub claim_expires_on: Option<DateTime<Utc>>,
    pub processing: bool,
    pub processed: bool,
    pub processed_on: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_modified: DateTime<Utc>,
}

impl WorkItem {
    /// Whether this item may be claimed at `now`.
    ///
    /// Mirrors the store-side predicate: unclaimed, unprocessed, not in
    /// flight, attempts remaining, and any previous claim expired. Items
    /// past their attempt budget are parked until an operator intervenes.
    pub fn eligible(&self, now: DateTime<Utc>) -> bool {
        !self.claimed
            && !self.processed
            && !self.processing
            && self.attempts < self.max_attempts
            && self.claim_expires_on.map_or(true, |expires| now >= expires)
    }
}

/// Apply an event to a running total, returning the new total.
///
/// All arithmetic is checked; overflow surfaces as [`UsageError::Arithmetic`]
/// so the event can be retried up to its attempt budget.
pub fn apply_to_total(
    kind: EventKind,
    current: Decimal,
    value: Decimal,
) -> Result<Decimal> {
    match kind {
        EventKind::Add | EventKind::Calculate => {
            current.checked_add(value).ok_or_else(|| {
                UsageError::Arithmetic(format!("{current} + {value} overflowed"))
            })
        }
        EventKind::Subtract => current.checked_sub(value).ok_or_else(|| {
            UsageError::Arithmetic(format!("{current} - {value} overflowed"))
        }),
        EventKind::Reset => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn add_then_subtract_restores_total() {
        let start = dec("12.5");
        let bumped = apply_to_total(EventKind::Add, start, dec("4.000")).unwrap();
        let back =
            apply_to_total(EventKind::Subtract, bumped, dec("4.000")).unwrap();
        assert_eq!(back, start);
    }

    #[test]
    fn subtract_may_go_negative() {
        let total =
            apply_to_total(EventKind::Subtract, dec("1"), dec("2.5")).unwrap();
        assert_eq!(total, dec("-1.5"));
    }

    #[test]
    fn reset_is_idempotent() {
        let mut total = dec("99.875");
        for _ in 0..3 {
            total = apply_to_total(EventKind::Reset, total, dec("7")).unwrap();
        }
        assert_eq!(total, dec("7"));
    }

    #[test]
    fn reset_zero_clears_total() {
        let total =
            apply_to_total(EventKind::Reset, dec("12.5"), dec("0")).unwrap();
        assert_eq!(total, Decimal::ZERO);
    }

    #[test]
    fn calculate_applies_as_add() {
        let total =
            apply_to_total(EventKind::Calculate, dec("1.5"), dec("2.5"))
                .unwrap();
        assert_eq!(total, dec("4.0"));
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            EventKind::Add,
            EventKind::Subtract,
            EventKind::Reset,
            EventKind::Calculate,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("cpu.hours.bogus".parse::<EventKind>().is_err());
    }

    fn bare_item(attempts: i32, max_attempts: i32) -> WorkItem {
        WorkItem {
            id: EventId::new(),
            event: UsageEvent::now(EventKind::Add, dec("1"), UserId::new()),
            claimed: false,
            claimed_by: None,
            claimed_on: None,
            claim_expires_on: None,
            processing: false,
            processed: false,
            processed_on: None,
            attempts,
            max_attempts,
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn eligibility_requires_attempt_budget() {
        let now = Utc::now();
        assert!(bare_item(0, 3).eligible(now));
        assert!(bare_item(2, 3).eligible(now));
        assert!(!bare_item(3, 3).eligible(now));
    }

    #[test]
    fn eligibility_honours_claim_expiry() {
        let now = Utc::now();
        let mut item = bare_item(0, 3);
        item.claim_expires_on = Some(now + chrono::Duration::seconds(60));
        assert!(!item.eligible(now));
        item.claim_expires_on = Some(now - chrono::Duration::seconds(1));
        assert!(item.eligible(now));
    }

    #[test]
    fn processing_and_processed_items_are_ineligible() {
        let now = Utc::now();
        let mut item = bare_item(0, 3);
        item.processing = true;
        assert!(!item.eligible(now));

        let mut item = bare_item(0, 3);
        item.processed = true;
        assert!(!item.eligible(now));

        let mut item = bare_item(0, 3);
        item.claimed = true;
        assert!(!item.eligible(now));
    }
}
