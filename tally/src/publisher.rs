use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UsageError};
use crate::event::{EventKind, WorkItem};

/// Resource name carried by every outbound usage update.
pub const CPU_HOURS_RESOURCE: &str = "cpu.hours";
/// Resource unit carried by every outbound usage update.
pub const CPU_HOURS_UNIT: &str = "cpu hours";

/// Subject usage updates are published on, under the configured prefix.
pub fn usages_subject(prefix: &str) -> String {
    format!("{prefix}.user.usages.add")
}

/// Resource descriptor in the quota service's vocabulary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceType {
    pub name: String,
    pub unit: String,
}

impl ResourceType {
    pub fn cpu_hours() -> Self {
        Self {
            name: CPU_HOURS_RESOURCE.to_string(),
            unit: CPU_HOURS_UNIT.to_string(),
        }
    }
}

/// Outbound usage-update message for the quota sink.
///
/// The sink ingests binary floats; decimals stay confined to the store and
/// only the wire value is narrowed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageUpdate {
    pub username: String,
    pub resource_type: ResourceType,
    pub operation: String,
    pub value: f64,
    pub effective_date: DateTime<Utc>,
}

impl UsageUpdate {
    pub fn add(username: &str, value: f64, effective_date: DateTime<Utc>) -> Self {
        Self {
            username: username.to_string(),
            resource_type: ResourceType::cpu_hours(),
            operation: "ADD".to_string(),
            value,
            effective_date,
        }
    }
}

/// Build the outbound message for a processed work item.
///
/// The sink only understands additive deltas: Subtract flips the sign, and
/// Reset events produce no message at all (`None`); operators reconcile
/// resets through the resend path instead.
pub fn update_for_item(item: &WorkItem, username: &str) -> Result<Option<UsageUpdate>> {
    let signed = match item.event.kind {
        EventKind::Add | EventKind::Calculate => item.event.value,
        EventKind::Subtract => -item.event.value,
        EventKind::Reset => return Ok(None),
    };

    let value = signed.to_f64().ok_or_else(|| {
        UsageError::Arithmetic(format!(
            "event value {signed} is not representable as f64"
        ))
    })?;

    Ok(Some(UsageUpdate::add(
        username,
        value,
        item.event.effective_date,
    )))
}

/// Outbound sink for usage updates.
///
/// Implementations bridge to the deployment's message broker. Publication
/// happens after the total-update transaction commits and is best-effort:
/// a failure is logged by the caller, never rolled back, and closed later
/// through the admin resend operation.
#[async_trait]
pub trait UsagePublisher: Send + Sync {
    async fn publish(&self, subject: &str, update: &UsageUpdate) -> Result<()>;
}

/// Publisher that writes each update to the log instead of a broker.
///
/// The default sink for deployments that have not wired a broker bridge;
/// also handy for dry runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingPublisher;

#[async_trait]
impl UsagePublisher for LoggingPublisher {
    async fn publish(&self, subject: &str, update: &UsageUpdate) -> Result<()> {
        let payload = serde_json::to_string(update)
            .map_err(|e| UsageError::Publish(e.to_string()))?;
        tracing::info!(subject, payload, "usage update (log sink)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventId, UsageEvent};
    use crate::totals::UserId;
    use rust_decimal::Decimal;

    fn item(kind: EventKind, value: &str) -> WorkItem {
        WorkItem {
            id: EventId::new(),
            event: UsageEvent::now(
                kind,
                value.parse::<Decimal>().unwrap(),
                UserId::new(),
            ),
            claimed: true,
            claimed_by: None,
            claimed_on: None,
            claim_expires_on: None,
            processing: true,
            processed: false,
            processed_on: None,
            attempts: 1,
            max_attempts: 3,
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn add_publishes_positive_value() {
        let update = update_for_item(&item(EventKind::Add, "4.000"), "wregglej")
            .unwrap()
            .expect("add publishes");
        assert_eq!(update.value, 4.0);
        assert_eq!(update.operation, "ADD");
        assert_eq!(update.resource_type.name, CPU_HOURS_RESOURCE);
        assert_eq!(update.username, "wregglej");
    }

    #[test]
    fn subtract_flips_sign() {
        let update =
            update_for_item(&item(EventKind::Subtract, "2.5"), "wregglej")
                .unwrap()
                .expect("subtract publishes");
        assert_eq!(update.value, -2.5);
        assert_eq!(update.operation, "ADD");
    }

    #[test]
    fn reset_is_not_published() {
        let update = update_for_item(&item(EventKind::Reset, "0"), "wregglej")
            .unwrap();
        assert!(update.is_none());
    }

    #[test]
    fn calculate_publishes_like_add() {
        let update =
            update_for_item(&item(EventKind::Calculate, "1.25"), "wregglej")
                .unwrap()
                .expect("calculate publishes");
        assert_eq!(update.value, 1.25);
    }

    #[test]
    fn subject_includes_prefix() {
        assert_eq!(usages_subject("qms"), "qms.user.usages.add");
    }
}
