use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::event::WorkItem;

/// Unique identifier for a platform user.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user reference for admin listings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    pub username: String,
}

/// A user's cumulative CPU-hour total over one effective period.
///
/// For any user, at most one row's half-open `[effective_start,
/// effective_end)` range contains the current instant; ranges for the same
/// user never overlap.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserTotal {
    pub id: Uuid,
    pub user_id: UserId,
    pub username: String,
    pub total: Decimal,
    pub effective_start: DateTime<Utc>,
    pub effective_end: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// Per-user total storage and the transactional application of events.
#[async_trait]
pub trait TotalsStore: Send + Sync {
    /// The username for a user id.
    async fn username(&self, user: UserId) -> Result<String>;

    /// The user id for a username.
    async fn user_id(&self, username: &str) -> Result<UserId>;

    /// Apply one event to its user's current total, inside a single
    /// transaction with the total row locked.
    ///
    /// When the user has no row whose range covers the current instant,
    /// one is inserted with a zero total and a range of
    /// `[now, now + new_user_total_days days)`, and the event applies to
    /// that fresh row. Returns the updated row.
    async fn apply_event(
        &self,
        item: &WorkItem,
        new_user_total_days: i64,
    ) -> Result<UserTotal>;

    /// The named user's total for the current recording period.
    async fn current_total_for_user(&self, username: &str) -> Result<UserTotal>;

    /// All of the named user's totals, any period.
    async fn all_totals_for_user(&self, username: &str)
        -> Result<Vec<UserTotal>>;

    /// Every user's current-period total, for the admin surface.
    async fn all_current_totals(&self) -> Result<Vec<UserTotal>>;

    /// Every total row, any period, for the admin surface.
    async fn all_totals(&self) -> Result<Vec<UserTotal>>;
}
