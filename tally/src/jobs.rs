use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EndDateRetry;
use crate::cpuhours::UsageCalculation;
use crate::error::Result;
use crate::totals::{UserId, UserRef};

/// Unique identifier for a batch job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A batch job as the usage calculation sees it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub millicores_reserved: i64,
    pub usage_last_update: Option<DateTime<Utc>>,
}

/// Read access to the platform's job records.
#[async_trait]
pub trait JobCatalog: Send + Sync {
    /// Resolve the externally visible step id to the owning job.
    async fn job_id_by_external_id(&self, external_id: &str) -> Result<JobId>;

    /// Compute CPU hours for the job and advance its `usage_last_update`,
    /// both inside one transaction with the job row locked.
    ///
    /// A job whose end date has not landed yet is retried per `retry`,
    /// dropping the transaction between rounds so the end date can be
    /// written by its producer; after the final round the current instant
    /// stands in for the end date.
    async fn compute_usage(
        &self,
        job: JobId,
        retry: EndDateRetry,
    ) -> Result<UsageCalculation>;

    /// Jobs of `user` that can be recalculated over `[from, to]`: reserved
    /// millicores plus both a start and an end date inside the window.
    async fn calculable_jobs(
        &self,
        user: UserId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<JobId>>;

    /// Users that own at least one calculable job, for driving batch
    /// recalculations from the admin surface.
    async fn users_with_calculable_jobs(&self) -> Result<Vec<UserRef>>;
}
