use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EndDateRetry, PersistenceConfig};
use crate::cpuhours::{self, UsageCalculation};
use crate::error::{Result, UsageError};
use crate::event::{apply_to_total, EventId, EventKind, UsageEvent, WorkItem};
use crate::jobs::{JobCatalog, JobId};
use crate::queue::EventQueue;
use crate::registry::{Worker, WorkerId, WorkerRegistry};
use crate::totals::{TotalsStore, UserId, UserRef, UserTotal};

const WORK_ITEM_COLUMNS: &str = r#"
    c.id,
    c.record_date,
    c.effective_date,
    e.name AS event_type,
    c.value,
    c.created_by,
    c.claimed,
    c.claimed_by,
    c.claimed_on,
    c.claim_expires_on,
    c.processing,
    c.processed,
    c.processed_on,
    c.attempts,
    c.max_processing_attempts,
    c.last_modified
"#;

/// PostgreSQL-backed store for events, workers, jobs, and totals.
///
/// All operations go through a shared [`PgPool`]; multi-statement
/// transitions (claim-and-start, finish-and-clear-working, total
/// application) run inside explicit transactions so the janitor can never
/// observe them half-applied.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a fresh pool from persistence configuration.
    pub async fn connect(config: &PersistenceConfig) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(
                config.acquire_timeout_seconds,
            ))
            .connect(&config.connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn work_item_from_row(row: &PgRow) -> Result<WorkItem> {
        let kind_name: String = row.try_get("event_type")?;
        let kind: EventKind = kind_name.parse()?;

        Ok(WorkItem {
            id: EventId(row.try_get("id")?),
            event: UsageEvent {
                record_date: row.try_get("record_date")?,
                effective_date: row.try_get("effective_date")?,
                kind,
                value: row.try_get("value")?,
                created_by: UserId(row.try_get("created_by")?),
            },
            claimed: row.try_get("claimed")?,
            claimed_by: row
                .try_get::<Option<Uuid>, _>("claimed_by")?
                .map(WorkerId),
            claimed_on: row.try_get("claimed_on")?,
            claim_expires_on: row.try_get("claim_expires_on")?,
            processing: row.try_get("processing")?,
            processed: row.try_get("processed")?,
            processed_on: row.try_get("processed_on")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_processing_attempts")?,
            last_modified: row.try_get("last_modified")?,
        })
    }

    fn worker_from_row(row: &PgRow) -> Result<Worker> {
        Ok(Worker {
            id: WorkerId(row.try_get("id")?),
            name: row.try_get("name")?,
            added_on: row.try_get("added_on")?,
            active: row.try_get("active")?,
            activated_on: row.try_get("activated_on")?,
            activation_expires_on: row.try_get("activation_expires_on")?,
            deactivated_on: row.try_get("deactivated_on")?,
            getting_work: row.try_get("getting_work")?,
            getting_work_on: row.try_get("getting_work_on")?,
            getting_work_expires_on: row.try_get("getting_work_expires_on")?,
            working: row.try_get("working")?,
            working_on: row.try_get("working_on")?,
            last_modified: row.try_get("last_modified")?,
        })
    }

    fn total_from_row(row: &PgRow) -> Result<UserTotal> {
        Ok(UserTotal {
            id: row.try_get("id")?,
            user_id: UserId(row.try_get("user_id")?),
            username: row.try_get("username")?,
            total: row.try_get("total")?,
            effective_start: row.try_get("effective_start")?,
            effective_end: row.try_get("effective_end")?,
            last_modified: row.try_get("last_modified")?,
        })
    }
}

#[async_trait]
impl EventQueue for PgStore {
    async fn record_event(&self, event: &UsageEvent) -> Result<EventId> {
        let row = sqlx::query(
            r#"
            INSERT INTO cpu_usage_events
                (record_date, effective_date, event_type_id, value, created_by)
            VALUES
                ($1, $2,
                 (SELECT id FROM cpu_usage_event_types WHERE name = $3),
                 $4, $5)
            RETURNING id
            "#,
        )
        .bind(event.record_date)
        .bind(event.effective_date)
        .bind(event.kind.as_str())
        .bind(event.value)
        .bind(event.created_by.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(EventId(row.try_get("id")?))
    }

    async fn eligible_events(&self, limit: i64) -> Result<Vec<WorkItem>> {
        let query = format!(
            r#"
            SELECT {WORK_ITEM_COLUMNS}
            FROM cpu_usage_events c
            JOIN cpu_usage_event_types e ON c.event_type_id = e.id
            WHERE NOT c.claimed
              AND NOT c.processed
              AND NOT c.processing
              AND c.attempts < c.max_processing_attempts
              AND CURRENT_TIMESTAMP >= COALESCE(c.claim_expires_on, to_timestamp(0))
            ORDER BY c.record_date ASC
            LIMIT $1
            "#
        );

        let rows = sqlx::query(&query).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(Self::work_item_from_row).collect()
    }

    async fn claim_event(
        &self,
        event: EventId,
        worker: WorkerId,
        claim_ttl: Duration,
    ) -> Result<bool> {
        // One guarded statement covers the whole transition into the
        // leased state: claim columns, processing flag, and the attempt
        // counter move together or not at all.
        let res = sqlx::query(
            r#"
            UPDATE cpu_usage_events
            SET claimed = true,
                claimed_by = $2,
                claimed_on = NOW(),
                claim_expires_on = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                processing = true,
                attempts = attempts + 1,
                last_modified = NOW()
            WHERE id = $1
              AND NOT claimed
              AND NOT processing
              AND NOT processed
              AND attempts < max_processing_attempts
              AND CURRENT_TIMESTAMP >= COALESCE(claim_expires_on, to_timestamp(0))
            "#,
        )
        .bind(event.0)
        .bind(worker.0)
        .bind(claim_ttl.num_milliseconds())
        .execute(&self.pool)
        .await?;

        let won = res.rows_affected() == 1;
        if won {
            debug!(event = %event, worker = %worker, "claimed event");
        }
        Ok(won)
    }

    async fn finish_event(&self, event: EventId, worker: WorkerId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            UPDATE cpu_usage_events
            SET processing = false,
                processed = true,
                processed_on = NOW(),
                last_modified = NOW()
            WHERE id = $1
              AND claimed_by = $2
              AND NOT processed
            "#,
        )
        .bind(event.0)
        .bind(worker.0)
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            warn!(
                event = %event,
                worker = %worker,
                "finish matched no row; claim was reassigned or event already processed"
            );
        }

        sqlx::query(
            r#"
            UPDATE cpu_usage_workers
            SET working = false,
                working_on = NULL,
                last_modified = NOW()
            WHERE id = $1
            "#,
        )
        .bind(worker.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn release_event(&self, event: EventId, worker: WorkerId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE cpu_usage_events
            SET processing = false,
                last_modified = NOW()
            WHERE id = $1
              AND claimed_by = $2
              AND NOT processed
            "#,
        )
        .bind(event.0)
        .bind(worker.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE cpu_usage_workers
            SET working = false,
                working_on = NULL,
                last_modified = NOW()
            WHERE id = $1
            "#,
        )
        .bind(worker.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reclaim_expired_claims(&self) -> Result<u64> {
        // Also clears `processing`: a worker that died mid-flight leaves it
        // set, and nothing else would ever make the event eligible again.
        let res = sqlx::query(
            r#"
            UPDATE cpu_usage_events
            SET claimed = false,
                claimed_by = NULL,
                claimed_on = NULL,
                processing = false,
                last_modified = NOW()
            WHERE claimed
              AND NOT processed
              AND CURRENT_TIMESTAMP >= COALESCE(claim_expires_on, to_timestamp(0))
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn reclaim_inactive_worker_claims(&self) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE cpu_usage_events
            SET claimed = false,
                claimed_by = NULL,
                claimed_on = NULL,
                processing = false,
                last_modified = NOW()
            FROM (SELECT id FROM cpu_usage_workers WHERE NOT active) AS inactive
            WHERE claimed
              AND NOT processed
              AND claimed_by = inactive.id
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn list_events(&self) -> Result<Vec<WorkItem>> {
        let query = format!(
            r#"
            SELECT {WORK_ITEM_COLUMNS}
            FROM cpu_usage_events c
            JOIN cpu_usage_event_types e ON c.event_type_id = e.id
            ORDER BY c.record_date ASC
            "#
        );

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::work_item_from_row).collect()
    }

    async fn list_events_for_user(&self, username: &str) -> Result<Vec<WorkItem>> {
        let query = format!(
            r#"
            SELECT {WORK_ITEM_COLUMNS}
            FROM cpu_usage_events c
            JOIN cpu_usage_event_types e ON c.event_type_id = e.id
            JOIN users u ON c.created_by = u.id
            WHERE u.username = $1
            ORDER BY c.record_date ASC
            "#
        );

        let rows = sqlx::query(&query)
            .bind(username)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::work_item_from_row).collect()
    }

    async fn get_event(&self, event: EventId) -> Result<WorkItem> {
        let query = format!(
            r#"
            SELECT {WORK_ITEM_COLUMNS}
            FROM cpu_usage_events c
            JOIN cpu_usage_event_types e ON c.event_type_id = e.id
            WHERE c.id = $1
            "#
        );

        let row = sqlx::query(&query)
            .bind(event.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UsageError::NotFound("event"))?;

        Self::work_item_from_row(&row)
    }

    async fn update_event(&self, item: &WorkItem) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE cpu_usage_events
            SET record_date = $2,
                effective_date = $3,
                event_type_id = (SELECT id FROM cpu_usage_event_types WHERE name = $4),
                value = $5,
                created_by = $6,
                claimed = $7,
                claimed_by = $8,
                claimed_on = $9,
                claim_expires_on = $10,
                processing = $11,
                processed = $12,
                processed_on = $13,
                attempts = $14,
                max_processing_attempts = $15,
                last_modified = NOW()
            WHERE id = $1
            "#,
        )
        .bind(item.id.0)
        .bind(item.event.record_date)
        .bind(item.event.effective_date)
        .bind(item.event.kind.as_str())
        .bind(item.event.value)
        .bind(item.event.created_by.0)
        .bind(item.claimed)
        .bind(item.claimed_by.map(|w| w.0))
        .bind(item.claimed_on)
        .bind(item.claim_expires_on)
        .bind(item.processing)
        .bind(item.processed)
        .bind(item.processed_on)
        .bind(item.attempts)
        .bind(item.max_attempts)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(UsageError::NotFound("event"));
        }
        Ok(())
    }

    async fn delete_event(&self, event: EventId) -> Result<()> {
        let res = sqlx::query("DELETE FROM cpu_usage_events WHERE id = $1")
            .bind(event.0)
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            return Err(UsageError::NotFound("event"));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerRegistry for PgStore {
    async fn register(
        &self,
        name: &str,
        expires_on: DateTime<Utc>,
    ) -> Result<WorkerId> {
        let row = sqlx::query(
            r#"
            INSERT INTO cpu_usage_workers (name, activation_expires_on)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(expires_on)
        .fetch_one(&self.pool)
        .await?;

        Ok(WorkerId(row.try_get("id")?))
    }

    async fn refresh(
        &self,
        worker: WorkerId,
        lifetime: Duration,
    ) -> Result<DateTime<Utc>> {
        let expires_on = Utc::now() + lifetime;

        let res = sqlx::query(
            r#"
            UPDATE cpu_usage_workers
            SET activation_expires_on = $2,
                last_modified = NOW()
            WHERE id = $1
            "#,
        )
        .bind(worker.0)
        .bind(expires_on)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(UsageError::NotFound("worker"));
        }
        Ok(expires_on)
    }

    async fn begin_seeking(
        &self,
        worker: WorkerId,
        expires_on: DateTime<Utc>,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE cpu_usage_workers
            SET getting_work = true,
                getting_work_on = NOW(),
                getting_work_expires_on = $2,
                last_modified = NOW()
            WHERE id = $1
              AND active
            "#,
        )
        .bind(worker.0)
        .bind(expires_on)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(UsageError::NotFound("worker"));
        }
        Ok(())
    }

    async fn done_seeking(&self, worker: WorkerId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cpu_usage_workers
            SET getting_work = false,
                getting_work_on = NULL,
                getting_work_expires_on = NULL,
                last_modified = NOW()
            WHERE id = $1
            "#,
        )
        .bind(worker.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn enter_working(&self, worker: WorkerId) -> Result<()> {
        // Single statement: there is never an instant where the worker is
        // neither seeking nor working while it holds a fresh claim.
        let res = sqlx::query(
            r#"
            UPDATE cpu_usage_workers
            SET getting_work = false,
                getting_work_on = NULL,
                getting_work_expires_on = NULL,
                working = true,
                working_on = NOW(),
                last_modified = NOW()
            WHERE id = $1
              AND active
            "#,
        )
        .bind(worker.0)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(UsageError::NotFound("worker"));
        }
        Ok(())
    }

    async fn set_working(&self, worker: WorkerId, working: bool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cpu_usage_workers
            SET working = $2,
                working_on = CASE WHEN $2 THEN NOW() ELSE NULL END,
                last_modified = NOW()
            WHERE id = $1
            "#,
        )
        .bind(worker.0)
        .bind(working)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn deactivate(&self, worker: WorkerId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cpu_usage_workers
            SET active = false,
                deactivated_on = NOW(),
                getting_work = false,
                last_modified = NOW()
            WHERE id = $1
            "#,
        )
        .bind(worker.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_expired_workers(&self) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE cpu_usage_workers
            SET active = false,
                activation_expires_on = NULL,
                deactivated_on = NOW(),
                last_modified = NOW()
            WHERE active
              AND NOT getting_work
              AND NOT working
              AND CURRENT_TIMESTAMP >= COALESCE(activation_expires_on, to_timestamp(0))
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn purge_expired_seekers(&self) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE cpu_usage_workers
            SET getting_work = false,
                getting_work_on = NULL,
                getting_work_expires_on = NULL,
                last_modified = NOW()
            WHERE active
              AND getting_work
              AND NOT working
              AND CURRENT_TIMESTAMP >= COALESCE(getting_work_expires_on, to_timestamp(0))
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, added_on, active, activated_on,
                   activation_expires_on, deactivated_on,
                   getting_work, getting_work_on, getting_work_expires_on,
                   working, working_on, last_modified
            FROM cpu_usage_workers
            ORDER BY added_on ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::worker_from_row).collect()
    }

    async fn get_worker(&self, worker: WorkerId) -> Result<Worker> {
        let row = sqlx::query(
            r#"
            SELECT id, name, added_on, active, activated_on,
                   activation_expires_on, deactivated_on,
                   getting_work, getting_work_on, getting_work_expires_on,
                   working, working_on, last_modified
            FROM cpu_usage_workers
            WHERE id = $1
            "#,
        )
        .bind(worker.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(UsageError::NotFound("worker"))?;

        Self::worker_from_row(&row)
    }

    async fn delete_worker(&self, worker: WorkerId) -> Result<()> {
        let res = sqlx::query("DELETE FROM cpu_usage_workers WHERE id = $1")
            .bind(worker.0)
            .execute(&self.pool)
            .await?;

        if res.rows_affected() == 0 {
            return Err(UsageError::NotFound("worker"));
        }
        Ok(())
    }
}

#[async_trait]
impl TotalsStore for PgStore {
    async fn username(&self, user: UserId) -> Result<String> {
        let row = sqlx::query("SELECT username FROM users WHERE id = $1")
            .bind(user.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UsageError::NotFound("user"))?;

        Ok(row.try_get("username")?)
    }

    async fn user_id(&self, username: &str) -> Result<UserId> {
        let row = sqlx::query("SELECT id FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UsageError::NotFound("user"))?;

        Ok(UserId(row.try_get("id")?))
    }

    async fn apply_event(
        &self,
        item: &WorkItem,
        new_user_total_days: i64,
    ) -> Result<UserTotal> {
        let mut tx = self.pool.begin().await?;

        let user_row = sqlx::query("SELECT username FROM users WHERE id = $1")
            .bind(item.event.created_by.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(UsageError::NotFound("user"))?;
        let username: String = user_row.try_get("username")?;

        let current = sqlx::query(
            r#"
            SELECT id, total,
                   lower(effective_range) AS effective_start,
                   upper(effective_range) AS effective_end
            FROM cpu_usage_totals
            WHERE user_id = $1
              AND effective_range @> CURRENT_TIMESTAMP
            FOR UPDATE
            "#,
        )
        .bind(item.event.created_by.0)
        .fetch_optional(&mut *tx)
        .await?;

        let (row_id, old_total, effective_start, effective_end) = match current {
            Some(row) => (
                row.try_get::<Uuid, _>("id")?,
                row.try_get::<Decimal, _>("total")?,
                row.try_get::<DateTime<Utc>, _>("effective_start")?,
                row.try_get::<DateTime<Utc>, _>("effective_end")?,
            ),
            None => {
                // First event inside this recording period: seed a fresh
                // zero total covering the configured interval.
                let row = sqlx::query(
                    r#"
                    INSERT INTO cpu_usage_totals (user_id, total, effective_range)
                    VALUES ($1, 0,
                            tstzrange(NOW(), NOW() + make_interval(days => $2::int)))
                    RETURNING id,
                              lower(effective_range) AS effective_start,
                              upper(effective_range) AS effective_end
                    "#,
                )
                .bind(item.event.created_by.0)
                .bind(new_user_total_days as i32)
                .fetch_one(&mut *tx)
                .await?;

                (
                    row.try_get::<Uuid, _>("id")?,
                    Decimal::ZERO,
                    row.try_get::<DateTime<Utc>, _>("effective_start")?,
                    row.try_get::<DateTime<Utc>, _>("effective_end")?,
                )
            }
        };

        let new_total = apply_to_total(item.event.kind, old_total, item.event.value)?;

        let updated = sqlx::query(
            r#"
            UPDATE cpu_usage_totals
            SET total = $2,
                last_modified = NOW()
            WHERE id = $1
            RETURNING last_modified
            "#,
        )
        .bind(row_id)
        .bind(new_total)
        .fetch_one(&mut *tx)
        .await?;
        let last_modified: DateTime<Utc> = updated.try_get("last_modified")?;

        tx.commit().await?;

        info!(
            user = %username,
            event = %item.id,
            kind = %item.event.kind,
            value = %item.event.value,
            total = %new_total,
            "applied event to total"
        );

        Ok(UserTotal {
            id: row_id,
            user_id: item.event.created_by,
            username,
            total: new_total,
            effective_start,
            effective_end,
            last_modified,
        })
    }

    async fn current_total_for_user(&self, username: &str) -> Result<UserTotal> {
        let row = sqlx::query(
            r#"
            SELECT t.id, t.user_id, u.username, t.total,
                   lower(t.effective_range) AS effective_start,
                   upper(t.effective_range) AS effective_end,
                   t.last_modified
            FROM cpu_usage_totals t
            JOIN users u ON t.user_id = u.id
            WHERE u.username = $1
              AND t.effective_range @> CURRENT_TIMESTAMP
            LIMIT 1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(UsageError::NotFound("user total"))?;

        Self::total_from_row(&row)
    }

    async fn all_totals_for_user(&self, username: &str) -> Result<Vec<UserTotal>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.user_id, u.username, t.total,
                   lower(t.effective_range) AS effective_start,
                   upper(t.effective_range) AS effective_end,
                   t.last_modified
            FROM cpu_usage_totals t
            JOIN users u ON t.user_id = u.id
            WHERE u.username = $1
            ORDER BY lower(t.effective_range) ASC
            "#,
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::total_from_row).collect()
    }

    async fn all_current_totals(&self) -> Result<Vec<UserTotal>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.user_id, u.username, t.total,
                   lower(t.effective_range) AS effective_start,
                   upper(t.effective_range) AS effective_end,
                   t.last_modified
            FROM cpu_usage_totals t
            JOIN users u ON t.user_id = u.id
            WHERE t.effective_range @> CURRENT_TIMESTAMP
            ORDER BY u.username ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::total_from_row).collect()
    }

    async fn all_totals(&self) -> Result<Vec<UserTotal>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.user_id, u.username, t.total,
                   lower(t.effective_range) AS effective_start,
                   upper(t.effective_range) AS effective_end,
                   t.last_modified
            FROM cpu_usage_totals t
            JOIN users u ON t.user_id = u.id
            ORDER BY u.username ASC, lower(t.effective_range) ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::total_from_row).collect()
    }
}

#[async_trait]
impl JobCatalog for PgStore {
    async fn job_id_by_external_id(&self, external_id: &str) -> Result<JobId> {
        let row = sqlx::query(
            r#"
            SELECT j.id
            FROM jobs j
            JOIN job_steps s ON s.job_id = j.id
            WHERE s.external_id = $1
            LIMIT 1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(UsageError::NotFound("job step"))?;

        Ok(JobId(row.try_get("id")?))
    }

    async fn compute_usage(
        &self,
        job: JobId,
        retry: EndDateRetry,
    ) -> Result<UsageCalculation> {
        let mut round = 0;
        loop {
            let mut tx = self.pool.begin().await?;

            let row = sqlx::query(
                r#"
                SELECT id, user_id, start_date, end_date,
                       millicores_reserved, usage_last_update
                FROM jobs
                WHERE id = $1
                FOR NO KEY UPDATE
                "#,
            )
            .bind(job.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(UsageError::NotFound("job"))?;

            let start: Option<DateTime<Utc>> = row.try_get("start_date")?;
            let start = start.ok_or_else(|| {
                UsageError::InvariantViolation(format!(
                    "job {job} has no start date"
                ))
            })?;
            let end: Option<DateTime<Utc>> = row.try_get("end_date")?;
            let user = UserId(row.try_get("user_id")?);
            let millicores: i64 = row.try_get("millicores_reserved")?;
            let usage_last_update: Option<DateTime<Utc>> =
                row.try_get("usage_last_update")?;

            // The end date may lag the state notification; drop the lock
            // so whoever records it can, and come back around.
            let calc = match end {
                Some(end) => end,
                None if round < retry.rounds => {
                    round += 1;
                    drop(tx);
                    tokio::time::sleep(retry.pause()).await;
                    continue;
                }
                None => {
                    info!(job = %job, "end date still unset after retries, using current time");
                    Utc::now()
                }
            };

            let basis = cpuhours::usage_basis(start, usage_last_update);
            let hours = cpuhours::cpu_hours(millicores, basis, calc)?;

            sqlx::query(
                r#"
                UPDATE jobs
                SET usage_last_update = $2
                WHERE id = $1
                "#,
            )
            .bind(job.0)
            .bind(calc)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            return Ok(UsageCalculation {
                job,
                user,
                millicores,
                cpu_hours: hours,
                basis,
                calc,
            });
        }
    }

    async fn calculable_jobs(
        &self,
        user: UserId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            r#"
            SELECT id
            FROM jobs
            WHERE user_id = $1
              AND millicores_reserved > 0
              AND start_date IS NOT NULL
              AND end_date IS NOT NULL
              AND start_date >= $2
              AND end_date <= $3
            ORDER BY start_date ASC
            "#,
        )
        .bind(user.0)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(JobId(row.try_get("id")?)))
            .collect()
    }

    async fn users_with_calculable_jobs(&self) -> Result<Vec<UserRef>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT u.id, u.username
            FROM users u
            JOIN jobs j ON j.user_id = u.id
            WHERE j.millicores_reserved > 0
              AND j.start_date IS NOT NULL
              AND j.end_date IS NOT NULL
            ORDER BY u.username ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(UserRef {
                    id: UserId(row.try_get("id")?),
                    username: row.try_get("username")?,
                })
            })
            .collect()
    }
}
