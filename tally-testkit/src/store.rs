use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use uuid::Uuid;

use tally::cpuhours::{self, UsageCalculation};
use tally::{
    apply_to_total, EndDateRetry, EventId, EventQueue, Job, JobCatalog, JobId,
    Result, TotalsStore, UsageError, UsageEvent, UserId, UserRef, UserTotal,
    WorkItem, Worker, WorkerId, WorkerRegistry,
};

const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Clone, Debug)]
struct TotalRow {
    id: Uuid,
    user_id: UserId,
    total: Decimal,
    effective_start: DateTime<Utc>,
    effective_end: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    users: HashMap<UserId, String>,
    jobs: HashMap<JobId, Job>,
    steps: HashMap<String, JobId>,
    events: Vec<WorkItem>,
    workers: HashMap<WorkerId, Worker>,
    totals: Vec<TotalRow>,
}

impl State {
    fn event_mut(&mut self, id: EventId) -> Option<&mut WorkItem> {
        self.events.iter_mut().find(|item| item.id == id)
    }

    fn user_total(&self, row: &TotalRow) -> Result<UserTotal> {
        let username = self
            .users
            .get(&row.user_id)
            .ok_or(UsageError::NotFound("user"))?
            .clone();
        Ok(UserTotal {
            id: row.id,
            user_id: row.user_id,
            username,
            total: row.total,
            effective_start: row.effective_start,
            effective_end: row.effective_end,
            last_modified: row.last_modified,
        })
    }
}

/// In-memory double of the Postgres store.
///
/// Events keep their insertion order, claims and purges follow the same
/// predicates as the SQL implementation, and totals use the same half-open
/// effective ranges.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user, returning its id.
    pub fn add_user(&self, username: &str) -> UserId {
        let id = UserId::new();
        self.inner.lock().users.insert(id, username.to_string());
        id
    }

    /// Seed a job, returning its id.
    pub fn add_job(
        &self,
        user: UserId,
        millicores_reserved: i64,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
    ) -> JobId {
        let id = JobId(Uuid::now_v7());
        self.inner.lock().jobs.insert(
            id,
            Job {
                id,
                user_id: user,
                start_date,
                end_date,
                millicores_reserved,
                usage_last_update: None,
            },
        );
        id
    }

    /// Attach an externally visible step id to a job.
    pub fn add_job_step(&self, job: JobId, external_id: &str) {
        self.inner.lock().steps.insert(external_id.to_string(), job);
    }

    /// Record a job's end date after the fact.
    pub fn set_job_end(&self, job: JobId, end_date: DateTime<Utc>) {
        if let Some(job) = self.inner.lock().jobs.get_mut(&job) {
            job.end_date = Some(end_date);
        }
    }

    /// The job's current `usage_last_update`.
    pub fn usage_last_update(&self, job: JobId) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .jobs
            .get(&job)
            .and_then(|job| job.usage_last_update)
    }

    /// Force an event's claim to look expired.
    pub fn expire_claim(&self, event: EventId) {
        if let Some(item) = self.inner.lock().event_mut(event) {
            item.claim_expires_on = Some(Utc::now() - Duration::seconds(1));
        }
    }

    /// Force a worker's activation to look expired.
    pub fn expire_worker_activation(&self, worker: WorkerId) {
        if let Some(worker) = self.inner.lock().workers.get_mut(&worker) {
            worker.activation_expires_on =
                Some(Utc::now() - Duration::seconds(1));
        }
    }

    /// Force a worker's seek window to look expired.
    pub fn expire_seeking(&self, worker: WorkerId) {
        if let Some(worker) = self.inner.lock().workers.get_mut(&worker) {
            worker.getting_work_expires_on =
                Some(Utc::now() - Duration::seconds(1));
        }
    }
}

#[async_trait]
impl EventQueue for InMemoryStore {
    async fn record_event(&self, event: &UsageEvent) -> Result<EventId> {
        let id = EventId::new();
        self.inner.lock().events.push(WorkItem {
            id,
            event: event.clone(),
            claimed: false,
            claimed_by: None,
            claimed_on: None,
            claim_expires_on: None,
            processing: false,
            processed: false,
            processed_on: None,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_modified: Utc::now(),
        });
        Ok(id)
    }

    async fn eligible_events(&self, limit: i64) -> Result<Vec<WorkItem>> {
        let now = Utc::now();
        Ok(self
            .inner
            .lock()
            .events
            .iter()
            .filter(|item| item.eligible(now))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn claim_event(
        &self,
        event: EventId,
        worker: WorkerId,
        claim_ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        let Some(item) = state.event_mut(event) else {
            return Ok(false);
        };
        if !item.eligible(now) {
            return Ok(false);
        }

        item.claimed = true;
        item.claimed_by = Some(worker);
        item.claimed_on = Some(now);
        item.claim_expires_on = Some(now + claim_ttl);
        item.processing = true;
        item.attempts += 1;
        item.last_modified = now;
        Ok(true)
    }

    async fn finish_event(&self, event: EventId, worker: WorkerId) -> Result<()> {
        let now = Utc::now();
        let mut state = self.inner.lock();

        if let Some(item) = state.event_mut(event) {
            if item.claimed_by == Some(worker) && !item.processed {
                item.processing = false;
                item.processed = true;
                item.processed_on = Some(now);
                item.last_modified = now;
            }
        }

        if let Some(worker) = state.workers.get_mut(&worker) {
            worker.working = false;
            worker.working_on = None;
            worker.last_modified = now;
        }
        Ok(())
    }

    async fn release_event(&self, event: EventId, worker: WorkerId) -> Result<()> {
        let now = Utc::now();
        let mut state = self.inner.lock();

        if let Some(item) = state.event_mut(event) {
            if item.claimed_by == Some(worker) && !item.processed {
                item.processing = false;
                item.last_modified = now;
            }
        }

        if let Some(worker) = state.workers.get_mut(&worker) {
            worker.working = false;
            worker.working_on = None;
            worker.last_modified = now;
        }
        Ok(())
    }

    async fn reclaim_expired_claims(&self) -> Result<u64> {
        let now = Utc::now();
        let mut reclaimed = 0;
        for item in &mut self.inner.lock().events {
            let expired = item
                .claim_expires_on
                .map_or(true, |expires| now >= expires);
            if item.claimed && !item.processed && expired {
                item.claimed = false;
                item.claimed_by = None;
                item.claimed_on = None;
                item.processing = false;
                item.last_modified = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn reclaim_inactive_worker_claims(&self) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        let inactive: Vec<WorkerId> = state
            .workers
            .values()
            .filter(|worker| !worker.active)
            .map(|worker| worker.id)
            .collect();

        let mut reclaimed = 0;
        for item in &mut state.events {
            let held_by_inactive = item
                .claimed_by
                .map_or(false, |claimer| inactive.contains(&claimer));
            if item.claimed && !item.processed && held_by_inactive {
                item.claimed = false;
                item.claimed_by = None;
                item.claimed_on = None;
                item.processing = false;
                item.last_modified = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn list_events(&self) -> Result<Vec<WorkItem>> {
        Ok(self.inner.lock().events.clone())
    }

    async fn list_events_for_user(&self, username: &str) -> Result<Vec<WorkItem>> {
        let state = self.inner.lock();
        let user = state
            .users
            .iter()
            .find(|(_, name)| name.as_str() == username)
            .map(|(id, _)| *id)
            .ok_or(UsageError::NotFound("user"))?;

        Ok(state
            .events
            .iter()
            .filter(|item| item.event.created_by == user)
            .cloned()
            .collect())
    }

    async fn get_event(&self, event: EventId) -> Result<WorkItem> {
        self.inner
            .lock()
            .events
            .iter()
            .find(|item| item.id == event)
            .cloned()
            .ok_or(UsageError::NotFound("event"))
    }

    async fn update_event(&self, item: &WorkItem) -> Result<()> {
        let mut state = self.inner.lock();
        let existing = state
            .event_mut(item.id)
            .ok_or(UsageError::NotFound("event"))?;
        *existing = item.clone();
        existing.last_modified = Utc::now();
        Ok(())
    }

    async fn delete_event(&self, event: EventId) -> Result<()> {
        let mut state = self.inner.lock();
        let before = state.events.len();
        state.events.retain(|item| item.id != event);
        if state.events.len() == before {
            return Err(UsageError::NotFound("event"));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryStore {
    async fn register(
        &self,
        name: &str,
        expires_on: DateTime<Utc>,
    ) -> Result<WorkerId> {
        let now = Utc::now();
        let id = WorkerId(Uuid::now_v7());
        self.inner.lock().workers.insert(
            id,
            Worker {
                id,
                name: name.to_string(),
                added_on: now,
                active: true,
                activated_on: now,
                activation_expires_on: Some(expires_on),
                deactivated_on: None,
                getting_work: false,
                getting_work_on: None,
                getting_work_expires_on: None,
                working: false,
                working_on: None,
                last_modified: now,
            },
        );
        Ok(id)
    }

    async fn refresh(
        &self,
        worker: WorkerId,
        lifetime: Duration,
    ) -> Result<DateTime<Utc>> {
        let expires_on = Utc::now() + lifetime;
        let mut state = self.inner.lock();
        let worker = state
            .workers
            .get_mut(&worker)
            .ok_or(UsageError::NotFound("worker"))?;
        worker.activation_expires_on = Some(expires_on);
        worker.last_modified = Utc::now();
        Ok(expires_on)
    }

    async fn begin_seeking(
        &self,
        worker: WorkerId,
        expires_on: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        let worker = state
            .workers
            .get_mut(&worker)
            .filter(|worker| worker.active)
            .ok_or(UsageError::NotFound("worker"))?;
        worker.getting_work = true;
        worker.getting_work_on = Some(now);
        worker.getting_work_expires_on = Some(expires_on);
        worker.last_modified = now;
        Ok(())
    }

    async fn done_seeking(&self, worker: WorkerId) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(worker) = state.workers.get_mut(&worker) {
            worker.getting_work = false;
            worker.getting_work_on = None;
            worker.getting_work_expires_on = None;
            worker.last_modified = Utc::now();
        }
        Ok(())
    }

    async fn enter_working(&self, worker: WorkerId) -> Result<()> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        let worker = state
            .workers
            .get_mut(&worker)
            .filter(|worker| worker.active)
            .ok_or(UsageError::NotFound("worker"))?;
        worker.getting_work = false;
        worker.getting_work_on = None;
        worker.getting_work_expires_on = None;
        worker.working = true;
        worker.working_on = Some(now);
        worker.last_modified = now;
        Ok(())
    }

    async fn set_working(&self, worker: WorkerId, working: bool) -> Result<()> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        if let Some(worker) = state.workers.get_mut(&worker) {
            worker.working = working;
            worker.working_on = working.then_some(now);
            worker.last_modified = now;
        }
        Ok(())
    }

    async fn deactivate(&self, worker: WorkerId) -> Result<()> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        if let Some(worker) = state.workers.get_mut(&worker) {
            worker.active = false;
            worker.deactivated_on = Some(now);
            worker.getting_work = false;
            worker.last_modified = now;
        }
        Ok(())
    }

    async fn purge_expired_workers(&self) -> Result<u64> {
        let now = Utc::now();
        let mut purged = 0;
        for worker in self.inner.lock().workers.values_mut() {
            let expired = worker
                .activation_expires_on
                .map_or(true, |expires| now >= expires);
            if worker.active && !worker.getting_work && !worker.working && expired
            {
                worker.active = false;
                worker.activation_expires_on = None;
                worker.deactivated_on = Some(now);
                worker.last_modified = now;
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn purge_expired_seekers(&self) -> Result<u64> {
        let now = Utc::now();
        let mut purged = 0;
        for worker in self.inner.lock().workers.values_mut() {
            let expired = worker
                .getting_work_expires_on
                .map_or(true, |expires| now >= expires);
            if worker.active && worker.getting_work && !worker.working && expired
            {
                worker.getting_work = false;
                worker.getting_work_on = None;
                worker.getting_work_expires_on = None;
                worker.last_modified = now;
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn list_workers(&self) -> Result<Vec<Worker>> {
        let mut workers: Vec<Worker> =
            self.inner.lock().workers.values().cloned().collect();
        workers.sort_by_key(|worker| worker.added_on);
        Ok(workers)
    }

    async fn get_worker(&self, worker: WorkerId) -> Result<Worker> {
        self.inner
            .lock()
            .workers
            .get(&worker)
            .cloned()
            .ok_or(UsageError::NotFound("worker"))
    }

    async fn delete_worker(&self, worker: WorkerId) -> Result<()> {
        self.inner
            .lock()
            .workers
            .remove(&worker)
            .map(|_| ())
            .ok_or(UsageError::NotFound("worker"))
    }
}

#[async_trait]
impl TotalsStore for InMemoryStore {
    async fn username(&self, user: UserId) -> Result<String> {
        self.inner
            .lock()
            .users
            .get(&user)
            .cloned()
            .ok_or(UsageError::NotFound("user"))
    }

    async fn user_id(&self, username: &str) -> Result<UserId> {
        self.inner
            .lock()
            .users
            .iter()
            .find(|(_, name)| name.as_str() == username)
            .map(|(id, _)| *id)
            .ok_or(UsageError::NotFound("user"))
    }

    async fn apply_event(
        &self,
        item: &WorkItem,
        new_user_total_days: i64,
    ) -> Result<UserTotal> {
        let now = Utc::now();
        let mut state = self.inner.lock();

        if !state.users.contains_key(&item.event.created_by) {
            return Err(UsageError::NotFound("user"));
        }

        let position = state.totals.iter().position(|row| {
            row.user_id == item.event.created_by
                && row.effective_start <= now
                && now < row.effective_end
        });

        let position = match position {
            Some(position) => position,
            None => {
                state.totals.push(TotalRow {
                    id: Uuid::now_v7(),
                    user_id: item.event.created_by,
                    total: Decimal::ZERO,
                    effective_start: now,
                    effective_end: now + Duration::days(new_user_total_days),
                    last_modified: now,
                });
                state.totals.len() - 1
            }
        };

        let new_total = apply_to_total(
            item.event.kind,
            state.totals[position].total,
            item.event.value,
        )?;
        state.totals[position].total = new_total;
        state.totals[position].last_modified = now;

        let row = state.totals[position].clone();
        state.user_total(&row)
    }

    async fn current_total_for_user(&self, username: &str) -> Result<UserTotal> {
        let now = Utc::now();
        let state = self.inner.lock();
        let user = state
            .users
            .iter()
            .find(|(_, name)| name.as_str() == username)
            .map(|(id, _)| *id)
            .ok_or(UsageError::NotFound("user"))?;

        let row = state
            .totals
            .iter()
            .find(|row| {
                row.user_id == user
                    && row.effective_start <= now
                    && now < row.effective_end
            })
            .cloned()
            .ok_or(UsageError::NotFound("user total"))?;

        state.user_total(&row)
    }

    async fn all_totals_for_user(&self, username: &str) -> Result<Vec<UserTotal>> {
        let state = self.inner.lock();
        let user = state
            .users
            .iter()
            .find(|(_, name)| name.as_str() == username)
            .map(|(id, _)| *id)
            .ok_or(UsageError::NotFound("user"))?;

        state
            .totals
            .iter()
            .filter(|row| row.user_id == user)
            .map(|row| state.user_total(row))
            .collect()
    }

    async fn all_current_totals(&self) -> Result<Vec<UserTotal>> {
        let now = Utc::now();
        let state = self.inner.lock();
        state
            .totals
            .iter()
            .filter(|row| row.effective_start <= now && now < row.effective_end)
            .map(|row| state.user_total(row))
            .collect()
    }

    async fn all_totals(&self) -> Result<Vec<UserTotal>> {
        let state = self.inner.lock();
        state
            .totals
            .iter()
            .map(|row| state.user_total(row))
            .collect()
    }
}

#[async_trait]
impl JobCatalog for InMemoryStore {
    async fn job_id_by_external_id(&self, external_id: &str) -> Result<JobId> {
        self.inner
            .lock()
            .steps
            .get(external_id)
            .copied()
            .ok_or(UsageError::NotFound("job step"))
    }

    async fn compute_usage(
        &self,
        job: JobId,
        retry: EndDateRetry,
    ) -> Result<UsageCalculation> {
        let mut round = 0;
        loop {
            let snapshot = self
                .inner
                .lock()
                .jobs
                .get(&job)
                .cloned()
                .ok_or(UsageError::NotFound("job"))?;

            let start = snapshot.start_date.ok_or_else(|| {
                UsageError::InvariantViolation(format!(
                    "job {job} has no start date"
                ))
            })?;

            let calc = match snapshot.end_date {
                Some(end) => end,
                None if round < retry.rounds => {
                    round += 1;
                    tokio::time::sleep(retry.pause()).await;
                    continue;
                }
                None => Utc::now(),
            };

            let basis = cpuhours::usage_basis(start, snapshot.usage_last_update);
            let hours = cpuhours::cpu_hours(
                snapshot.millicores_reserved,
                basis,
                calc,
            )?;

            if let Some(job) = self.inner.lock().jobs.get_mut(&job) {
                job.usage_last_update = Some(calc);
            }

            return Ok(UsageCalculation {
                job,
                user: snapshot.user_id,
                millicores: snapshot.millicores_reserved,
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
        let state = self.inner.lock();
        let mut jobs: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| {
                job.user_id == user
                    && job.millicores_reserved > 0
                    && job.start_date.map_or(false, |start| start >= from)
                    && job.end_date.map_or(false, |end| end <= to)
            })
            .collect();
        jobs.sort_by_key(|job| job.start_date);
        Ok(jobs.iter().map(|job| job.id).collect())
    }

    async fn users_with_calculable_jobs(&self) -> Result<Vec<UserRef>> {
        let state = self.inner.lock();
        let mut users: Vec<UserRef> = state
            .users
            .iter()
            .filter(|(id, _)| {
                state.jobs.values().any(|job| {
                    job.user_id == **id
                        && job.millicores_reserved > 0
                        && job.start_date.is_some()
                        && job.end_date.is_some()
                })
            })
            .map(|(id, username)| UserRef {
                id: *id,
                username: username.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }
}
