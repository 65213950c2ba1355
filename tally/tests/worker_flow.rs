//! End-to-end worker-flow tests over the in-memory store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use tally::runtime::{DrainSignal, WorkerLoop};
use tally::{
    admin, EndDateRetry, EventKind, EventQueue, JobCatalog, Recorder,
    TotalsStore, UsageConfig, UsageEvent, UsagePublisher, WorkerId,
    WorkerRegistry,
};
use tally_testkit::{FailingPublisher, InMemoryStore, RecordingPublisher};

fn test_config() -> UsageConfig {
    UsageConfig {
        idle_sleep_secs: 0,
        ..UsageConfig::default()
    }
}

fn instant(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

async fn register(store: &InMemoryStore, name: &str) -> WorkerId {
    store
        .register(name, Utc::now() + Duration::hours(1))
        .await
        .expect("register worker")
}

fn worker_loop<P: UsagePublisher>(
    store: &Arc<InMemoryStore>,
    publisher: P,
    worker: WorkerId,
) -> WorkerLoop<InMemoryStore, P> {
    WorkerLoop::new(
        Arc::clone(store),
        Arc::new(publisher),
        test_config(),
        worker,
        "test-worker",
        DrainSignal::new(),
    )
}

#[tokio::test]
async fn happy_path_from_job_update_to_published_total() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("wregglej");
    let job = store.add_job(
        user,
        2000,
        Some(instant("2024-01-01T00:00:00Z")),
        Some(instant("2024-01-01T02:00:00Z")),
    );
    store.add_job_step(job, "extern-1");

    let recorder = Recorder::new(Arc::clone(&store), EndDateRetry::immediate(0));
    let update: tally::JobUpdate = serde_json::from_str(
        r#"{"Job": {"uuid": "extern-1"}, "State": "Succeeded"}"#,
    )
    .unwrap();

    let event_id = recorder
        .handle_update(&update)
        .await
        .expect("handle update")
        .expect("event enqueued");

    // 2000 millicores for two hours: 4 cpu-hours, and the job's usage
    // cursor moves to the end date.
    let item = store.get_event(event_id).await.unwrap();
    assert_eq!(item.event.value, dec("4"));
    assert_eq!(item.event.kind, EventKind::Add);
    assert_eq!(
        store.usage_last_update(job),
        Some(instant("2024-01-01T02:00:00Z"))
    );

    let worker = register(&store, "w1").await;
    let publisher = RecordingPublisher::new();
    let processed = worker_loop(&store, publisher.clone(), worker)
        .iteration()
        .await
        .expect("iteration processes the event");
    assert_eq!(processed.id, event_id);

    let total = store.current_total_for_user("wregglej").await.unwrap();
    assert_eq!(total.total, dec("4"));

    let item = store.get_event(event_id).await.unwrap();
    assert!(item.processed);
    assert!(!item.processing);
    assert_eq!(item.attempts, 1);

    let registered = store.get_worker(worker).await.unwrap();
    assert!(!registered.working);
    assert!(!registered.getting_work);

    let sent = publisher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "qms.user.usages.add");
    assert_eq!(sent[0].1.username, "wregglej");
    assert_eq!(sent[0].1.value, 4.0);
    assert_eq!(sent[0].1.operation, "ADD");
}

#[tokio::test]
async fn zero_millicores_job_enqueues_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("idle");
    let job = store.add_job(
        user,
        0,
        Some(instant("2024-01-01T00:00:00Z")),
        Some(instant("2024-01-01T02:00:00Z")),
    );
    store.add_job_step(job, "extern-idle");

    let recorder = Recorder::new(Arc::clone(&store), EndDateRetry::immediate(0));
    let enqueued = recorder
        .calculate_for_job("extern-idle")
        .await
        .expect("calculation succeeds");

    assert!(enqueued.is_none());
    assert!(store.list_events().await.unwrap().is_empty());
    // The usage cursor still advances.
    assert_eq!(
        store.usage_last_update(job),
        Some(instant("2024-01-01T02:00:00Z"))
    );
}

#[tokio::test]
async fn missing_end_date_falls_back_to_now() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("runner");
    let job = store.add_job(user, 1000, Some(Utc::now() - Duration::hours(1)), None);
    store.add_job_step(job, "extern-running");

    let recorder = Recorder::new(Arc::clone(&store), EndDateRetry::immediate(2));
    let event_id = recorder
        .calculate_for_job("extern-running")
        .await
        .expect("fallback calculation")
        .expect("event enqueued");

    let item = store.get_event(event_id).await.unwrap();
    // Roughly an hour of one core.
    assert!(item.event.value > dec("0.9"));
    assert!(item.event.value < dec("1.1"));
    assert!(store.usage_last_update(job).is_some());
}

#[tokio::test]
async fn claim_race_second_worker_loses() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("raced");
    let event_id = store
        .record_event(&UsageEvent::now(EventKind::Add, dec("1"), user))
        .await
        .unwrap();

    let w1 = register(&store, "w1").await;
    let w2 = register(&store, "w2").await;
    let ttl = Duration::minutes(2);

    assert!(store.claim_event(event_id, w1, ttl).await.unwrap());
    assert!(!store.claim_event(event_id, w2, ttl).await.unwrap());

    let item = store.get_event(event_id).await.unwrap();
    assert_eq!(item.claimed_by, Some(w1));
    assert_eq!(item.attempts, 1);
}

#[tokio::test]
async fn expired_claim_is_reclaimed_and_retried() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("crashed");
    let event_id = store
        .record_event(&UsageEvent::now(EventKind::Add, dec("1"), user))
        .await
        .unwrap();

    // Worker one claims and dies mid-flight, leaving the processing flag
    // set. Once the claim lapses the janitor recycles the event whole.
    let w1 = register(&store, "w1").await;
    assert!(store
        .claim_event(event_id, w1, Duration::minutes(2))
        .await
        .unwrap());
    store.expire_claim(event_id);

    let reclaimed = store.reclaim_expired_claims().await.unwrap();
    assert_eq!(reclaimed, 1);

    let item = store.get_event(event_id).await.unwrap();
    assert!(!item.claimed);
    assert!(!item.processing);
    assert!(!item.processed);
    assert_eq!(item.attempts, 1);

    let w2 = register(&store, "w2").await;
    assert!(store
        .claim_event(event_id, w2, Duration::minutes(2))
        .await
        .unwrap());

    let item = store.get_event(event_id).await.unwrap();
    assert_eq!(item.claimed_by, Some(w2));
    assert!(item.attempts >= 2);
}

#[tokio::test]
async fn reclaim_is_idempotent() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("idem");
    let event_id = store
        .record_event(&UsageEvent::now(EventKind::Add, dec("1"), user))
        .await
        .unwrap();

    let w1 = register(&store, "w1").await;
    assert!(store
        .claim_event(event_id, w1, Duration::minutes(2))
        .await
        .unwrap());
    store.expire_claim(event_id);

    assert_eq!(store.reclaim_expired_claims().await.unwrap(), 1);
    let after_first = store.get_event(event_id).await.unwrap();

    assert_eq!(store.reclaim_expired_claims().await.unwrap(), 0);
    let after_second = store.get_event(event_id).await.unwrap();

    assert_eq!(after_first.claimed, after_second.claimed);
    assert_eq!(after_first.attempts, after_second.attempts);
    assert_eq!(after_first.processing, after_second.processing);
}

#[tokio::test]
async fn working_worker_survives_activation_expiry() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("protected");
    let event_id = store
        .record_event(&UsageEvent::now(EventKind::Add, dec("1"), user))
        .await
        .unwrap();

    let worker = register(&store, "w1").await;
    store
        .begin_seeking(worker, Utc::now() + Duration::minutes(2))
        .await
        .unwrap();
    assert!(store
        .claim_event(event_id, worker, Duration::minutes(2))
        .await
        .unwrap());
    store.enter_working(worker).await.unwrap();

    // Activation lapses while the worker is mid-event: the janitor must
    // leave it alone.
    store.expire_worker_activation(worker);
    assert_eq!(store.purge_expired_workers().await.unwrap(), 0);
    assert!(store.get_worker(worker).await.unwrap().active);

    // After the work finishes the expired activation catches up with it.
    store.finish_event(event_id, worker).await.unwrap();
    assert_eq!(store.purge_expired_workers().await.unwrap(), 1);
    assert!(!store.get_worker(worker).await.unwrap().active);
}

#[tokio::test]
async fn stuck_seeker_is_cleared_but_working_worker_is_not() {
    let store = Arc::new(InMemoryStore::new());
    let stuck = register(&store, "stuck").await;
    let busy = register(&store, "busy").await;

    store
        .begin_seeking(stuck, Utc::now() + Duration::minutes(2))
        .await
        .unwrap();
    store.expire_seeking(stuck);

    store.set_working(busy, true).await.unwrap();
    store
        .begin_seeking(busy, Utc::now() + Duration::minutes(2))
        .await
        .unwrap();
    store.expire_seeking(busy);

    // Only the quiescent seeker is swept; a working worker keeps its
    // flags until it finishes.
    assert_eq!(store.purge_expired_seekers().await.unwrap(), 1);
    assert!(!store.get_worker(stuck).await.unwrap().getting_work);
    assert!(store.get_worker(busy).await.unwrap().getting_work);
}

#[tokio::test]
async fn inactive_worker_claims_are_reset() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("lingering");
    let event_id = store
        .record_event(&UsageEvent::now(EventKind::Add, dec("1"), user))
        .await
        .unwrap();

    let worker = register(&store, "w1").await;
    assert!(store
        .claim_event(event_id, worker, Duration::minutes(2))
        .await
        .unwrap());

    // The worker abandons the event, its activation lapses, and the purge
    // deactivates it with the claim still attached.
    store.release_event(event_id, worker).await.unwrap();
    store.expire_worker_activation(worker);
    assert_eq!(store.purge_expired_workers().await.unwrap(), 1);

    assert_eq!(store.reclaim_inactive_worker_claims().await.unwrap(), 1);

    let item = store.get_event(event_id).await.unwrap();
    assert!(!item.claimed);
    assert!(item.claimed_by.is_none());
    assert!(!item.processed);
}

#[tokio::test]
async fn first_event_creates_single_total_row() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("fresh");
    let worker = register(&store, "w1").await;
    let publisher = RecordingPublisher::new();
    let loop_ = worker_loop(&store, publisher, worker);

    store
        .record_event(&UsageEvent::now(EventKind::Add, dec("4"), user))
        .await
        .unwrap();
    loop_.iteration().await.expect("first event processed");

    let totals = store.all_totals_for_user("fresh").await.unwrap();
    assert_eq!(totals.len(), 1);
    assert_eq!(totals[0].total, dec("4"));
    assert!(totals[0].effective_end > totals[0].effective_start);

    store
        .record_event(&UsageEvent::now(EventKind::Add, dec("1.5"), user))
        .await
        .unwrap();
    loop_.iteration().await.expect("second event processed");

    let totals = store.all_totals_for_user("fresh").await.unwrap();
    assert_eq!(totals.len(), 1, "subsequent events reuse the current row");
    assert_eq!(totals[0].total, dec("5.5"));
}

#[tokio::test]
async fn reset_event_zeroes_total_and_is_not_published() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("resetme");
    let worker = register(&store, "w1").await;
    let publisher = RecordingPublisher::new();
    let loop_ = worker_loop(&store, publisher.clone(), worker);

    store
        .record_event(&UsageEvent::now(EventKind::Add, dec("12.5"), user))
        .await
        .unwrap();
    loop_.iteration().await.expect("seed total");
    assert_eq!(
        store.current_total_for_user("resetme").await.unwrap().total,
        dec("12.5")
    );

    store
        .record_event(&UsageEvent::now(EventKind::Reset, dec("0"), user))
        .await
        .unwrap();
    loop_.iteration().await.expect("reset processed");

    assert_eq!(
        store.current_total_for_user("resetme").await.unwrap().total,
        Decimal::ZERO
    );

    // Only the Add went out; resets stay internal.
    assert_eq!(publisher.sent().len(), 1);
}

#[tokio::test]
async fn publish_failure_still_finishes_event() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("unlucky");
    let worker = register(&store, "w1").await;
    let loop_ = worker_loop(&store, FailingPublisher, worker);

    let event_id = store
        .record_event(&UsageEvent::now(EventKind::Add, dec("2"), user))
        .await
        .unwrap();
    loop_
        .iteration()
        .await
        .expect("event finishes despite the sink being down");

    let item = store.get_event(event_id).await.unwrap();
    assert!(item.processed);
    assert_eq!(
        store.current_total_for_user("unlucky").await.unwrap().total,
        dec("2")
    );
}

#[tokio::test]
async fn parked_event_stays_listed_but_ineligible() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("parked");
    let event_id = store
        .record_event(&UsageEvent::now(EventKind::Add, dec("1"), user))
        .await
        .unwrap();

    let mut item = store.get_event(event_id).await.unwrap();
    item.attempts = item.max_attempts;
    store.update_event(&item).await.unwrap();

    assert!(store.eligible_events(10).await.unwrap().is_empty());
    assert_eq!(store.list_events().await.unwrap().len(), 1);
}

#[tokio::test]
async fn recalculate_rebuilds_total() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("rebuilt");
    store.add_job(
        user,
        1000,
        Some(instant("2024-01-01T00:00:00Z")),
        Some(instant("2024-01-01T01:00:00Z")),
    );
    store.add_job(
        user,
        2000,
        Some(instant("2024-01-02T00:00:00Z")),
        Some(instant("2024-01-02T00:30:00Z")),
    );

    let candidates = store.users_with_calculable_jobs().await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].username, "rebuilt");

    let enqueued = admin::recalculate_for_user(
        store.as_ref(),
        EndDateRetry::immediate(0),
        "rebuilt",
        instant("2023-01-01T00:00:00Z"),
        instant("2025-01-01T00:00:00Z"),
    )
    .await
    .expect("recalculate");
    assert_eq!(enqueued, 2);

    // One reset plus the two adds flow through the ordinary queue.
    let worker = register(&store, "w1").await;
    let publisher = RecordingPublisher::new();
    let loop_ = worker_loop(&store, publisher, worker);
    for _ in 0..3 {
        loop_.iteration().await.expect("drain recalculated events");
    }

    let total = store.current_total_for_user("rebuilt").await.unwrap();
    assert_eq!(total.total, dec("2.0"));
}

#[tokio::test]
async fn resend_publishes_current_total() {
    let store = Arc::new(InMemoryStore::new());
    let user = store.add_user("resend");
    let worker = register(&store, "w1").await;
    let loop_ = worker_loop(&store, RecordingPublisher::new(), worker);

    store
        .record_event(&UsageEvent::now(EventKind::Add, dec("4"), user))
        .await
        .unwrap();
    loop_.iteration().await.expect("seed total");

    let sink = RecordingPublisher::new();
    admin::resend_total_for_user(store.as_ref(), &sink, "qms", "resend")
        .await
        .expect("resend");

    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "qms.user.usages.add");
    assert_eq!(sent[0].1.value, 4.0);
    assert_eq!(sent[0].1.username, "resend");
}
