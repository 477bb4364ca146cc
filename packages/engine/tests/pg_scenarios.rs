//! End-to-end queue scenarios against a real Postgres database.
//!
//! These exercise the SQL the engine's guarantees live in: the locking
//! dedup read, the conditional claim, stale recovery, the batch-create
//! claim path and the advisory-lock probe admission. The remote side
//! stays scripted (`MockTransport`); the database is real.
//!
//! Ignored by default because they need a container runtime; run with
//! `cargo test -- --ignored`.

mod common;

use chrono::{Duration, Utc};
use serde_json::json;
use test_context::test_context;

use engine_core::breaker::{BreakerPhase, BreakerState};
use engine_core::queue::{JobStatus, PushRequest, SyncAction};
use engine_core::settings::keys;
use engine_core::testing::map_of;

use common::harness::PgHarness;

fn update_request() -> PushRequest {
    PushRequest::builder()
        .module(PgHarness::MODULE)
        .entity_type(PgHarness::ENTITY)
        .action(SyncAction::Update)
        .local_id(42i64)
        .build()
}

/// Seed a mapped entity so an update push has a remote counterpart.
async fn seed_mapped_entity(ctx: &PgHarness) {
    ctx.module.set_local(
        PgHarness::ENTITY,
        42,
        map_of(&[("name", json!("ACME v2"))]),
    );
    ctx.transport.insert_record(
        PgHarness::REMOTE_MODEL,
        501,
        map_of(&[("name", json!("ACME v1"))]),
    );
    ctx.kernel
        .mappings
        .save(PgHarness::MODULE, PgHarness::ENTITY, 42, 501, PgHarness::REMOTE_MODEL, None)
        .await
        .unwrap();
}

// S1: five rapid-fire updates for one entity coalesce into a single job
// through the locking dedup read, and one tick drives one remote write.
#[test_context(PgHarness)]
#[tokio::test]
#[ignore = "requires a container runtime"]
async fn coalescing_five_enqueues_one_write(ctx: &mut PgHarness) {
    seed_mapped_entity(ctx).await;
    let enqueuer = ctx.kernel.enqueuer();

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        outcomes.push(enqueuer.enqueue_push(update_request()).await.unwrap());
    }

    let first_id = outcomes[0].job_id();
    assert!(outcomes[0].is_created());
    for outcome in &outcomes[1..] {
        assert!(!outcome.is_created(), "dedup must coalesce");
        assert_eq!(outcome.job_id(), first_id);
    }

    let pending = ctx.kernel.queue.list_jobs(Some(JobStatus::Pending), 10).await.unwrap();
    assert_eq!(pending.len(), 1, "exactly one pending row");

    // A sixth fire without debounce makes the row immediately eligible,
    // still through the same coalesce path.
    let mut eligible = update_request();
    eligible.debounce_secs = 0;
    let outcome = enqueuer.enqueue_push(eligible).await.unwrap();
    assert_eq!(outcome.job_id(), first_id);

    let report = ctx.kernel.scheduler().run(None).await.unwrap();
    assert_eq!(report.processed, 1);

    let calls = ctx.transport.call_log();
    assert_eq!(calls.iter().filter(|c| c.starts_with("write:")).count(), 1);
    assert_eq!(calls.iter().filter(|c| c.starts_with("create:")).count(), 0);

    let completed = ctx.kernel.queue.list_jobs(Some(JobStatus::Completed), 10).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, first_id);
}

// S2: a job claimed by a worker that dies comes back through stale
// recovery with one burned attempt and completes on the next tick.
#[test_context(PgHarness)]
#[tokio::test]
#[ignore = "requires a container runtime"]
async fn crash_recovery_returns_claimed_job_to_pending(ctx: &mut PgHarness) {
    seed_mapped_entity(ctx).await;
    let enqueuer = ctx.kernel.enqueuer();

    let mut request = update_request();
    request.debounce_secs = 0;
    let job_id = enqueuer.enqueue_push(request).await.unwrap().job_id();

    // Simulate a worker that claims the job and then dies.
    assert!(ctx.kernel.queue.claim(job_id).await.unwrap());
    assert!(
        !ctx.kernel.queue.claim(job_id).await.unwrap(),
        "claim is exclusive"
    );

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let recovery = ctx.kernel.queue.recover_stale(0).await.unwrap();
    assert_eq!(recovery.recovered, 1);
    assert_eq!(recovery.failed, 0);

    // Invariant: no stale in-flight work survives recovery.
    let processing = ctx.kernel.queue.list_jobs(Some(JobStatus::Processing), 10).await.unwrap();
    assert!(processing.is_empty());

    let pending = ctx.kernel.queue.list_jobs(Some(JobStatus::Pending), 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].scheduled_at.is_none());

    let report = ctx.kernel.scheduler().run(None).await.unwrap();
    assert_eq!(report.processed, 1);

    let completed = ctx.kernel.queue.list_jobs(Some(JobStatus::Completed), 10).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].attempts, 1);
}

// S3: 150 creates of one entity type drain in one tick through the bulk
// path, every job completes, and the mapping table grows by exactly 150.
#[test_context(PgHarness)]
#[tokio::test]
#[ignore = "requires a container runtime"]
async fn bulk_import_drains_through_batch_create(ctx: &mut PgHarness) {
    let enqueuer = ctx.kernel.enqueuer();
    for i in 1..=150i64 {
        let request = PushRequest::builder()
            .module(PgHarness::MODULE)
            .entity_type(PgHarness::ENTITY)
            .action(SyncAction::Create)
            .local_id(i)
            .payload(Some(json!({ "name": format!("contact {i}") })))
            .debounce_secs(0i64)
            .build();
        enqueuer.enqueue_push(request).await.unwrap();
    }

    let report = ctx.kernel.scheduler().run(None).await.unwrap();
    assert_eq!(report.processed, 150);
    // Default batch size 20: seven full batches and one of ten.
    assert_eq!(report.iterations, 8);

    let completed = ctx.kernel.queue.list_jobs(Some(JobStatus::Completed), 200).await.unwrap();
    assert_eq!(completed.len(), 150);

    let mappings = ctx
        .kernel
        .mappings
        .get_module_entity_mappings(PgHarness::MODULE, PgHarness::ENTITY)
        .await
        .unwrap();
    assert_eq!(mappings.len(), 150);
    assert_eq!(ctx.transport.record_count(PgHarness::REMOTE_MODEL), 150);

    let calls = ctx.transport.call_log();
    assert_eq!(
        calls.iter().filter(|c| c.starts_with("create_batch:")).count(),
        8
    );
    assert_eq!(calls.iter().filter(|c| c.starts_with("create:")).count(), 0);
}

// S5: three failed batches open the global breaker; the scheduler then
// refuses work; after the recovery window exactly one probe is admitted
// and its batch decides between re-close and re-open.
#[test_context(PgHarness)]
#[tokio::test]
#[ignore = "requires a container runtime"]
async fn global_breaker_opens_probes_and_recovers(ctx: &mut PgHarness) {
    let breaker = &ctx.kernel.global_breaker;

    for _ in 0..3 {
        breaker.record_batch(1, 9).await.unwrap();
    }
    assert_eq!(breaker.phase().await.unwrap(), BreakerPhase::Open);
    assert!(!breaker.is_available().await.unwrap());

    // A tick with pending work exits without touching it.
    seed_mapped_entity(ctx).await;
    let mut request = update_request();
    request.debounce_secs = 0;
    ctx.kernel.enqueuer().enqueue_push(request).await.unwrap();
    let report = ctx.kernel.scheduler().run(None).await.unwrap();
    assert_eq!(report.processed, 0);
    let pending = ctx.kernel.queue.list_jobs(Some(JobStatus::Pending), 10).await.unwrap();
    assert_eq!(pending.len(), 1, "job untouched while open");

    // Move the open stamp past the recovery window.
    let half_open = BreakerState {
        failures: 3,
        opened_at: Some(Utc::now() - Duration::seconds(301)),
        probe_held: false,
        updated_at: Some(Utc::now()),
    };
    ctx.kernel
        .settings
        .set_json(keys::GLOBAL_BREAKER, &half_open)
        .await
        .unwrap();
    breaker.invalidate_cache().await;

    // Exactly one probe: the first caller wins, the second sees the
    // probe_held flag under the probe lock.
    assert!(breaker.is_available().await.unwrap());
    assert!(!breaker.is_available().await.unwrap());

    // Healthy probe batch closes the breaker.
    breaker.record_batch(10, 0).await.unwrap();
    assert_eq!(breaker.phase().await.unwrap(), BreakerPhase::Closed);
    assert!(breaker.is_available().await.unwrap());

    // Failed probe batch re-opens with a fresh window.
    ctx.kernel
        .settings
        .set_json(keys::GLOBAL_BREAKER, &half_open)
        .await
        .unwrap();
    breaker.invalidate_cache().await;
    assert!(breaker.is_available().await.unwrap());
    breaker.record_batch(1, 9).await.unwrap();
    assert_eq!(breaker.phase().await.unwrap(), BreakerPhase::Open);
    assert!(!breaker.is_available().await.unwrap());
}
