//! Orchestrator and reconciler behavior against the in-memory doubles.
//!
//! These cover the identity-preserving laws: create-once per entity,
//! promote-to-update through the mapping, dedup-before-create after a
//! partial failure, and the hash guard that suppresses no-op writes.

use std::sync::Arc;

use serde_json::json;

use engine_core::error::FailureKind;
use engine_core::queue::SyncAction;
use engine_core::sync::{MappingRepo, Orchestrator, Reconciler};
use engine_core::testing::{
    map_of, BlockedLockFactory, FreeLockFactory, InMemoryMappingRepo, MockTransport,
    ScriptedModule,
};

struct Fixture {
    module: Arc<ScriptedModule>,
    transport: Arc<MockTransport>,
    mappings: Arc<InMemoryMappingRepo>,
    orchestrator: Orchestrator,
}

fn fixture() -> Fixture {
    fixture_with_locks(Arc::new(FreeLockFactory))
}

fn fixture_with_locks(locks: Arc<dyn engine_core::lock::LockFactory>) -> Fixture {
    let module = Arc::new(ScriptedModule::new("crm", vec![("contact", "res.partner")]));
    let transport = Arc::new(MockTransport::new());
    let mappings = Arc::new(InMemoryMappingRepo::new());
    let orchestrator = Orchestrator::new(
        module.clone(),
        transport.clone(),
        mappings.clone(),
        locks,
    );
    Fixture {
        module,
        transport,
        mappings,
        orchestrator,
    }
}

#[tokio::test]
async fn push_create_stores_record_and_mapping() {
    let fx = fixture();
    fx.module
        .set_local("contact", 42, map_of(&[("name", json!("ACME"))]));

    let outcome = fx
        .orchestrator
        .push_to_remote("contact", SyncAction::Create, 42, 0, None)
        .await;

    assert!(outcome.ok, "create failed: {}", outcome.message);
    let remote_id = outcome.entity_id.expect("created id");
    assert_eq!(fx.transport.record_count("res.partner"), 1);
    assert_eq!(
        fx.mappings.get_remote_id("crm", "contact", 42).await.unwrap(),
        Some(remote_id)
    );
}

#[tokio::test]
async fn second_create_promotes_to_update_and_skips_unchanged_write() {
    let fx = fixture();
    fx.module
        .set_local("contact", 42, map_of(&[("name", json!("ACME"))]));

    let first = fx
        .orchestrator
        .push_to_remote("contact", SyncAction::Create, 42, 0, None)
        .await;
    assert!(first.ok);

    // Same payload again: the mapping promotes it to an update and the
    // hash guard suppresses the remote write entirely.
    let second = fx
        .orchestrator
        .push_to_remote("contact", SyncAction::Create, 42, 0, None)
        .await;
    assert!(second.ok);
    assert_eq!(second.entity_id, first.entity_id);

    let calls = fx.transport.call_log();
    assert_eq!(
        calls.iter().filter(|c| c.starts_with("create:")).count(),
        1,
        "exactly one remote create: {calls:?}"
    );
    assert_eq!(
        calls.iter().filter(|c| c.starts_with("write:")).count(),
        0,
        "no write for an unchanged payload: {calls:?}"
    );
}

#[tokio::test]
async fn changed_payload_writes_and_refreshes_hash() {
    let fx = fixture();
    fx.module
        .set_local("contact", 42, map_of(&[("name", json!("ACME"))]));
    fx.orchestrator
        .push_to_remote("contact", SyncAction::Create, 42, 0, None)
        .await;

    fx.module
        .set_local("contact", 42, map_of(&[("name", json!("ACME Corp"))]));
    let outcome = fx
        .orchestrator
        .push_to_remote("contact", SyncAction::Update, 42, 0, None)
        .await;

    assert!(outcome.ok);
    let calls = fx.transport.call_log();
    assert_eq!(calls.iter().filter(|c| c.starts_with("write:")).count(), 1);

    let remote_id = outcome.entity_id.unwrap();
    let record = fx.transport.get_record("res.partner", remote_id).unwrap();
    assert_eq!(record.get("name"), Some(&json!("ACME Corp")));
}

#[tokio::test]
async fn dedup_domain_adopts_orphan_instead_of_creating() {
    let fx = fixture();
    fx.module
        .set_local("contact", 42, map_of(&[("email", json!("a@b.c"))]));
    fx.module
        .set_dedup_domain("contact", json!([["email", "=", "a@b.c"]]));

    // A prior attempt created remote record 777 but never wrote the
    // mapping.
    fx.transport
        .insert_record("res.partner", 777, map_of(&[("email", json!("a@b.c"))]));
    fx.transport.push_search_result(vec![777]);

    let outcome = fx
        .orchestrator
        .push_to_remote("contact", SyncAction::Create, 42, 0, None)
        .await;

    assert!(outcome.ok);
    assert_eq!(outcome.entity_id, Some(777));
    assert_eq!(fx.transport.record_count("res.partner"), 1, "no duplicate");
    assert_eq!(
        fx.mappings.get_remote_id("crm", "contact", 42).await.unwrap(),
        Some(777)
    );
    let calls = fx.transport.call_log();
    assert_eq!(calls.iter().filter(|c| c.starts_with("create:")).count(), 0);
}

#[tokio::test]
async fn mapping_save_failure_after_create_is_transient_with_id() {
    let fx = fixture();
    fx.module
        .set_local("contact", 42, map_of(&[("name", json!("ACME"))]));
    fx.mappings
        .fail_next_save
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let outcome = fx
        .orchestrator
        .push_to_remote("contact", SyncAction::Create, 42, 0, None)
        .await;

    assert!(!outcome.ok);
    assert_eq!(outcome.kind, Some(FailureKind::Transient));
    // The remote record exists; its id must surface for adoption.
    let created = outcome.entity_id.expect("created id attached");
    assert!(fx.transport.get_record("res.partner", created).is_some());
    assert!(fx.mappings.is_empty());
}

#[tokio::test]
async fn push_delete_unlinks_and_removes_mapping() {
    let fx = fixture();
    fx.transport
        .insert_record("res.partner", 900, map_of(&[("name", json!("Old"))]));
    fx.mappings
        .insert("crm", "contact", 42, 900, "res.partner", None);

    let outcome = fx
        .orchestrator
        .push_to_remote("contact", SyncAction::Delete, 42, 900, None)
        .await;

    assert!(outcome.ok);
    assert_eq!(fx.transport.record_count("res.partner"), 0);
    assert!(fx.mappings.is_empty());
}

#[tokio::test]
async fn create_lock_timeout_defers_to_retry() {
    let fx = fixture_with_locks(Arc::new(BlockedLockFactory));
    fx.module
        .set_local("contact", 42, map_of(&[("name", json!("ACME"))]));

    let outcome = fx
        .orchestrator
        .push_to_remote("contact", SyncAction::Create, 42, 0, None)
        .await;

    assert!(!outcome.ok);
    assert_eq!(outcome.kind, Some(FailureKind::Transient));
    assert_eq!(fx.transport.record_count("res.partner"), 0);
}

#[tokio::test]
async fn unregistered_entity_type_is_permanent() {
    let fx = fixture();
    let outcome = fx
        .orchestrator
        .push_to_remote("invoice", SyncAction::Create, 1, 0, None)
        .await;

    assert!(!outcome.ok);
    assert_eq!(outcome.kind, Some(FailureKind::Permanent));
}

#[tokio::test]
async fn missing_local_data_is_permanent() {
    let fx = fixture();
    let outcome = fx
        .orchestrator
        .push_to_remote("contact", SyncAction::Create, 42, 0, None)
        .await;

    assert!(!outcome.ok);
    assert_eq!(outcome.kind, Some(FailureKind::Permanent));
}

#[tokio::test]
async fn caller_payload_wins_over_loader() {
    let fx = fixture();
    // No local record; the payload alone must carry the push.
    let payload = map_of(&[("name", json!("Inline"))]);

    let outcome = fx
        .orchestrator
        .push_to_remote("contact", SyncAction::Create, 42, 0, Some(&payload))
        .await;

    assert!(outcome.ok);
    let record = fx
        .transport
        .get_record("res.partner", outcome.entity_id.unwrap())
        .unwrap();
    assert_eq!(record.get("name"), Some(&json!("Inline")));
}

#[tokio::test]
async fn company_id_is_injected_when_configured() {
    let fx = fixture();
    *fx.transport.company_id.lock().unwrap() = Some(3);
    fx.module
        .set_local("contact", 42, map_of(&[("name", json!("ACME"))]));

    let outcome = fx
        .orchestrator
        .push_to_remote("contact", SyncAction::Create, 42, 0, None)
        .await;

    assert!(outcome.ok);
    let record = fx
        .transport
        .get_record("res.partner", outcome.entity_id.unwrap())
        .unwrap();
    assert_eq!(record.get("company_id"), Some(&json!(3)));
}

#[tokio::test]
async fn pull_saves_locally_and_buffers_translation() {
    let fx = fixture();
    fx.transport
        .insert_record("res.partner", 55, map_of(&[("name", json!("Remote"))]));

    let outcome = fx
        .orchestrator
        .pull_from_remote("contact", SyncAction::Create, 55, 0, None)
        .await;

    assert!(outcome.ok, "pull failed: {}", outcome.message);
    let local_id = outcome.entity_id.expect("local id");
    assert!(fx.module.local("contact", local_id).is_some());
    assert_eq!(
        fx.mappings.get_local_id("crm", "contact", 55).await.unwrap(),
        Some(local_id)
    );

    // End-of-batch flush delivers the remote→local translation.
    fx.orchestrator.flush_pull_translations().await.unwrap();
    let seen = fx.module.translations_seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["res.partner"].get(&55), Some(&local_id));
}

#[tokio::test]
async fn pull_of_mapped_record_updates_in_place() {
    let fx = fixture();
    fx.module
        .set_local("contact", 42, map_of(&[("name", json!("Stale"))]));
    fx.mappings
        .insert("crm", "contact", 42, 55, "res.partner", None);
    fx.transport
        .insert_record("res.partner", 55, map_of(&[("name", json!("Fresh"))]));

    let outcome = fx
        .orchestrator
        .pull_from_remote("contact", SyncAction::Update, 55, 0, None)
        .await;

    assert!(outcome.ok);
    assert_eq!(outcome.entity_id, Some(42));
    assert_eq!(
        fx.module.local("contact", 42).unwrap().get("name"),
        Some(&json!("Fresh"))
    );
}

#[tokio::test]
async fn pull_missing_remote_is_permanent() {
    let fx = fixture();
    let outcome = fx
        .orchestrator
        .pull_from_remote("contact", SyncAction::Update, 404, 0, None)
        .await;

    assert!(!outcome.ok);
    assert_eq!(outcome.kind, Some(FailureKind::Permanent));
}

#[tokio::test]
async fn pull_filtered_by_module_is_a_quiet_success() {
    let fx = fixture();
    fx.transport
        .insert_record("res.partner", 55, map_of(&[("name", json!("Remote"))]));
    fx.module
        .reject_pulls
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let outcome = fx
        .orchestrator
        .pull_from_remote("contact", SyncAction::Create, 55, 0, None)
        .await;

    assert!(outcome.ok);
    assert!(fx.mappings.is_empty());
}

#[tokio::test]
async fn pull_delete_removes_local_and_mapping() {
    let fx = fixture();
    fx.module
        .set_local("contact", 42, map_of(&[("name", json!("Gone"))]));
    fx.mappings
        .insert("crm", "contact", 42, 55, "res.partner", None);

    let outcome = fx
        .orchestrator
        .pull_from_remote("contact", SyncAction::Delete, 55, 0, None)
        .await;

    assert!(outcome.ok);
    assert!(fx.module.local("contact", 42).is_none());
    assert!(fx.mappings.is_empty());
}

#[tokio::test]
async fn reconciler_reports_and_fixes_orphans() {
    let transport = Arc::new(MockTransport::new());
    let mappings = Arc::new(InMemoryMappingRepo::new());
    mappings.insert("crm", "contact", 1, 101, "res.partner", None);
    mappings.insert("crm", "contact", 2, 102, "res.partner", None);
    mappings.insert("crm", "contact", 3, 103, "res.partner", None);

    // Remote only knows 101 and 103.
    transport.push_search_result(vec![101, 103]);

    let reconciler = Reconciler::new(transport.clone(), mappings.clone());
    let report = reconciler
        .run("crm", "contact", "res.partner", false)
        .await
        .unwrap();
    assert_eq!(report.checked, 3);
    assert_eq!(report.orphaned_remote_ids, vec![102]);
    assert_eq!(report.removed, 0);
    assert_eq!(mappings.len(), 3, "dry pass removes nothing");

    transport.push_search_result(vec![101, 103]);
    let fixed = reconciler
        .run("crm", "contact", "res.partner", true)
        .await
        .unwrap();
    assert_eq!(fixed.removed, 1);
    assert_eq!(mappings.len(), 2);
}

#[tokio::test]
async fn reconciler_chunks_large_mapping_sets() {
    let transport = Arc::new(MockTransport::new());
    let mappings = Arc::new(InMemoryMappingRepo::new());
    for i in 1..=5 {
        mappings.insert("crm", "contact", i, 100 + i, "res.partner", None);
    }

    // Chunk size 2 over 5 mappings: three search round trips.
    transport.push_search_result(vec![101, 102]);
    transport.push_search_result(vec![103, 104]);
    transport.push_search_result(vec![105]);

    let reconciler =
        Reconciler::new(transport.clone(), mappings.clone()).with_chunk_size(2);
    let report = reconciler
        .run("crm", "contact", "res.partner", false)
        .await
        .unwrap();

    assert!(report.orphaned_remote_ids.is_empty());
    let searches = transport
        .call_log()
        .iter()
        .filter(|c| c.starts_with("search:"))
        .count();
    assert_eq!(searches, 3);
}
