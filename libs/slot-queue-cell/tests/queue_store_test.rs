mod common;

use chrono::Utc;
use std::time::Duration;

use common::{TestHarness, DEPARTMENT_ID, DOCTOR_ID};
use slot_queue_cell::*;

async fn seed_entry(
    harness: &TestHarness,
    patient_id: i64,
    queue_number: u32,
    is_priority: bool,
    status: QueueStatus,
) -> QueueEntry {
    let now = Utc::now();
    harness
        .store
        .insert_queue_entry(&QueueEntry {
            id: 0,
            order_id: patient_id * 100,
            patient_id,
            doctor_id: DOCTOR_ID,
            department_id: DEPARTMENT_ID,
            is_priority,
            queue_number,
            status,
            missed_count: 0,
            max_missed_allowed: 3,
            check_in_time: Some(now),
            call_time: None,
            start_time: None,
            end_time: None,
            created_at: now,
            updated_at: now,
        })
        .await
        .expect("Failed to seed queue entry")
}

#[tokio::test]
async fn test_rebuild_orders_priority_then_number() {
    let harness = TestHarness::new();
    seed_entry(&harness, 1, 3, false, QueueStatus::Waiting).await;
    seed_entry(&harness, 2, 1, false, QueueStatus::Calling).await;
    seed_entry(&harness, 3, 5, true, QueueStatus::Waiting).await;
    seed_entry(&harness, 4, 2, true, QueueStatus::Waiting).await;
    seed_entry(&harness, 5, 4, false, QueueStatus::Completed).await;
    seed_entry(&harness, 6, 6, false, QueueStatus::Treating).await;

    let queue = harness.services.queue.rebuild(DOCTOR_ID).await.unwrap();
    let patients: Vec<i64> = queue.iter().map(|e| e.patient_id).collect();
    assert_eq!(patients, vec![4, 3, 2, 1, 6]);
    assert_eq!(harness.queue_patients(DOCTOR_ID).await, patients);
}

#[tokio::test]
async fn test_rebuild_is_idempotent() {
    let harness = TestHarness::new();
    seed_entry(&harness, 1, 1, false, QueueStatus::Waiting).await;
    seed_entry(&harness, 2, 2, true, QueueStatus::Waiting).await;

    let first = harness.services.queue.rebuild(DOCTOR_ID).await.unwrap();
    let raw_first = harness
        .cache
        .list_range(&keys::doctor_queue(DOCTOR_ID))
        .await
        .unwrap();
    let second = harness.services.queue.rebuild(DOCTOR_ID).await.unwrap();
    let raw_second = harness
        .cache
        .list_range(&keys::doctor_queue(DOCTOR_ID))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(raw_first, raw_second);
}

#[tokio::test]
async fn test_snapshot_rebuilds_missing_queue() {
    let harness = TestHarness::new();
    seed_entry(&harness, 1, 1, false, QueueStatus::Waiting).await;
    assert!(!harness.cache.contains(&keys::doctor_queue(DOCTOR_ID)).await);

    let queue = harness.services.queue.snapshot(DOCTOR_ID).await.unwrap();
    assert_eq!(queue.len(), 1);
    assert!(harness.cache.contains(&keys::doctor_queue(DOCTOR_ID)).await);
}

#[tokio::test]
async fn test_snapshot_recovers_from_corrupt_cache() {
    let harness = TestHarness::new();
    seed_entry(&harness, 1, 1, false, QueueStatus::Waiting).await;
    seed_entry(&harness, 2, 2, false, QueueStatus::Waiting).await;

    harness
        .cache
        .put_raw_list(&keys::doctor_queue(DOCTOR_ID), vec!["{not json".to_string()])
        .await;

    assert_eq!(harness.queue_patients(DOCTOR_ID).await, vec![1, 2]);
}

#[tokio::test]
async fn test_snapshot_recovers_from_wrong_key_type() {
    let harness = TestHarness::new();
    seed_entry(&harness, 1, 1, false, QueueStatus::Waiting).await;

    harness
        .cache
        .set(&keys::doctor_queue(DOCTOR_ID), "stale", Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(harness.queue_patients(DOCTOR_ID).await, vec![1]);
}

#[tokio::test]
async fn test_insert_keeps_class_order() {
    let harness = TestHarness::new();
    seed_entry(&harness, 1, 1, true, QueueStatus::Waiting).await;
    seed_entry(&harness, 2, 2, false, QueueStatus::Waiting).await;
    seed_entry(&harness, 3, 3, false, QueueStatus::Waiting).await;
    harness.services.queue.rebuild(DOCTOR_ID).await.unwrap();

    let urgent = seed_entry(&harness, 4, 4, true, QueueStatus::Waiting).await;
    harness.services.queue.insert(DOCTOR_ID, &urgent).await;
    assert_eq!(harness.queue_patients(DOCTOR_ID).await, vec![1, 4, 2, 3]);

    let walk_in = seed_entry(&harness, 5, 5, false, QueueStatus::Waiting).await;
    harness.services.queue.insert(DOCTOR_ID, &walk_in).await;
    assert_eq!(harness.queue_patients(DOCTOR_ID).await, vec![1, 4, 2, 3, 5]);
}

#[tokio::test]
async fn test_insert_without_cached_queue_rebuilds_from_store() {
    let harness = TestHarness::new();
    seed_entry(&harness, 1, 1, false, QueueStatus::Waiting).await;
    let second = seed_entry(&harness, 2, 2, false, QueueStatus::Waiting).await;

    harness.services.queue.insert(DOCTOR_ID, &second).await;

    let raw = harness
        .cache
        .list_range(&keys::doctor_queue(DOCTOR_ID))
        .await
        .unwrap()
        .expect("Queue should be cached after insert");
    assert_eq!(raw.len(), 2);
}

#[tokio::test]
async fn test_remove_last_entry_clears_key() {
    let harness = TestHarness::new();
    let only = seed_entry(&harness, 1, 1, false, QueueStatus::Waiting).await;
    harness.services.queue.rebuild(DOCTOR_ID).await.unwrap();

    harness.store.delete_queue_entry(only.id).await.unwrap();
    harness.services.queue.remove_by_id(DOCTOR_ID, only.id).await;

    assert!(!harness.cache.contains(&keys::doctor_queue(DOCTOR_ID)).await);
    assert!(harness.services.queue.snapshot(DOCTOR_ID).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_restores_entry_missing_from_cache() {
    let harness = TestHarness::new();
    seed_entry(&harness, 1, 1, false, QueueStatus::Waiting).await;
    harness.services.queue.rebuild(DOCTOR_ID).await.unwrap();

    let mut late = seed_entry(&harness, 2, 2, false, QueueStatus::Waiting).await;
    late.status = QueueStatus::Calling;
    harness.services.queue.update_by_id(DOCTOR_ID, &late).await;

    let queue = harness.services.queue.snapshot(DOCTOR_ID).await.unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[1].id, late.id);
    assert_eq!(queue[1].status, QueueStatus::Calling);
}

#[tokio::test]
async fn test_position_counts_waiting_entries_only() {
    let harness = TestHarness::new();
    seed_entry(&harness, 1, 1, false, QueueStatus::Calling).await;
    seed_entry(&harness, 2, 2, false, QueueStatus::Waiting).await;
    seed_entry(&harness, 3, 3, false, QueueStatus::Waiting).await;

    let queue = &harness.services.queue;
    assert_eq!(queue.position_of(DOCTOR_ID, 1).await.unwrap(), None);
    assert_eq!(queue.position_of(DOCTOR_ID, 2).await.unwrap(), Some(1));
    assert_eq!(queue.position_of(DOCTOR_ID, 3).await.unwrap(), Some(2));
    assert_eq!(queue.max_queue_number(DOCTOR_ID).await.unwrap(), Some(3));
}

#[tokio::test]
async fn test_cache_outage_falls_back_to_store() {
    let harness = TestHarness::new();
    seed_entry(&harness, 1, 1, false, QueueStatus::Waiting).await;

    harness.cache.set_offline(true);
    let queue = harness.services.queue.snapshot(DOCTOR_ID).await.unwrap();
    assert_eq!(queue.len(), 1);
}
