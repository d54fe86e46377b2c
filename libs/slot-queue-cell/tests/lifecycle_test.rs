mod common;

use assert_matches::assert_matches;

use common::{test_config, TestHarness, DOCTOR_ID};
use shared_models::auth::RequestContext;
use slot_queue_cell::*;

fn doctor() -> RequestContext {
    RequestContext::doctor(DOCTOR_ID)
}

#[tokio::test]
async fn test_call_start_complete() {
    let harness = TestHarness::new();
    let slot = harness.release_slot(10).await;
    let receipt = harness.check_in_patient(1, slot.id, false).await;
    let lifecycle = &harness.services.lifecycle;

    let called = lifecycle.call_next(&doctor(), DOCTOR_ID).await.unwrap();
    assert_eq!(called.id, receipt.entry.id);
    assert_eq!(called.status, QueueStatus::Calling);
    assert!(called.call_time.is_some());

    let treating = lifecycle.start_treatment(&doctor(), called.id).await.unwrap();
    assert_eq!(treating.status, QueueStatus::Treating);
    assert!(treating.start_time.is_some());

    let done = lifecycle.complete_treatment(&doctor(), called.id).await.unwrap();
    assert_eq!(done.status, QueueStatus::Completed);
    assert!(done.end_time.is_some());

    assert!(harness.queue_patients(DOCTOR_ID).await.is_empty());
    let stored = harness.stored_entry(called.id).await.expect("Entry is kept as history");
    assert_eq!(stored.status, QueueStatus::Completed);
    assert_eq!(harness.stored_order(receipt.order.id).await.status, OrderStatus::Completed);
}

#[tokio::test]
async fn test_emergency_patients_are_called_first() {
    let harness = TestHarness::new();
    let slot = harness.release_slot(10).await;
    harness.check_in_patient(1, slot.id, false).await;
    harness.check_in_patient(2, slot.id, false).await;
    harness.check_in_patient(3, slot.id, true).await;

    assert_eq!(harness.queue_patients(DOCTOR_ID).await, vec![3, 1, 2]);

    let lifecycle = &harness.services.lifecycle;
    assert_eq!(lifecycle.call_next(&doctor(), DOCTOR_ID).await.unwrap().patient_id, 3);
    assert_eq!(lifecycle.call_next(&doctor(), DOCTOR_ID).await.unwrap().patient_id, 1);
    assert_eq!(lifecycle.call_next(&doctor(), DOCTOR_ID).await.unwrap().patient_id, 2);
}

#[tokio::test]
async fn test_call_next_on_empty_queue() {
    let harness = TestHarness::new();
    let result = harness.services.lifecycle.call_next(&doctor(), DOCTOR_ID).await;
    assert_matches!(result, Err(SlotQueueError::QueueEmpty(DOCTOR_ID)));
}

#[tokio::test]
async fn test_call_next_with_nobody_waiting() {
    let harness = TestHarness::new();
    let slot = harness.release_slot(10).await;
    harness.check_in_patient(1, slot.id, false).await;

    let lifecycle = &harness.services.lifecycle;
    lifecycle.call_next(&doctor(), DOCTOR_ID).await.unwrap();
    let result = lifecycle.call_next(&doctor(), DOCTOR_ID).await;
    assert_matches!(result, Err(SlotQueueError::NoPatientToCall(DOCTOR_ID)));
}

#[tokio::test]
async fn test_call_next_skips_stale_cache_entry() {
    let harness = TestHarness::new();
    let slot = harness.release_slot(10).await;
    let first = harness.check_in_patient(1, slot.id, false).await;
    harness.check_in_patient(2, slot.id, false).await;
    assert_eq!(harness.queue_patients(DOCTOR_ID).await, vec![1, 2]);

    // Gone from the store behind the cache's back.
    harness.store.delete_queue_entry(first.entry.id).await.unwrap();

    let called = harness.services.lifecycle.call_next(&doctor(), DOCTOR_ID).await.unwrap();
    assert_eq!(called.patient_id, 2);
    assert_eq!(harness.queue_patients(DOCTOR_ID).await, vec![2]);
}

#[tokio::test]
async fn test_transitions_require_expected_status() {
    let harness = TestHarness::new();
    let slot = harness.release_slot(10).await;
    let receipt = harness.check_in_patient(1, slot.id, false).await;
    let lifecycle = &harness.services.lifecycle;

    let early = lifecycle.start_treatment(&doctor(), receipt.entry.id).await;
    assert_matches!(
        early,
        Err(SlotQueueError::InvalidQueueState { status: QueueStatus::Waiting, .. })
    );

    let premature = lifecycle.complete_treatment(&doctor(), receipt.entry.id).await;
    assert_matches!(premature, Err(SlotQueueError::InvalidQueueState { .. }));

    let not_called = lifecycle.handle_missed(&doctor(), receipt.entry.id).await;
    assert_matches!(not_called, Err(SlotQueueError::InvalidQueueState { .. }));

    assert_eq!(
        harness.stored_entry(receipt.entry.id).await.unwrap().status,
        QueueStatus::Waiting
    );
}

#[tokio::test]
async fn test_missed_patient_requeued_until_allowance_used() {
    let harness = TestHarness::new();
    let slot = harness.release_slot(10).await;
    let absent = harness.check_in_patient(1, slot.id, false).await;
    let present = harness.check_in_patient(2, slot.id, false).await;
    let lifecycle = &harness.services.lifecycle;

    let called = lifecycle.call_next(&doctor(), DOCTOR_ID).await.unwrap();
    assert_eq!(called.id, absent.entry.id);

    let first = lifecycle.handle_missed(&doctor(), called.id).await.unwrap();
    let requeued = assert_matches!(first, MissedOutcome::Requeued(entry) => entry);
    assert_eq!(requeued.missed_count, 1);
    assert_eq!(requeued.status, QueueStatus::Waiting);
    assert_eq!(requeued.queue_number, 3);
    assert!(requeued.call_time.is_none());
    assert_eq!(harness.queue_patients(DOCTOR_ID).await, vec![2, 1]);

    assert_eq!(lifecycle.call_next(&doctor(), DOCTOR_ID).await.unwrap().id, present.entry.id);

    let again = lifecycle.call_next(&doctor(), DOCTOR_ID).await.unwrap();
    assert_eq!(again.id, absent.entry.id);
    let second = lifecycle.handle_missed(&doctor(), again.id).await.unwrap();
    assert_matches!(second, MissedOutcome::Requeued(ref entry) if entry.missed_count == 2);

    let last = lifecycle.call_next(&doctor(), DOCTOR_ID).await.unwrap();
    assert_eq!(last.id, absent.entry.id);
    let third = lifecycle.handle_missed(&doctor(), last.id).await.unwrap();
    let removed = assert_matches!(third, MissedOutcome::Removed(entry) => entry);
    assert_eq!(removed.missed_count, 3);
    assert_eq!(removed.status, QueueStatus::Missed);

    assert!(harness.stored_entry(absent.entry.id).await.is_none());
    assert_eq!(harness.queue_patients(DOCTOR_ID).await, vec![2]);
}

#[tokio::test]
async fn test_patient_out_of_misses_cannot_check_in_again() {
    let harness = TestHarness::new();
    let slot = harness.release_slot(10).await;
    let absent = harness.check_in_patient(1, slot.id, false).await;
    let lifecycle = &harness.services.lifecycle;

    for _ in 0..3 {
        let called = lifecycle.call_next(&doctor(), DOCTOR_ID).await.unwrap();
        lifecycle.handle_missed(&doctor(), called.id).await.unwrap();
    }
    assert_eq!(harness.stored_order(absent.order.id).await.status, OrderStatus::CheckedIn);

    let result = harness
        .services
        .orchestrator
        .check_in(&RequestContext::patient(1), absent.order.id)
        .await;

    assert_matches!(
        result,
        Err(SlotQueueError::InvalidOrderState { status: OrderStatus::CheckedIn, .. })
    );
    assert!(harness.queue_patients(DOCTOR_ID).await.is_empty());
    assert!(harness.stored_entry(absent.entry.id).await.is_none());
}

#[tokio::test]
async fn test_missed_priority_patient_stays_ahead_of_normal() {
    let harness = TestHarness::new();
    let slot = harness.release_slot(10).await;
    harness.check_in_patient(1, slot.id, true).await;
    harness.check_in_patient(2, slot.id, true).await;
    harness.check_in_patient(3, slot.id, false).await;
    let lifecycle = &harness.services.lifecycle;

    let called = lifecycle.call_next(&doctor(), DOCTOR_ID).await.unwrap();
    assert_eq!(called.patient_id, 1);
    lifecycle.handle_missed(&doctor(), called.id).await.unwrap();

    assert_eq!(harness.queue_patients(DOCTOR_ID).await, vec![2, 1, 3]);
}

#[tokio::test]
async fn test_queue_numbers_keep_increasing() {
    let harness = TestHarness::new();
    let slot = harness.release_slot(10).await;
    let first = harness.check_in_patient(1, slot.id, false).await;
    let second = harness.check_in_patient(2, slot.id, false).await;
    assert_eq!(first.entry.queue_number, 1);
    assert_eq!(second.entry.queue_number, 2);

    let lifecycle = &harness.services.lifecycle;
    for _ in 0..2 {
        let called = lifecycle.call_next(&doctor(), DOCTOR_ID).await.unwrap();
        lifecycle.start_treatment(&doctor(), called.id).await.unwrap();
        lifecycle.complete_treatment(&doctor(), called.id).await.unwrap();
    }

    let third = harness.check_in_patient(3, slot.id, false).await;
    assert_eq!(third.entry.queue_number, 3);
}

#[tokio::test]
async fn test_other_doctor_cannot_manage_queue() {
    let harness = TestHarness::new();
    let slot = harness.release_slot(10).await;
    harness.check_in_patient(1, slot.id, false).await;

    let result = harness
        .services
        .lifecycle
        .call_next(&RequestContext::doctor(DOCTOR_ID + 1), DOCTOR_ID)
        .await;
    assert_matches!(result, Err(SlotQueueError::PermissionDenied(_)));

    let patient = harness
        .services
        .lifecycle
        .call_next(&RequestContext::patient(1), DOCTOR_ID)
        .await;
    assert_matches!(patient, Err(SlotQueueError::PermissionDenied(_)));
}

#[tokio::test]
async fn test_contended_queue_lock_reports_busy() {
    let mut config = test_config();
    config.queue_lock = LockTiming::from_millis(50, 5000);
    let harness = TestHarness::with_config(config);
    let slot = harness.release_slot(10).await;
    harness.check_in_patient(1, slot.id, false).await;

    let held = harness
        .locks()
        .acquire(LockKey::QueueCall(DOCTOR_ID), "other-request", LockTiming::from_millis(0, 5000))
        .await
        .unwrap();

    let result = harness.services.lifecycle.call_next(&doctor(), DOCTOR_ID).await;
    assert_matches!(result, Err(SlotQueueError::SystemBusy { .. }));
    held.release().await;

    assert!(harness.services.lifecycle.call_next(&doctor(), DOCTOR_ID).await.is_ok());
}

#[tokio::test]
async fn test_patient_queue_view() {
    let harness = TestHarness::new();
    let slot = harness.release_slot(10).await;
    harness.check_in_patient(1, slot.id, false).await;
    harness.check_in_patient(2, slot.id, false).await;
    let lifecycle = &harness.services.lifecycle;

    let view = lifecycle
        .patient_queue(&RequestContext::patient(2), 2)
        .await
        .unwrap()
        .expect("Patient 2 is queued");
    assert_eq!(view.position, Some(2));
    assert_eq!(view.queue_length, 2);
    assert_eq!(view.entry.patient_id, 2);

    assert!(lifecycle
        .patient_queue(&RequestContext::patient(9), 9)
        .await
        .unwrap()
        .is_none());

    let snooping = lifecycle.patient_queue(&RequestContext::patient(1), 2).await;
    assert_matches!(snooping, Err(SlotQueueError::PermissionDenied(_)));
}
