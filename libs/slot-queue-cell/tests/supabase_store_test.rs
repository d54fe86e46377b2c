use assert_matches::assert_matches;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shared_config::AppConfig;
use shared_database::SupabaseClient;
use slot_queue_cell::*;

fn store_for(server: &MockServer) -> SupabaseStore {
    let config = AppConfig {
        supabase_url: server.uri(),
        supabase_anon_key: "test-anon-key".to_string(),
        supabase_service_role_key: "test-service-key".to_string(),
        redis_url: None,
    };
    SupabaseStore::new(Arc::new(SupabaseClient::new(&config)))
}

fn slot_row(id: i64, booked: u32, status: &str) -> Value {
    json!({
        "id": id,
        "doctor_id": 7,
        "department_id": 3,
        "schedule_date": "2026-10-15",
        "time_period": "morning",
        "fee_amount": 50,
        "total_count": 5,
        "booked_count": booked,
        "status": status,
        "created_at": "2026-10-14T08:00:00Z",
        "updated_at": "2026-10-14T08:00:00Z"
    })
}

fn entry_row(id: i64, patient_id: i64, number: u32, priority: bool, status: &str) -> Value {
    json!({
        "id": id,
        "order_id": id * 10,
        "patient_id": patient_id,
        "doctor_id": 7,
        "department_id": 3,
        "is_priority": priority,
        "queue_number": number,
        "status": status,
        "missed_count": 0,
        "max_missed_allowed": 3,
        "check_in_time": "2026-10-15T08:30:00Z",
        "call_time": null,
        "start_time": null,
        "end_time": null,
        "created_at": "2026-10-15T08:30:00Z",
        "updated_at": "2026-10-15T08:30:00Z"
    })
}

#[tokio::test]
async fn test_get_slot_decodes_row() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/slots"))
        .and(query_param("id", "eq.5"))
        .and(header("apikey", "test-service-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([slot_row(5, 2, "available")])))
        .mount(&server)
        .await;

    let slot = store_for(&server)
        .get_slot(5)
        .await
        .unwrap()
        .expect("Slot should be found");
    assert_eq!(slot.id, 5);
    assert_eq!(slot.schedule_date, NaiveDate::from_ymd_opt(2026, 10, 15).unwrap());
    assert_eq!(slot.time_period, TimePeriod::Morning);
    assert_eq!(slot.booked_count, 2);
    assert_eq!(slot.remaining(), 3);
    assert_eq!(slot.status, SlotStatus::Available);
}

#[tokio::test]
async fn test_get_missing_slot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/slots"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    assert!(store_for(&server).get_slot(9).await.unwrap().is_none());
}

#[tokio::test]
async fn test_update_slot_counts_patches_and_returns_row() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/slots"))
        .and(query_param("id", "eq.5"))
        .and(header("prefer", "return=representation"))
        .and(body_partial_json(json!({ "booked_count": 5, "status": "full" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([slot_row(5, 5, "full")])))
        .expect(1)
        .mount(&server)
        .await;

    let slot = store_for(&server)
        .update_slot_counts(5, 5, SlotStatus::Full)
        .await
        .unwrap();
    assert_eq!(slot.status, SlotStatus::Full);
    assert_eq!(slot.booked_count, 5);
}

#[tokio::test]
async fn test_update_slot_terms_patches_capacity() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/slots"))
        .and(query_param("id", "eq.5"))
        .and(body_partial_json(json!({ "fee_amount": 80, "total_count": 5, "status": "available" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([slot_row(5, 2, "available")])))
        .expect(1)
        .mount(&server)
        .await;

    let slot = store_for(&server)
        .update_slot_terms(5, 80, 5, SlotStatus::Available)
        .await
        .unwrap();
    assert_eq!(slot.total_count, 5);
}

#[tokio::test]
async fn test_doctor_slots_filter_by_date() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/slots"))
        .and(query_param("doctor_id", "eq.7"))
        .and(query_param("schedule_date", "eq.2026-10-15"))
        .and(query_param("order", "id.asc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            slot_row(5, 2, "available"),
            slot_row(6, 5, "full"),
        ])))
        .mount(&server)
        .await;

    let slots = store_for(&server)
        .list_doctor_slots(7, NaiveDate::from_ymd_opt(2026, 10, 15).unwrap())
        .await
        .unwrap();
    let ids: Vec<i64> = slots.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![5, 6]);
    assert_eq!(slots[1].status, SlotStatus::Full);
}

#[tokio::test]
async fn test_insert_order_returns_assigned_id() {
    let server = MockServer::start().await;
    let now = "2026-10-14T09:00:00Z";
    let row = json!({
        "id": 42,
        "order_no": "ORDABC123456",
        "patient_id": 11,
        "slot_id": 5,
        "doctor_id": 7,
        "department_id": 3,
        "schedule_date": "2026-10-15",
        "time_period": "morning",
        "fee_amount": 50,
        "status": "pending",
        "is_emergency": false,
        "payment_time": null,
        "check_in_time": null,
        "cancel_time": null,
        "cancel_reason": null,
        "created_at": now,
        "updated_at": now
    });
    Mock::given(method("POST"))
        .and(path("/rest/v1/orders"))
        .and(body_partial_json(json!({ "order_no": "ORDABC123456", "status": "pending" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([row.clone()])))
        .expect(1)
        .mount(&server)
        .await;

    let mut order: Order = serde_json::from_value(row).unwrap();
    order.id = 0;
    let saved = store_for(&server).insert_order(&order).await.unwrap();
    assert_eq!(saved.id, 42);
    assert_eq!(saved.status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_active_entries_use_status_filter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/queue_entries"))
        .and(query_param("doctor_id", "eq.7"))
        .and(query_param("status", "in.(waiting,calling,treating)"))
        .and(query_param("order", "is_priority.desc,queue_number.asc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            entry_row(2, 20, 4, true, "waiting"),
            entry_row(1, 10, 1, false, "calling"),
        ])))
        .mount(&server)
        .await;

    let entries = store_for(&server).list_active_queue_entries(7).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].is_priority);
    assert_eq!(entries[1].status, QueueStatus::Calling);
}

#[tokio::test]
async fn test_max_queue_number() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/queue_entries"))
        .and(query_param("select", "queue_number"))
        .and(query_param("order", "queue_number.desc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "queue_number": 9 }])))
        .mount(&server)
        .await;

    assert_eq!(store_for(&server).max_queue_number(7).await.unwrap(), Some(9));
}

#[tokio::test]
async fn test_delete_missing_entry() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/rest/v1/queue_entries"))
        .and(query_param("id", "eq.3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    assert!(!store_for(&server).delete_queue_entry(3).await.unwrap());
}

#[tokio::test]
async fn test_doctors_with_active_queue_are_deduplicated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/queue_entries"))
        .and(query_param("select", "doctor_id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "doctor_id": 8 },
            { "doctor_id": 7 },
            { "doctor_id": 8 }
        ])))
        .mount(&server)
        .await;

    assert_eq!(
        store_for(&server).list_doctors_with_active_queue().await.unwrap(),
        vec![7, 8]
    );
}

#[tokio::test]
async fn test_server_errors_become_persistence_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/orders"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let result = store_for(&server).get_order(1).await;
    assert_matches!(result, Err(SlotQueueError::Persistence(_)));
}
