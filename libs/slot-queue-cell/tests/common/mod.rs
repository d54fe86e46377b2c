#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use std::sync::Arc;

use shared_models::auth::RequestContext;
use slot_queue_cell::*;

pub const DOCTOR_ID: i64 = 7;
pub const DEPARTMENT_ID: i64 = 3;

/// Services wired over the in-memory backends, with handles to each backend
/// for fault injection and inspection.
pub struct TestHarness {
    pub store: Arc<InMemoryStore>,
    pub cache: Arc<InMemoryCache>,
    pub lock_manager: Arc<InMemoryLockManager>,
    pub services: SlotQueueServices,
    pub config: SlotQueueConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SlotQueueConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(InMemoryCache::new());
        let lock_manager = Arc::new(InMemoryLockManager::new());
        let services = SlotQueueServices::new(
            store.clone(),
            cache.clone(),
            lock_manager.clone(),
            config.clone(),
        );
        Self {
            store,
            cache,
            lock_manager,
            services,
            config,
        }
    }

    pub fn locks(&self) -> DistributedLocks {
        DistributedLocks::new(self.lock_manager.clone())
    }

    /// Publishes a slot for tomorrow morning with `total` seats.
    pub async fn release_slot(&self, total: u32) -> Slot {
        self.release_slot_on(DOCTOR_ID, tomorrow(), TimePeriod::Morning, total)
            .await
    }

    pub async fn release_slot_on(&self, doctor_id: i64, date: NaiveDate, period: TimePeriod, total: u32) -> Slot {
        self.services
            .inventory
            .release_slot(
                &RequestContext::doctor(doctor_id),
                SlotRelease {
                    doctor_id,
                    department_id: DEPARTMENT_ID,
                    schedule_date: date,
                    time_period: period,
                    fee_amount: 50,
                    total_count: total,
                },
            )
            .await
            .expect("Failed to release slot")
    }

    pub async fn book(&self, patient_id: i64, slot_id: i64, is_emergency: bool) -> Order {
        self.services
            .orchestrator
            .register_and_book(&RequestContext::patient(patient_id), patient_id, slot_id, is_emergency)
            .await
            .expect("Failed to book slot")
    }

    /// Books, pays and checks in a patient.
    pub async fn check_in_patient(&self, patient_id: i64, slot_id: i64, is_emergency: bool) -> CheckInReceipt {
        let ctx = RequestContext::patient(patient_id);
        let order = self.book(patient_id, slot_id, is_emergency).await;
        self.services
            .orchestrator
            .pay_order(&ctx, order.id)
            .await
            .expect("Failed to pay order");
        self.services
            .orchestrator
            .check_in(&ctx, order.id)
            .await
            .expect("Failed to check in")
    }

    pub async fn stored_slot(&self, slot_id: i64) -> Slot {
        self.store
            .get_slot(slot_id)
            .await
            .expect("Failed to read slot")
            .expect("Slot should exist")
    }

    pub async fn stored_order(&self, order_id: i64) -> Order {
        self.store
            .get_order(order_id)
            .await
            .expect("Failed to read order")
            .expect("Order should exist")
    }

    pub async fn stored_entry(&self, entry_id: i64) -> Option<QueueEntry> {
        self.store
            .get_queue_entry(entry_id)
            .await
            .expect("Failed to read queue entry")
    }

    pub async fn cached_booked(&self, slot_id: i64) -> Option<i64> {
        self.cache
            .get(&keys::booked_count(slot_id))
            .await
            .expect("Failed to read counter")
            .map(|v| v.parse().expect("Counter should be numeric"))
    }

    /// Patient ids in cached queue order.
    pub async fn queue_patients(&self, doctor_id: i64) -> Vec<i64> {
        self.services
            .queue
            .snapshot(doctor_id)
            .await
            .expect("Failed to read queue")
            .iter()
            .map(|e| e.patient_id)
            .collect()
    }
}

/// Short lock waits so contention tests finish quickly.
pub fn test_config() -> SlotQueueConfig {
    SlotQueueConfig {
        slot_lock: LockTiming::from_millis(2000, 5000),
        queue_lock: LockTiming::from_millis(2000, 5000),
        ..SlotQueueConfig::default()
    }
}

pub fn tomorrow() -> NaiveDate {
    Utc::now().date_naive() + ChronoDuration::days(1)
}
