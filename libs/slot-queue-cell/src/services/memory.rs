//! Process-local backends with the same semantics as the Redis and Supabase
//! ones. Used by tests and for running the core without infrastructure.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::models::{Order, QueueEntry, Slot, SlotStatus, TimePeriod};
use crate::services::cache::CacheBackend;
use crate::services::lock::{next_backoff, LockManager, ReleaseOutcome};
use crate::services::store::SlotQueueStore;
use crate::SlotQueueError;

fn unavailable(what: &'static str) -> SlotQueueError {
    SlotQueueError::Cache(redis::RedisError::from((redis::ErrorKind::IoError, what)))
}

// ==============================================================================
// CACHE
// ==============================================================================

#[derive(Debug, Clone)]
enum CacheValue {
    Text(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct CacheItem {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl CacheItem {
    fn new(value: CacheValue, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

#[derive(Default)]
pub struct InMemoryCache {
    items: Mutex<HashMap<String, CacheItem>>,
    offline: AtomicBool,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails like a dropped Redis connection.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Writes a list verbatim, bypassing serialization.
    pub async fn put_raw_list(&self, key: &str, items: Vec<String>) {
        self.items.lock().await.insert(
            key.to_string(),
            CacheItem {
                value: CacheValue::List(items),
                expires_at: None,
            },
        );
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.items.lock().await.get(key).is_some_and(CacheItem::is_live)
    }

    fn check(&self) -> Result<(), SlotQueueError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(unavailable("cache offline"));
        }
        Ok(())
    }
}

fn live<'a>(items: &'a mut HashMap<String, CacheItem>, key: &str) -> Option<&'a mut CacheItem> {
    if items.get(key).is_some_and(|item| !item.is_live()) {
        items.remove(key);
    }
    items.get_mut(key)
}

fn wrong_type() -> SlotQueueError {
    SlotQueueError::Cache(redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "WRONGTYPE Operation against a key holding the wrong kind of value",
    )))
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, SlotQueueError> {
        self.check()?;
        let mut items = self.items.lock().await;
        match live(&mut items, key).map(|item| &item.value) {
            Some(CacheValue::Text(text)) => Ok(Some(text.clone())),
            Some(CacheValue::List(_)) => Err(wrong_type()),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), SlotQueueError> {
        self.check()?;
        self.items.lock().await.insert(
            key.to_string(),
            CacheItem::new(CacheValue::Text(value.to_string()), ttl),
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, SlotQueueError> {
        self.check()?;
        let mut items = self.items.lock().await;
        if live(&mut items, key).is_some() {
            return Ok(false);
        }
        items.insert(
            key.to_string(),
            CacheItem::new(CacheValue::Text(value.to_string()), ttl),
        );
        Ok(true)
    }

    async fn set_max(&self, key: &str, value: i64, ttl: Duration) -> Result<i64, SlotQueueError> {
        self.check()?;
        let mut items = self.items.lock().await;
        let current = match live(&mut items, key).map(|item| &item.value) {
            Some(CacheValue::Text(text)) => text.parse::<i64>().ok(),
            Some(CacheValue::List(_)) => return Err(wrong_type()),
            None => None,
        };
        let next = current.map_or(value, |current| current.max(value));
        items.insert(
            key.to_string(),
            CacheItem::new(CacheValue::Text(next.to_string()), ttl),
        );
        Ok(next)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), SlotQueueError> {
        self.check()?;
        let mut items = self.items.lock().await;
        for key in keys {
            items.remove(key);
        }
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, SlotQueueError> {
        self.check()?;
        let mut items = self.items.lock().await;
        let (current, expires_at) = match live(&mut items, key) {
            Some(CacheItem { value: CacheValue::Text(text), expires_at }) => {
                let current = text.parse::<i64>().map_err(|_| wrong_type())?;
                (current, *expires_at)
            }
            Some(_) => return Err(wrong_type()),
            None => (0, None),
        };
        let next = current + delta;
        items.insert(
            key.to_string(),
            CacheItem {
                value: CacheValue::Text(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn decr_floor_zero(&self, key: &str) -> Result<Option<(i64, bool)>, SlotQueueError> {
        self.check()?;
        let mut items = self.items.lock().await;
        let Some(item) = live(&mut items, key) else {
            return Ok(None);
        };
        let CacheValue::Text(text) = &mut item.value else {
            return Err(wrong_type());
        };
        let current = text.parse::<i64>().map_err(|_| wrong_type())?;
        if current <= 0 {
            return Ok(Some((0, false)));
        }
        *text = (current - 1).to_string();
        Ok(Some((current - 1, true)))
    }

    async fn list_range(&self, key: &str) -> Result<Option<Vec<String>>, SlotQueueError> {
        self.check()?;
        let mut items = self.items.lock().await;
        match live(&mut items, key).map(|item| &item.value) {
            Some(CacheValue::List(list)) => Ok(Some(list.clone())),
            Some(CacheValue::Text(_)) => Err(wrong_type()),
            None => Ok(None),
        }
    }

    async fn list_swap(
        &self,
        key: &str,
        expected: Option<&[String]>,
        items: &[String],
        ttl: Duration,
    ) -> Result<bool, SlotQueueError> {
        self.check()?;
        let mut store = self.items.lock().await;
        if let Some(expected) = expected {
            let current: &[String] = match live(&mut store, key).map(|item| &item.value) {
                Some(CacheValue::List(list)) => list.as_slice(),
                Some(CacheValue::Text(_)) => return Ok(false),
                None => &[],
            };
            if current != expected {
                return Ok(false);
            }
        }
        if items.is_empty() {
            store.remove(key);
        } else {
            store.insert(
                key.to_string(),
                CacheItem::new(CacheValue::List(items.to_vec()), ttl),
            );
        }
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, SlotQueueError> {
        self.check()?;
        let mut items = self.items.lock().await;
        match live(&mut items, key) {
            Some(item) => {
                item.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ==============================================================================
// LOCKS
// ==============================================================================

#[derive(Debug)]
struct HeldLock {
    holder: String,
    count: u32,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryLockManager {
    locks: Mutex<HashMap<String, HeldLock>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn holder_of(&self, key: &str) -> Option<String> {
        let locks = self.locks.lock().await;
        locks
            .get(key)
            .filter(|lock| Instant::now() < lock.expires_at)
            .map(|lock| lock.holder.clone())
    }

    /// Remaining lease of the current holder, `None` when acquired.
    async fn attempt(&self, key: &str, holder: &str, lease: Duration) -> Option<i64> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();
        match locks.get_mut(key) {
            Some(lock) if now < lock.expires_at && lock.holder != holder => {
                Some(lock.expires_at.duration_since(now).as_millis() as i64)
            }
            Some(lock) if now < lock.expires_at => {
                lock.count += 1;
                lock.expires_at = now + lease;
                None
            }
            _ => {
                locks.insert(
                    key.to_string(),
                    HeldLock {
                        holder: holder.to_string(),
                        count: 1,
                        expires_at: now + lease,
                    },
                );
                None
            }
        }
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_acquire(&self, key: &str, holder: &str, wait: Duration, lease: Duration) -> bool {
        let deadline = Instant::now() + wait;
        let mut attempt = 0;
        loop {
            let Some(pttl) = self.attempt(key, holder, lease).await else {
                return true;
            };
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(next_backoff(attempt, Some(pttl), deadline)).await;
            attempt += 1;
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<ReleaseOutcome, SlotQueueError> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();
        let Some(lock) = locks.get_mut(key).filter(|lock| now < lock.expires_at) else {
            locks.remove(key);
            return Ok(ReleaseOutcome::Absent);
        };
        if lock.holder != holder {
            warn!("Lock {} was not held by {}, force released", key, holder);
            locks.remove(key);
            return Ok(ReleaseOutcome::Forced);
        }
        lock.count -= 1;
        if lock.count > 0 {
            return Ok(ReleaseOutcome::StillHeld);
        }
        locks.remove(key);
        Ok(ReleaseOutcome::Released)
    }
}

// ==============================================================================
// STORE
// ==============================================================================

#[derive(Default)]
struct Tables {
    slots: BTreeMap<i64, Slot>,
    orders: BTreeMap<i64, Order>,
    queue_entries: BTreeMap<i64, QueueEntry>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Tables kept in memory. Individual write paths can be switched to fail.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    fail_slot_writes: AtomicBool,
    fail_order_writes: AtomicBool,
    fail_queue_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_slot_writes(&self, fail: bool) {
        self.fail_slot_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_order_writes(&self, fail: bool) {
        self.fail_order_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_queue_writes(&self, fail: bool) {
        self.fail_queue_writes.store(fail, Ordering::SeqCst);
    }

    fn guard(flag: &AtomicBool, table: &str) -> Result<(), SlotQueueError> {
        if flag.load(Ordering::SeqCst) {
            return Err(SlotQueueError::persistence(format!("{} write rejected", table)));
        }
        Ok(())
    }
}

#[async_trait]
impl SlotQueueStore for InMemoryStore {
    async fn get_slot(&self, slot_id: i64) -> Result<Option<Slot>, SlotQueueError> {
        Ok(self.tables.lock().await.slots.get(&slot_id).cloned())
    }

    async fn find_slot(
        &self,
        doctor_id: i64,
        date: NaiveDate,
        period: TimePeriod,
    ) -> Result<Option<Slot>, SlotQueueError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .slots
            .values()
            .find(|s| s.doctor_id == doctor_id && s.schedule_date == date && s.time_period == period)
            .cloned())
    }

    async fn insert_slot(&self, slot: &Slot) -> Result<Slot, SlotQueueError> {
        Self::guard(&self.fail_slot_writes, "slots")?;
        let mut tables = self.tables.lock().await;
        let mut row = slot.clone();
        row.id = tables.next_id();
        tables.slots.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_slot_counts(
        &self,
        slot_id: i64,
        booked_count: u32,
        status: SlotStatus,
    ) -> Result<Slot, SlotQueueError> {
        Self::guard(&self.fail_slot_writes, "slots")?;
        let mut tables = self.tables.lock().await;
        let slot = tables
            .slots
            .get_mut(&slot_id)
            .ok_or(SlotQueueError::SlotNotFound(slot_id))?;
        slot.booked_count = booked_count;
        slot.status = status;
        slot.updated_at = Utc::now();
        Ok(slot.clone())
    }

    async fn update_slot_status(&self, slot_id: i64, status: SlotStatus) -> Result<Slot, SlotQueueError> {
        Self::guard(&self.fail_slot_writes, "slots")?;
        let mut tables = self.tables.lock().await;
        let slot = tables
            .slots
            .get_mut(&slot_id)
            .ok_or(SlotQueueError::SlotNotFound(slot_id))?;
        slot.status = status;
        slot.updated_at = Utc::now();
        Ok(slot.clone())
    }

    async fn update_slot_terms(
        &self,
        slot_id: i64,
        fee_amount: i64,
        total_count: u32,
        status: SlotStatus,
    ) -> Result<Slot, SlotQueueError> {
        Self::guard(&self.fail_slot_writes, "slots")?;
        let mut tables = self.tables.lock().await;
        let slot = tables
            .slots
            .get_mut(&slot_id)
            .ok_or(SlotQueueError::SlotNotFound(slot_id))?;
        slot.fee_amount = fee_amount;
        slot.total_count = total_count;
        slot.status = status;
        slot.updated_at = Utc::now();
        Ok(slot.clone())
    }

    async fn list_doctor_slots(&self, doctor_id: i64, date: NaiveDate) -> Result<Vec<Slot>, SlotQueueError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .slots
            .values()
            .filter(|s| s.doctor_id == doctor_id && s.schedule_date == date)
            .cloned()
            .collect())
    }

    async fn list_slots_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Slot>, SlotQueueError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .slots
            .values()
            .filter(|s| s.schedule_date >= from && s.schedule_date <= to)
            .cloned()
            .collect())
    }

    async fn get_order(&self, order_id: i64) -> Result<Option<Order>, SlotQueueError> {
        Ok(self.tables.lock().await.orders.get(&order_id).cloned())
    }

    async fn find_active_order(&self, patient_id: i64, slot_id: i64) -> Result<Option<Order>, SlotQueueError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .orders
            .values()
            .find(|o| o.patient_id == patient_id && o.slot_id == slot_id && o.status.holds_slot())
            .cloned())
    }

    async fn list_open_orders(&self, patient_id: i64) -> Result<Vec<Order>, SlotQueueError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .orders
            .values()
            .filter(|o| o.patient_id == patient_id && o.status.is_open())
            .cloned()
            .collect())
    }

    async fn insert_order(&self, order: &Order) -> Result<Order, SlotQueueError> {
        Self::guard(&self.fail_order_writes, "orders")?;
        let mut tables = self.tables.lock().await;
        let mut row = order.clone();
        row.id = tables.next_id();
        tables.orders.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_order(&self, order: &Order) -> Result<Order, SlotQueueError> {
        Self::guard(&self.fail_order_writes, "orders")?;
        let mut tables = self.tables.lock().await;
        let row = tables
            .orders
            .get_mut(&order.id)
            .ok_or(SlotQueueError::OrderNotFound(order.id))?;
        *row = order.clone();
        Ok(row.clone())
    }

    async fn get_queue_entry(&self, entry_id: i64) -> Result<Option<QueueEntry>, SlotQueueError> {
        Ok(self.tables.lock().await.queue_entries.get(&entry_id).cloned())
    }

    async fn find_queue_entry_by_order(&self, order_id: i64) -> Result<Option<QueueEntry>, SlotQueueError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .queue_entries
            .values()
            .rev()
            .find(|e| e.order_id == order_id)
            .cloned())
    }

    async fn list_active_queue_entries(&self, doctor_id: i64) -> Result<Vec<QueueEntry>, SlotQueueError> {
        let tables = self.tables.lock().await;
        let mut entries: Vec<QueueEntry> = tables
            .queue_entries
            .values()
            .filter(|e| e.doctor_id == doctor_id && e.status.is_active())
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sort_key());
        Ok(entries)
    }

    async fn list_patient_queue_entries(&self, patient_id: i64) -> Result<Vec<QueueEntry>, SlotQueueError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .queue_entries
            .values()
            .filter(|e| e.patient_id == patient_id && e.status.is_active())
            .cloned()
            .collect())
    }

    async fn max_queue_number(&self, doctor_id: i64) -> Result<Option<u32>, SlotQueueError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .queue_entries
            .values()
            .filter(|e| e.doctor_id == doctor_id)
            .map(|e| e.queue_number)
            .max())
    }

    async fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<QueueEntry, SlotQueueError> {
        Self::guard(&self.fail_queue_writes, "queue_entries")?;
        let mut tables = self.tables.lock().await;
        let mut row = entry.clone();
        row.id = tables.next_id();
        tables.queue_entries.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_queue_entry(&self, entry: &QueueEntry) -> Result<QueueEntry, SlotQueueError> {
        Self::guard(&self.fail_queue_writes, "queue_entries")?;
        let mut tables = self.tables.lock().await;
        let row = tables
            .queue_entries
            .get_mut(&entry.id)
            .ok_or(SlotQueueError::QueueEntryNotFound(entry.id))?;
        *row = entry.clone();
        Ok(row.clone())
    }

    async fn delete_queue_entry(&self, entry_id: i64) -> Result<bool, SlotQueueError> {
        Self::guard(&self.fail_queue_writes, "queue_entries")?;
        Ok(self.tables.lock().await.queue_entries.remove(&entry_id).is_some())
    }

    async fn list_doctors_with_active_queue(&self) -> Result<Vec<i64>, SlotQueueError> {
        let tables = self.tables.lock().await;
        let doctors: BTreeSet<i64> = tables
            .queue_entries
            .values()
            .filter(|e| e.status.is_active())
            .map(|e| e.doctor_id)
            .collect();
        Ok(doctors.into_iter().collect())
    }
}

