use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;
use tracing::warn;

// ==============================================================================
// SLOTS
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimePeriod {
    Morning,
    Afternoon,
    Night,
}

impl TimePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimePeriod::Morning => "morning",
            TimePeriod::Afternoon => "afternoon",
            TimePeriod::Night => "night",
        }
    }
}

impl fmt::Display for TimePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Available,
    Full,
    /// Terminal; overrides whatever the counters say.
    Stopped,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Full => "full",
            SlotStatus::Stopped => "stopped",
        }
    }

    /// Status implied by the counters, keeping `Stopped` sticky.
    pub fn derive(current: SlotStatus, booked: u32, total: u32) -> SlotStatus {
        match current {
            SlotStatus::Stopped => SlotStatus::Stopped,
            _ if booked >= total => SlotStatus::Full,
            _ => SlotStatus::Available,
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: i64,
    pub doctor_id: i64,
    pub department_id: i64,
    pub schedule_date: NaiveDate,
    pub time_period: TimePeriod,
    pub fee_amount: i64,
    pub total_count: u32,
    pub booked_count: u32,
    pub status: SlotStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Slot {
    pub fn remaining(&self) -> u32 {
        self.total_count.saturating_sub(self.booked_count)
    }

    pub fn is_bookable(&self) -> bool {
        self.status == SlotStatus::Available && self.remaining() > 0
    }
}

/// Request to publish a new slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotRelease {
    pub doctor_id: i64,
    pub department_id: i64,
    pub schedule_date: NaiveDate,
    pub time_period: TimePeriod,
    pub fee_amount: i64,
    pub total_count: u32,
}

/// Changes to a published slot; `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotUpdate {
    pub fee_amount: Option<i64>,
    pub total_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInventory {
    pub slot_id: i64,
    pub total: u32,
    pub booked: u32,
    pub remaining: u32,
    pub status: SlotStatus,
}

impl SlotInventory {
    pub fn from_counts(slot_id: i64, total: u32, booked: u32, status: SlotStatus) -> Self {
        Self {
            slot_id,
            total,
            booked,
            remaining: total.saturating_sub(booked),
            status: SlotStatus::derive(status, booked, total),
        }
    }
}

// ==============================================================================
// ORDERS
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
    CheckedIn,
    Completed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::CheckedIn => "checked_in",
            OrderStatus::Completed => "completed",
        }
    }

    /// Pending and paid orders are still open and may be cancelled.
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Paid)
    }

    /// Every status except cancelled keeps its seat in the slot.
    pub fn holds_slot(&self) -> bool {
        !matches!(self, OrderStatus::Cancelled)
    }

    pub fn can_transition_to(&self, target: &OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, target),
            (Pending, Paid)
                | (Pending, Cancelled)
                | (Paid, CheckedIn)
                | (Paid, Cancelled)
                | (CheckedIn, Completed)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub order_no: String,
    pub patient_id: i64,
    pub slot_id: i64,
    pub doctor_id: i64,
    pub department_id: i64,
    pub schedule_date: NaiveDate,
    pub time_period: TimePeriod,
    pub fee_amount: i64,
    pub status: OrderStatus,
    pub is_emergency: bool,
    pub payment_time: Option<DateTime<Utc>>,
    pub check_in_time: Option<DateTime<Utc>>,
    pub cancel_time: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled(Order),
    /// The order was cancelled earlier; nothing was changed.
    AlreadyCancelled(Order),
}

impl CancelOutcome {
    pub fn order(&self) -> &Order {
        match self {
            CancelOutcome::Cancelled(order) | CancelOutcome::AlreadyCancelled(order) => order,
        }
    }
}

// ==============================================================================
// QUEUE
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Waiting,
    Calling,
    Treating,
    Completed,
    Missed,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Waiting => "waiting",
            QueueStatus::Calling => "calling",
            QueueStatus::Treating => "treating",
            QueueStatus::Completed => "completed",
            QueueStatus::Missed => "missed",
            QueueStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that belong in the doctor's live queue.
    pub fn is_active(&self) -> bool {
        matches!(self, QueueStatus::Waiting | QueueStatus::Calling | QueueStatus::Treating)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(&self, target: &QueueStatus) -> bool {
        use QueueStatus::*;
        match (self, target) {
            (Waiting, Calling) => true,
            (Calling, Treating) => true,
            (Treating, Completed) => true,
            (Calling, Waiting) => true,
            (Waiting | Calling | Treating, Missed) => true,
            (Waiting, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub order_id: i64,
    pub patient_id: i64,
    pub doctor_id: i64,
    pub department_id: i64,
    pub is_priority: bool,
    pub queue_number: u32,
    pub status: QueueStatus,
    pub missed_count: u32,
    pub max_missed_allowed: u32,
    pub check_in_time: Option<DateTime<Utc>>,
    pub call_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Priority entries first, then ascending queue number.
    pub fn sort_key(&self) -> (bool, u32) {
        (!self.is_priority, self.queue_number)
    }

    /// True when one more miss uses up the allowance.
    pub fn miss_exhausts(&self) -> bool {
        self.missed_count + 1 >= self.max_missed_allowed
    }
}

/// Canonical cached ordering: active entries only, the priority sublist
/// followed by the normal sublist, each by ascending queue number.
pub fn arrange_queue(entries: Vec<QueueEntry>) -> Vec<QueueEntry> {
    let (mut priority, mut normal): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .filter(|e| e.status.is_active())
        .partition(|e| e.is_priority);
    priority.sort_by_key(|e| (e.queue_number, e.id));
    normal.sort_by_key(|e| (e.queue_number, e.id));
    priority.extend(normal);
    priority
}

/// Index an entry should take in an already arranged queue: behind every
/// entry of its own class with a lower number.
pub fn insertion_index(queue: &[QueueEntry], entry: &QueueEntry) -> usize {
    let key = entry.sort_key();
    queue
        .iter()
        .position(|e| e.sort_key() > key)
        .unwrap_or(queue.len())
}

/// First waiting entry in arranged order.
pub fn next_waiting(queue: &[QueueEntry]) -> Option<&QueueEntry> {
    queue.iter().find(|e| e.status == QueueStatus::Waiting)
}

/// 1-based place of the patient among waiting entries.
pub fn waiting_position(queue: &[QueueEntry], patient_id: i64) -> Option<usize> {
    queue
        .iter()
        .filter(|e| e.status == QueueStatus::Waiting)
        .position(|e| e.patient_id == patient_id)
        .map(|idx| idx + 1)
}

#[derive(Debug, Clone, PartialEq)]
pub enum MissedOutcome {
    /// Back to waiting at the end of its class with a fresh number.
    Requeued(QueueEntry),
    /// Allowance used up; the entry is gone from store and cache.
    Removed(QueueEntry),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckInReceipt {
    pub order: Order,
    pub entry: QueueEntry,
    pub position: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatientQueueView {
    pub entry: QueueEntry,
    pub position: Option<usize>,
    pub queue_length: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreloadReport {
    pub slots_warmed: usize,
    pub slots_skipped: usize,
    pub queues_rebuilt: usize,
    pub failures: usize,
}

// ==============================================================================
// CONFIGURATION
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTiming {
    pub wait: Duration,
    pub lease: Duration,
}

impl LockTiming {
    pub fn from_millis(wait_ms: u64, lease_ms: u64) -> Self {
        Self {
            wait: Duration::from_millis(wait_ms),
            lease: Duration::from_millis(lease_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlotQueueConfig {
    pub slot_lock: LockTiming,
    pub queue_lock: LockTiming,
    pub slot_cache_ttl: Duration,
    pub queue_cache_ttl: Duration,
    pub max_missed_allowed: u32,
    pub max_slot_count: u32,
    pub max_fee_amount: i64,
    pub queue_cas_retries: u32,
    pub order_prefix: String,
    pub preload_days: u32,
    pub preload_interval: Duration,
}

impl Default for SlotQueueConfig {
    fn default() -> Self {
        Self {
            slot_lock: LockTiming::from_millis(3000, 15000),
            queue_lock: LockTiming::from_millis(3000, 10000),
            slot_cache_ttl: Duration::from_secs(25 * 3600),
            queue_cache_ttl: Duration::from_secs(24 * 3600),
            max_missed_allowed: 3,
            max_slot_count: 20,
            max_fee_amount: 10000,
            queue_cas_retries: 3,
            order_prefix: "ORD".to_string(),
            preload_days: 7,
            preload_interval: Duration::from_secs(24 * 3600),
        }
    }
}

impl SlotQueueConfig {
    /// Defaults overridden by any of the `SLOT_*`, `QUEUE_*`, `ORDER_PREFIX`
    /// and `PRELOAD_*` variables that are set.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            slot_lock: LockTiming::from_millis(
                env_or("SLOT_LOCK_WAIT_MS", defaults.slot_lock.wait.as_millis() as u64),
                env_or("SLOT_LOCK_LEASE_MS", defaults.slot_lock.lease.as_millis() as u64),
            ),
            queue_lock: LockTiming::from_millis(
                env_or("QUEUE_LOCK_WAIT_MS", defaults.queue_lock.wait.as_millis() as u64),
                env_or("QUEUE_LOCK_LEASE_MS", defaults.queue_lock.lease.as_millis() as u64),
            ),
            slot_cache_ttl: Duration::from_secs(env_or(
                "SLOT_CACHE_TTL_SECS",
                defaults.slot_cache_ttl.as_secs(),
            )),
            queue_cache_ttl: Duration::from_secs(env_or(
                "QUEUE_CACHE_TTL_SECS",
                defaults.queue_cache_ttl.as_secs(),
            )),
            max_missed_allowed: env_or("QUEUE_MAX_MISSED", defaults.max_missed_allowed),
            max_slot_count: env_or("SLOT_MAX_COUNT", defaults.max_slot_count),
            max_fee_amount: env_or("SLOT_MAX_FEE", defaults.max_fee_amount),
            queue_cas_retries: env_or("QUEUE_CAS_RETRIES", defaults.queue_cas_retries),
            order_prefix: env::var("ORDER_PREFIX").unwrap_or(defaults.order_prefix),
            preload_days: env_or("PRELOAD_DAYS", defaults.preload_days),
            // A zero period is rejected by `tokio::time::interval`.
            preload_interval: Duration::from_secs(
                env_or("PRELOAD_INTERVAL_SECS", defaults.preload_interval.as_secs()).max(1),
            ),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has an invalid value {:?}, using default", name, raw);
            default
        }),
        Err(_) => default,
    }
}
