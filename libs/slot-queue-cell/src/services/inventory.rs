use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::keys;
use crate::models::{Slot, SlotInventory, SlotQueueConfig, SlotRelease, SlotStatus, SlotUpdate};
use crate::services::cache::CacheBackend;
use crate::services::store::SlotQueueStore;
use crate::SlotQueueError;
use shared_models::auth::RequestContext;

/// Booked/total counters per slot. The cache counter is the atomic
/// arbiter; every successful change is persisted before returning.
pub struct SlotInventoryService {
    store: Arc<dyn SlotQueueStore>,
    cache: Arc<dyn CacheBackend>,
    config: SlotQueueConfig,
}

impl SlotInventoryService {
    pub fn new(
        store: Arc<dyn SlotQueueStore>,
        cache: Arc<dyn CacheBackend>,
        config: SlotQueueConfig,
    ) -> Self {
        Self { store, cache, config }
    }

    /// Cached slot record, read through from the store on a miss.
    pub async fn get_slot(&self, slot_id: i64) -> Result<Slot, SlotQueueError> {
        match self.cache.get(&keys::slot(slot_id)).await {
            Ok(Some(json)) => match serde_json::from_str::<Slot>(&json) {
                Ok(slot) => return Ok(slot),
                Err(e) => warn!("Cached slot {} is unreadable, reloading: {}", slot_id, e),
            },
            Ok(None) => debug!("Slot {} not cached", slot_id),
            Err(e) => warn!("Cache read for slot {} failed: {}", slot_id, e),
        }
        self.load_slot(slot_id).await
    }

    /// Slot straight from the store; refreshes the cached record.
    pub async fn load_slot(&self, slot_id: i64) -> Result<Slot, SlotQueueError> {
        let slot = self
            .store
            .get_slot(slot_id)
            .await?
            .ok_or(SlotQueueError::SlotNotFound(slot_id))?;
        self.cache_slot(&slot).await;
        Ok(slot)
    }

    /// Takes one seat. `Ok(false)` means sold out or not open for booking.
    pub async fn book(&self, slot_id: i64) -> Result<bool, SlotQueueError> {
        let slot = self.load_slot(slot_id).await?;
        self.book_slot(&slot).await
    }

    /// [`book`](Self::book) against a slot the caller just read from the store.
    #[instrument(skip(self, slot), fields(slot_id = slot.id))]
    pub async fn book_slot(&self, slot: &Slot) -> Result<bool, SlotQueueError> {
        if slot.status != SlotStatus::Available {
            info!("Slot {} is {}, not bookable", slot.id, slot.status);
            return Ok(false);
        }

        let booked_key = keys::booked_count(slot.id);
        self.ensure_counters(slot)
            .await
            .map_err(|e| self.counter_failure(&booked_key, e))?;

        let booked = self
            .cache
            .incr(&booked_key, 1)
            .await
            .map_err(|e| self.counter_failure(&booked_key, e))?;

        if booked > i64::from(slot.total_count) {
            self.undo_counter(slot.id, -1).await;
            info!("Slot {} is sold out ({} seats)", slot.id, slot.total_count);
            return Ok(false);
        }

        let booked = booked as u32;
        let status = SlotStatus::derive(slot.status, booked, slot.total_count);
        match self.store.update_slot_counts(slot.id, booked, status).await {
            Ok(updated) => {
                self.cache_slot(&updated).await;
                debug!("Slot {} booked {}/{}", slot.id, booked, slot.total_count);
                Ok(true)
            }
            Err(e) => {
                error!("Persisting booking on slot {} failed, rolling back: {}", slot.id, e);
                self.undo_counter(slot.id, -1).await;
                Err(e)
            }
        }
    }

    /// Gives one seat back. `Ok(false)` when the counter was already zero.
    pub async fn cancel(&self, slot_id: i64, order_id: i64) -> Result<bool, SlotQueueError> {
        let slot = self.load_slot(slot_id).await?;
        self.cancel_slot(&slot, order_id).await
    }

    #[instrument(skip(self, slot), fields(slot_id = slot.id))]
    pub async fn cancel_slot(&self, slot: &Slot, order_id: i64) -> Result<bool, SlotQueueError> {
        let booked_key = keys::booked_count(slot.id);
        self.ensure_counters(slot)
            .await
            .map_err(|e| self.counter_failure(&booked_key, e))?;

        let (booked, applied) = self
            .cache
            .decr_floor_zero(&booked_key)
            .await
            .map_err(|e| self.counter_failure(&booked_key, e))?
            .ok_or_else(|| SlotQueueError::busy(&booked_key))?;

        if !applied {
            warn!("Slot {} has no bookings to release for order {}", slot.id, order_id);
            return Ok(false);
        }

        let booked = booked.max(0) as u32;
        let status = SlotStatus::derive(slot.status, booked, slot.total_count);
        match self.store.update_slot_counts(slot.id, booked, status).await {
            Ok(updated) => {
                self.cache_slot(&updated).await;
                debug!("Slot {} released a seat for order {}", slot.id, order_id);
                Ok(true)
            }
            Err(e) => {
                error!("Persisting cancellation on slot {} failed, rolling back: {}", slot.id, e);
                self.undo_counter(slot.id, 1).await;
                Err(e)
            }
        }
    }

    pub async fn get_inventory(&self, slot_id: i64) -> Result<SlotInventory, SlotQueueError> {
        match self.cached_inventory(slot_id).await {
            Ok(Some(inventory)) => return Ok(inventory),
            Ok(None) => debug!("Inventory for slot {} not cached, loading", slot_id),
            Err(e) => warn!("Inventory cache for slot {} unusable: {}", slot_id, e),
        }

        let slot = self.load_slot(slot_id).await?;
        Ok(self.reseeded_inventory(&slot).await)
    }

    /// A doctor's slots on one date with their current counters.
    #[instrument(skip(self))]
    pub async fn slots_for_doctor(&self, doctor_id: i64, date: NaiveDate) -> Result<Vec<SlotInventory>, SlotQueueError> {
        let slots = self.store.list_doctor_slots(doctor_id, date).await?;
        let mut inventories = Vec::with_capacity(slots.len());
        for slot in slots {
            let inventory = match self.cached_inventory(slot.id).await {
                Ok(Some(inventory)) => inventory,
                Ok(None) => {
                    self.cache_slot(&slot).await;
                    self.reseeded_inventory(&slot).await
                }
                Err(e) => {
                    warn!("Inventory cache for slot {} unusable: {}", slot.id, e);
                    self.reseeded_inventory(&slot).await
                }
            };
            inventories.push(inventory);
        }
        Ok(inventories)
    }

    async fn reseeded_inventory(&self, slot: &Slot) -> SlotInventory {
        if let Err(e) = self.ensure_counters(slot).await {
            warn!("Failed to repopulate counters for slot {}: {}", slot.id, e);
        }
        SlotInventory::from_counts(slot.id, slot.total_count, slot.booked_count, slot.status)
    }

    async fn cached_inventory(&self, slot_id: i64) -> Result<Option<SlotInventory>, SlotQueueError> {
        let booked = self.cache.get(&keys::booked_count(slot_id)).await?;
        let total = self.cache.get(&keys::total_count(slot_id)).await?;
        let record = self.cache.get(&keys::slot(slot_id)).await?;

        let (Some(booked), Some(total), Some(record)) = (booked, total, record) else {
            return Ok(None);
        };
        let (Ok(booked), Ok(total)) = (booked.parse::<u32>(), total.parse::<u32>()) else {
            return Ok(None);
        };
        let slot: Slot = serde_json::from_str(&record)?;
        Ok(Some(SlotInventory::from_counts(slot_id, total, booked, slot.status)))
    }

    /// Publishes a new slot for a doctor, date and period.
    #[instrument(skip(self, ctx))]
    pub async fn release_slot(&self, ctx: &RequestContext, request: SlotRelease) -> Result<Slot, SlotQueueError> {
        if !ctx.is_privileged() && !ctx.is_doctor(request.doctor_id) {
            return Err(SlotQueueError::PermissionDenied(format!(
                "actor {} may not release slots for doctor {}",
                ctx.actor_id, request.doctor_id
            )));
        }
        self.validate_release(&request)?;

        if self
            .store
            .find_slot(request.doctor_id, request.schedule_date, request.time_period)
            .await?
            .is_some()
        {
            return Err(SlotQueueError::SlotAlreadyExists {
                doctor_id: request.doctor_id,
                date: request.schedule_date,
                period: request.time_period,
            });
        }

        let now = Utc::now();
        let slot = self
            .store
            .insert_slot(&Slot {
                id: 0,
                doctor_id: request.doctor_id,
                department_id: request.department_id,
                schedule_date: request.schedule_date,
                time_period: request.time_period,
                fee_amount: request.fee_amount,
                total_count: request.total_count,
                booked_count: 0,
                status: SlotStatus::Available,
                created_at: now,
                updated_at: now,
            })
            .await?;

        if let Err(e) = self.warm(&slot).await {
            warn!("Failed to cache new slot {}: {}", slot.id, e);
        }
        info!(
            "Slot {} released for doctor {} on {} {}",
            slot.id, slot.doctor_id, slot.schedule_date, slot.time_period
        );
        Ok(slot)
    }

    /// Changes fee or capacity of a slot. Capacity never drops below the
    /// seats already booked, and a new capacity replaces the cached total.
    /// Caller holds the slot lock.
    #[instrument(skip(self))]
    pub async fn update_slot(&self, slot_id: i64, update: SlotUpdate) -> Result<Slot, SlotQueueError> {
        let slot = self.load_slot(slot_id).await?;
        let fee_amount = update.fee_amount.unwrap_or(slot.fee_amount);
        let total_count = update.total_count.unwrap_or(slot.total_count);
        self.validate_terms(fee_amount, total_count)?;
        if total_count < slot.booked_count {
            return Err(SlotQueueError::Validation(format!(
                "slot {} already has {} bookings",
                slot_id, slot.booked_count
            )));
        }

        let status = SlotStatus::derive(slot.status, slot.booked_count, total_count);
        let updated = self
            .store
            .update_slot_terms(slot_id, fee_amount, total_count, status)
            .await?;

        if total_count != slot.total_count {
            if let Err(e) = self.cache.delete(&[keys::total_count(slot_id)]).await {
                error!("Failed to evict total counter of slot {}: {}", slot_id, e);
            }
        }
        self.cache_slot(&updated).await;
        info!(
            "Slot {} updated: fee {}, {} seats ({})",
            slot_id, updated.fee_amount, updated.total_count, updated.status
        );
        Ok(updated)
    }

    fn validate_release(&self, request: &SlotRelease) -> Result<(), SlotQueueError> {
        self.validate_terms(request.fee_amount, request.total_count)?;
        if request.schedule_date < Utc::now().date_naive() {
            return Err(SlotQueueError::Validation(
                "schedule date cannot be in the past".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_terms(&self, fee_amount: i64, total_count: u32) -> Result<(), SlotQueueError> {
        if fee_amount <= 0 || fee_amount > self.config.max_fee_amount {
            return Err(SlotQueueError::Validation(format!(
                "fee must be between 1 and {}",
                self.config.max_fee_amount
            )));
        }
        if total_count == 0 || total_count > self.config.max_slot_count {
            return Err(SlotQueueError::Validation(format!(
                "slot count must be between 1 and {}",
                self.config.max_slot_count
            )));
        }
        Ok(())
    }

    /// Withdraws a slot with no bookings. Caller holds the slot lock.
    pub async fn stop(&self, slot_id: i64) -> Result<Slot, SlotQueueError> {
        let slot = self.load_slot(slot_id).await?;
        if slot.booked_count > 0 {
            return Err(SlotQueueError::SlotHasBookings {
                slot_id,
                booked: slot.booked_count,
            });
        }
        if slot.status == SlotStatus::Stopped {
            return Ok(slot);
        }

        let stopped = self.store.update_slot_status(slot_id, SlotStatus::Stopped).await?;
        self.cache_slot(&stopped).await;
        info!("Slot {} stopped", slot_id);
        Ok(stopped)
    }

    /// Refreshes the cached record and both counters from `slot`. The booked
    /// counter is never lowered; a seat taken ahead of its store write stays
    /// taken.
    pub async fn warm(&self, slot: &Slot) -> Result<(), SlotQueueError> {
        let ttl = self.config.slot_cache_ttl;
        self.cache
            .set(&keys::slot(slot.id), &serde_json::to_string(slot)?, ttl)
            .await?;
        self.cache
            .set(&keys::total_count(slot.id), &slot.total_count.to_string(), ttl)
            .await?;
        let booked = self
            .cache
            .set_max(&keys::booked_count(slot.id), i64::from(slot.booked_count), ttl)
            .await?;
        if booked > i64::from(slot.booked_count) {
            debug!(
                "Slot {} counter {} ahead of store {}, kept",
                slot.id, booked, slot.booked_count
            );
        }
        Ok(())
    }

    pub async fn evict(&self, slot_id: i64) -> Result<(), SlotQueueError> {
        self.cache
            .delete(&[
                keys::slot(slot_id),
                keys::booked_count(slot_id),
                keys::total_count(slot_id),
            ])
            .await
    }

    /// Seeds missing counters from the store record without clobbering
    /// values written concurrently.
    async fn ensure_counters(&self, slot: &Slot) -> Result<(), SlotQueueError> {
        let ttl = self.config.slot_cache_ttl;
        if self
            .cache
            .set_nx(&keys::booked_count(slot.id), &slot.booked_count.to_string(), ttl)
            .await?
        {
            debug!("Seeded booked counter for slot {}", slot.id);
        }
        self.cache
            .set_nx(&keys::total_count(slot.id), &slot.total_count.to_string(), ttl)
            .await?;
        Ok(())
    }

    /// Reverses a counter change. If that fails too the counters are dropped
    /// so the next operation reseeds them from the store.
    async fn undo_counter(&self, slot_id: i64, delta: i64) {
        if let Err(e) = self.cache.incr(&keys::booked_count(slot_id), delta).await {
            error!("Failed to restore counter for slot {}: {}", slot_id, e);
            if let Err(e) = self.evict(slot_id).await {
                error!("Failed to evict counters for slot {}: {}", slot_id, e);
            }
        }
    }

    fn counter_failure(&self, key: &str, err: SlotQueueError) -> SlotQueueError {
        if err.is_cache_failure() {
            warn!("Counter {} unavailable: {}", key, err);
            SlotQueueError::busy(key)
        } else {
            err
        }
    }

    async fn cache_slot(&self, slot: &Slot) {
        let json = match serde_json::to_string(slot) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode slot {}: {}", slot.id, e);
                return;
            }
        };
        if let Err(e) = self
            .cache
            .set(&keys::slot(slot.id), &json, self.config.slot_cache_ttl)
            .await
        {
            warn!("Failed to cache slot {}: {}", slot.id, e);
        }
    }
}
