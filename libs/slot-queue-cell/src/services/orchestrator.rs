use chrono::{NaiveDate, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::keys::LockKey;
use crate::models::{
    CancelOutcome, CheckInReceipt, Order, OrderStatus, Slot, SlotInventory, SlotQueueConfig,
    SlotRelease, SlotUpdate,
};
use crate::services::inventory::SlotInventoryService;
use crate::services::lifecycle::QueueLifecycleService;
use crate::services::lock::DistributedLocks;
use crate::services::store::SlotQueueStore;
use crate::SlotQueueError;
use shared_models::auth::RequestContext;

/// Booking, payment, check-in and cancellation as single units of work
/// under the slot lock. Preconditions checked before the lock are checked
/// again once it is held.
pub struct BookingOrchestrator {
    store: Arc<dyn SlotQueueStore>,
    inventory: Arc<SlotInventoryService>,
    lifecycle: Arc<QueueLifecycleService>,
    locks: DistributedLocks,
    config: SlotQueueConfig,
}

impl BookingOrchestrator {
    pub fn new(
        store: Arc<dyn SlotQueueStore>,
        inventory: Arc<SlotInventoryService>,
        lifecycle: Arc<QueueLifecycleService>,
        locks: DistributedLocks,
        config: SlotQueueConfig,
    ) -> Self {
        Self {
            store,
            inventory,
            lifecycle,
            locks,
            config,
        }
    }

    /// Takes a seat in the slot and records a pending order for it.
    #[instrument(skip(self, ctx))]
    pub async fn register_and_book(
        &self,
        ctx: &RequestContext,
        patient_id: i64,
        slot_id: i64,
        is_emergency: bool,
    ) -> Result<Order, SlotQueueError> {
        authorize_patient(ctx, patient_id)?;

        // Cheap rejections before contending for the lock.
        self.ensure_no_order_for_slot(patient_id, slot_id).await?;
        let slot = self.inventory.get_slot(slot_id).await?;
        if !slot.is_bookable() {
            info!("Slot {} is {} with {} left", slot_id, slot.status, slot.remaining());
            return Err(SlotQueueError::SlotUnavailable(slot_id));
        }
        self.ensure_no_registration_for_period(patient_id, &slot).await?;

        let guard = self
            .locks
            .acquire(LockKey::SlotOperation(slot_id), &ctx.lock_holder(), self.config.slot_lock)
            .await?;
        let result = self.book_locked(patient_id, slot_id, is_emergency).await;
        guard.release().await;

        if let Ok(order) = &result {
            info!(
                "Order {} ({}) booked on slot {} for patient {}",
                order.id, order.order_no, slot_id, patient_id
            );
        }
        result
    }

    async fn book_locked(&self, patient_id: i64, slot_id: i64, is_emergency: bool) -> Result<Order, SlotQueueError> {
        let slot = self.inventory.load_slot(slot_id).await?;
        if !slot.is_bookable() {
            return Err(SlotQueueError::SlotUnavailable(slot_id));
        }
        self.ensure_no_order_for_slot(patient_id, slot_id).await?;
        self.ensure_no_registration_for_period(patient_id, &slot).await?;

        if !self.inventory.book_slot(&slot).await? {
            return Err(SlotQueueError::SlotUnavailable(slot_id));
        }

        let now = Utc::now();
        let order = Order {
            id: 0,
            order_no: generate_order_no(&self.config.order_prefix),
            patient_id,
            slot_id,
            doctor_id: slot.doctor_id,
            department_id: slot.department_id,
            schedule_date: slot.schedule_date,
            time_period: slot.time_period,
            fee_amount: slot.fee_amount,
            status: OrderStatus::Pending,
            is_emergency,
            payment_time: None,
            check_in_time: None,
            cancel_time: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_order(&order).await {
            Ok(order) => Ok(order),
            Err(e) => {
                error!("Order for slot {} not saved, releasing seat: {}", slot_id, e);
                if let Err(undo) = self.inventory.cancel(slot_id, 0).await {
                    error!("Failed to release seat on slot {}: {}", slot_id, undo);
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self, ctx))]
    pub async fn pay_order(&self, ctx: &RequestContext, order_id: i64) -> Result<Order, SlotQueueError> {
        let order = self.load_order(order_id).await?;
        authorize_patient(ctx, order.patient_id)?;
        if order.status == OrderStatus::Paid {
            return Ok(order);
        }
        require_transition(&order, OrderStatus::Paid)?;

        let guard = self
            .locks
            .acquire(LockKey::SlotOperation(order.slot_id), &ctx.lock_holder(), self.config.slot_lock)
            .await?;

        let result: Result<Order, SlotQueueError> = async {
            let mut order = self.load_order(order_id).await?;
            if order.status == OrderStatus::Paid {
                return Ok(order);
            }
            require_transition(&order, OrderStatus::Paid)?;

            let now = Utc::now();
            order.status = OrderStatus::Paid;
            order.payment_time = Some(now);
            order.updated_at = now;
            let saved = self.store.update_order(&order).await?;
            info!("Order {} paid", order_id);
            Ok(saved)
        }
        .await;

        guard.release().await;
        result
    }

    /// Marks a paid order checked in and puts the patient in the doctor's
    /// queue. Repeating it for a checked-in order returns the same entry.
    #[instrument(skip(self, ctx))]
    pub async fn check_in(&self, ctx: &RequestContext, order_id: i64) -> Result<CheckInReceipt, SlotQueueError> {
        let order = self.load_order(order_id).await?;
        authorize_patient(ctx, order.patient_id)?;
        if order.status != OrderStatus::CheckedIn {
            require_transition(&order, OrderStatus::CheckedIn)?;
        }

        let guard = self
            .locks
            .acquire(LockKey::SlotOperation(order.slot_id), &ctx.lock_holder(), self.config.slot_lock)
            .await?;
        let result = self.check_in_locked(ctx, order_id).await;
        guard.release().await;
        result
    }

    async fn check_in_locked(&self, ctx: &RequestContext, order_id: i64) -> Result<CheckInReceipt, SlotQueueError> {
        let order = self.load_order(order_id).await?;

        let (order, entry) = match order.status {
            // Repeating a check-in only reports the entry still in the queue.
            OrderStatus::CheckedIn => {
                let entry = self.lifecycle.queued_entry_for_order(&order).await?;
                (order, entry)
            }
            _ => {
                require_transition(&order, OrderStatus::CheckedIn)?;
                let mut checked_in = order.clone();
                let now = Utc::now();
                checked_in.status = OrderStatus::CheckedIn;
                checked_in.check_in_time = Some(now);
                checked_in.updated_at = now;
                let saved = self.store.update_order(&checked_in).await?;

                match self.lifecycle.enqueue_checked_in(ctx, &saved).await {
                    Ok(entry) => (saved, entry),
                    Err(e) => {
                        warn!("Queueing order {} failed, reverting check-in: {}", order_id, e);
                        if let Err(undo) = self.store.update_order(&order).await {
                            error!("Failed to revert check-in of order {}: {}", order_id, undo);
                        }
                        return Err(e);
                    }
                }
            }
        };

        let position = self
            .lifecycle
            .patient_position(order.doctor_id, order.patient_id)
            .await?;

        info!(
            "Order {} checked in as number {} for doctor {}",
            order_id, entry.queue_number, order.doctor_id
        );
        Ok(CheckInReceipt {
            order,
            entry,
            position,
        })
    }

    /// Cancels a pending or paid order and gives its seat back exactly once.
    #[instrument(skip(self, ctx))]
    pub async fn cancel_order(
        &self,
        ctx: &RequestContext,
        order_id: i64,
        reason: Option<String>,
    ) -> Result<CancelOutcome, SlotQueueError> {
        let order = self.load_order(order_id).await?;
        authorize_patient(ctx, order.patient_id)?;
        if order.status == OrderStatus::Cancelled {
            debug!("Order {} already cancelled", order_id);
            return Ok(CancelOutcome::AlreadyCancelled(order));
        }
        require_transition(&order, OrderStatus::Cancelled)?;

        let guard = self
            .locks
            .acquire(LockKey::SlotOperation(order.slot_id), &ctx.lock_holder(), self.config.slot_lock)
            .await?;
        let result = self.cancel_locked(ctx, order_id, reason).await;
        guard.release().await;
        result
    }

    async fn cancel_locked(
        &self,
        ctx: &RequestContext,
        order_id: i64,
        reason: Option<String>,
    ) -> Result<CancelOutcome, SlotQueueError> {
        let order = self.load_order(order_id).await?;
        if order.status == OrderStatus::Cancelled {
            return Ok(CancelOutcome::AlreadyCancelled(order));
        }
        require_transition(&order, OrderStatus::Cancelled)?;

        let now = Utc::now();
        let mut cancelled = order.clone();
        cancelled.status = OrderStatus::Cancelled;
        cancelled.cancel_time = Some(now);
        cancelled.cancel_reason = reason;
        cancelled.updated_at = now;
        let saved = self.store.update_order(&cancelled).await?;

        let slot = match self.inventory.load_slot(order.slot_id).await {
            Ok(slot) => slot,
            Err(e) => return Err(self.revert_cancel(&order, e).await),
        };
        match self.inventory.cancel_slot(&slot, order_id).await {
            Ok(true) => {}
            Ok(false) => warn!("Slot {} had no seat to release for order {}", slot.id, order_id),
            Err(e) => return Err(self.revert_cancel(&order, e).await),
        }

        // Entries only exist after check-in, which cannot be cancelled.
        if let Err(e) = self.lifecycle.remove_for_order(ctx, &saved).await {
            warn!("Failed to remove queue entry of cancelled order {}: {}", order_id, e);
        }

        info!("Order {} cancelled, seat returned to slot {}", order_id, slot.id);
        Ok(CancelOutcome::Cancelled(saved))
    }

    async fn revert_cancel(&self, original: &Order, err: SlotQueueError) -> SlotQueueError {
        error!("Releasing seat for order {} failed, restoring order: {}", original.id, err);
        if let Err(undo) = self.store.update_order(original).await {
            error!("Failed to restore order {}: {}", original.id, undo);
        }
        err
    }

    pub async fn release_slot(&self, ctx: &RequestContext, request: SlotRelease) -> Result<Slot, SlotQueueError> {
        self.inventory.release_slot(ctx, request).await
    }

    /// Withdraws a slot that nobody has booked.
    #[instrument(skip(self, ctx))]
    pub async fn stop_slot(&self, ctx: &RequestContext, slot_id: i64) -> Result<Slot, SlotQueueError> {
        let slot = self.inventory.get_slot(slot_id).await?;
        authorize_doctor(ctx, &slot, "stop")?;

        let guard = self
            .locks
            .acquire(LockKey::SlotOperation(slot_id), &ctx.lock_holder(), self.config.slot_lock)
            .await?;
        let result = self.inventory.stop(slot_id).await;
        guard.release().await;
        result
    }

    /// Changes a slot's fee or capacity.
    #[instrument(skip(self, ctx))]
    pub async fn update_slot(
        &self,
        ctx: &RequestContext,
        slot_id: i64,
        update: SlotUpdate,
    ) -> Result<Slot, SlotQueueError> {
        let slot = self.inventory.get_slot(slot_id).await?;
        authorize_doctor(ctx, &slot, "update")?;

        let guard = self
            .locks
            .acquire(LockKey::SlotOperation(slot_id), &ctx.lock_holder(), self.config.slot_lock)
            .await?;
        let result = self.inventory.update_slot(slot_id, update).await;
        guard.release().await;
        result
    }

    pub async fn slots_for_doctor(&self, doctor_id: i64, date: NaiveDate) -> Result<Vec<SlotInventory>, SlotQueueError> {
        self.inventory.slots_for_doctor(doctor_id, date).await
    }

    pub async fn get_inventory(&self, slot_id: i64) -> Result<SlotInventory, SlotQueueError> {
        self.inventory.get_inventory(slot_id).await
    }

    pub async fn get_order(&self, ctx: &RequestContext, order_id: i64) -> Result<Order, SlotQueueError> {
        let order = self.load_order(order_id).await?;
        authorize_patient(ctx, order.patient_id)?;
        Ok(order)
    }

    async fn ensure_no_order_for_slot(&self, patient_id: i64, slot_id: i64) -> Result<(), SlotQueueError> {
        if self.store.find_active_order(patient_id, slot_id).await?.is_some() {
            return Err(SlotQueueError::DuplicateOrder { patient_id, slot_id });
        }
        Ok(())
    }

    /// One open registration per patient per date and period.
    async fn ensure_no_registration_for_period(&self, patient_id: i64, slot: &Slot) -> Result<(), SlotQueueError> {
        let clash = self
            .store
            .list_open_orders(patient_id)
            .await?
            .into_iter()
            .any(|o| o.schedule_date == slot.schedule_date && o.time_period == slot.time_period);
        if clash {
            return Err(SlotQueueError::DuplicateRegistration {
                patient_id,
                date: slot.schedule_date,
                period: slot.time_period,
            });
        }
        Ok(())
    }

    async fn load_order(&self, order_id: i64) -> Result<Order, SlotQueueError> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or(SlotQueueError::OrderNotFound(order_id))
    }
}

fn authorize_patient(ctx: &RequestContext, patient_id: i64) -> Result<(), SlotQueueError> {
    if ctx.is_privileged() || ctx.is_patient(patient_id) {
        return Ok(());
    }
    Err(SlotQueueError::PermissionDenied(format!(
        "actor {} may not act for patient {}",
        ctx.actor_id, patient_id
    )))
}

fn authorize_doctor(ctx: &RequestContext, slot: &Slot, action: &str) -> Result<(), SlotQueueError> {
    if ctx.is_privileged() || ctx.is_doctor(slot.doctor_id) {
        return Ok(());
    }
    Err(SlotQueueError::PermissionDenied(format!(
        "actor {} may not {} slot {}",
        ctx.actor_id, action, slot.id
    )))
}

fn require_transition(order: &Order, target: OrderStatus) -> Result<(), SlotQueueError> {
    if !order.status.can_transition_to(&target) {
        return Err(SlotQueueError::InvalidOrderState {
            order_id: order.id,
            status: order.status,
        });
    }
    Ok(())
}

/// Prefix, the last six base-36 digits of the current millisecond
/// timestamp and three random digits; at most 20 characters.
pub fn generate_order_no(prefix: &str) -> String {
    let stamp = to_base36(Utc::now().timestamp_millis().max(0) as u64);
    let tail = &stamp[stamp.len().saturating_sub(6)..];
    let random: u16 = rand::thread_rng().gen_range(0..1000);
    let mut order_no = format!("{}{}{:03}", prefix, tail, random);
    order_no.truncate(20);
    order_no
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
