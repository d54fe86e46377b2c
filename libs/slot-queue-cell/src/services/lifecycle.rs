use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::keys::LockKey;
use crate::models::{
    next_waiting, waiting_position, MissedOutcome, Order, OrderStatus, PatientQueueView,
    QueueEntry, QueueStatus, SlotQueueConfig,
};
use crate::services::lock::DistributedLocks;
use crate::services::queue_store::DoctorQueueCache;
use crate::services::store::SlotQueueStore;
use crate::SlotQueueError;
use shared_models::auth::RequestContext;

/// Status transitions of queue entries. Each one takes the doctor's queue
/// lock, re-reads the durable record, writes it, then updates the cache.
pub struct QueueLifecycleService {
    store: Arc<dyn SlotQueueStore>,
    queue: Arc<DoctorQueueCache>,
    locks: DistributedLocks,
    config: SlotQueueConfig,
}

impl QueueLifecycleService {
    pub fn new(
        store: Arc<dyn SlotQueueStore>,
        queue: Arc<DoctorQueueCache>,
        locks: DistributedLocks,
        config: SlotQueueConfig,
    ) -> Self {
        Self {
            store,
            queue,
            locks,
            config,
        }
    }

    /// Moves the head waiting entry of the doctor's queue to calling.
    #[instrument(skip(self, ctx))]
    pub async fn call_next(&self, ctx: &RequestContext, doctor_id: i64) -> Result<QueueEntry, SlotQueueError> {
        authorize_doctor(ctx, doctor_id)?;

        let guard = self
            .locks
            .acquire(LockKey::QueueCall(doctor_id), &ctx.lock_holder(), self.config.queue_lock)
            .await?;
        let result = self.call_next_locked(doctor_id).await;
        guard.release().await;
        result
    }

    async fn call_next_locked(&self, doctor_id: i64) -> Result<QueueEntry, SlotQueueError> {
        let mut queue = self.queue.snapshot(doctor_id).await?;

        // A second pass runs on a freshly rebuilt queue.
        for _ in 0..2 {
            if queue.is_empty() {
                return Err(SlotQueueError::QueueEmpty(doctor_id));
            }
            let candidate = next_waiting(&queue).ok_or(SlotQueueError::NoPatientToCall(doctor_id))?;

            match self.store.get_queue_entry(candidate.id).await? {
                Some(mut entry) if entry.status == QueueStatus::Waiting => {
                    let now = Utc::now();
                    entry.status = QueueStatus::Calling;
                    entry.call_time = Some(now);
                    entry.updated_at = now;

                    let saved = self.store.update_queue_entry(&entry).await?;
                    self.queue.update_by_id(doctor_id, &saved).await;
                    info!(
                        "Doctor {} called patient {} (number {})",
                        doctor_id, saved.patient_id, saved.queue_number
                    );
                    return Ok(saved);
                }
                _ => {
                    warn!(
                        "Cached entry {} for doctor {} is stale, rebuilding",
                        candidate.id, doctor_id
                    );
                    queue = self.queue.rebuild(doctor_id).await?;
                }
            }
        }

        Err(SlotQueueError::NoPatientToCall(doctor_id))
    }

    #[instrument(skip(self, ctx))]
    pub async fn start_treatment(&self, ctx: &RequestContext, entry_id: i64) -> Result<QueueEntry, SlotQueueError> {
        let entry = self.load_entry(entry_id).await?;
        authorize_doctor(ctx, entry.doctor_id)?;
        let doctor_id = entry.doctor_id;

        let locks = self
            .locks
            .acquire_all(
                &[LockKey::QueueStartTreatment(doctor_id), LockKey::QueueCall(doctor_id)],
                &ctx.lock_holder(),
                self.config.queue_lock,
            )
            .await?;

        let result: Result<QueueEntry, SlotQueueError> = async {
            let mut entry = self.load_entry(entry_id).await?;
            require_status(&entry, QueueStatus::Calling)?;

            let now = Utc::now();
            entry.status = QueueStatus::Treating;
            entry.start_time = Some(now);
            entry.updated_at = now;

            let saved = self.store.update_queue_entry(&entry).await?;
            self.queue.update_by_id(doctor_id, &saved).await;
            debug!("Entry {} now treating", entry_id);
            Ok(saved)
        }
        .await;

        locks.release().await;
        result
    }

    /// Finishes treatment: the entry leaves the cached queue, the durable
    /// record stays as history and the order is completed.
    #[instrument(skip(self, ctx))]
    pub async fn complete_treatment(&self, ctx: &RequestContext, entry_id: i64) -> Result<QueueEntry, SlotQueueError> {
        let entry = self.load_entry(entry_id).await?;
        authorize_doctor(ctx, entry.doctor_id)?;
        let doctor_id = entry.doctor_id;

        let locks = self
            .locks
            .acquire_all(
                &[LockKey::QueueCompleteTreatment(doctor_id), LockKey::QueueCall(doctor_id)],
                &ctx.lock_holder(),
                self.config.queue_lock,
            )
            .await?;

        let result: Result<QueueEntry, SlotQueueError> = async {
            let mut entry = self.load_entry(entry_id).await?;
            require_status(&entry, QueueStatus::Treating)?;

            self.complete_order(entry.order_id).await?;

            let now = Utc::now();
            entry.status = QueueStatus::Completed;
            entry.end_time = Some(now);
            entry.updated_at = now;

            let saved = self.store.update_queue_entry(&entry).await?;
            self.queue.remove_by_id(doctor_id, entry_id).await;
            info!("Entry {} completed for doctor {}", entry_id, doctor_id);
            Ok(saved)
        }
        .await;

        locks.release().await;
        result
    }

    async fn complete_order(&self, order_id: i64) -> Result<(), SlotQueueError> {
        let Some(mut order) = self.store.get_order(order_id).await? else {
            warn!("Order {} behind a queue entry no longer exists", order_id);
            return Ok(());
        };
        if order.status == OrderStatus::Completed {
            return Ok(());
        }
        if !order.status.can_transition_to(&OrderStatus::Completed) {
            warn!("Order {} is {}, leaving it unchanged", order_id, order.status);
            return Ok(());
        }
        order.status = OrderStatus::Completed;
        order.updated_at = Utc::now();
        self.store.update_order(&order).await?;
        Ok(())
    }

    /// A called patient did not show up. Below the allowance the entry goes
    /// back to waiting at the end of its class; at the allowance it is
    /// deleted.
    #[instrument(skip(self, ctx))]
    pub async fn handle_missed(&self, ctx: &RequestContext, entry_id: i64) -> Result<MissedOutcome, SlotQueueError> {
        let entry = self.load_entry(entry_id).await?;
        authorize_doctor(ctx, entry.doctor_id)?;
        let doctor_id = entry.doctor_id;

        let locks = self
            .locks
            .acquire_all(
                &[LockKey::QueueMissed(doctor_id), LockKey::QueueCall(doctor_id)],
                &ctx.lock_holder(),
                self.config.queue_lock,
            )
            .await?;

        let result: Result<MissedOutcome, SlotQueueError> = async {
            let mut entry = self.load_entry(entry_id).await?;
            require_status(&entry, QueueStatus::Calling)?;
            let now = Utc::now();

            if entry.miss_exhausts() {
                self.store.delete_queue_entry(entry_id).await?;
                self.queue.remove_by_id(doctor_id, entry_id).await;

                entry.missed_count += 1;
                entry.status = QueueStatus::Missed;
                entry.end_time = Some(now);
                entry.updated_at = now;
                info!(
                    "Entry {} missed {} times, removed from doctor {} queue",
                    entry_id, entry.missed_count, doctor_id
                );
                return Ok(MissedOutcome::Removed(entry));
            }

            let number = self.next_queue_number(ctx, doctor_id).await?;
            entry.missed_count += 1;
            entry.status = QueueStatus::Waiting;
            entry.queue_number = number;
            entry.call_time = None;
            entry.updated_at = now;

            let saved = self.store.update_queue_entry(&entry).await?;
            self.queue.insert(doctor_id, &saved).await;
            info!(
                "Entry {} missed ({}/{}), requeued as number {}",
                entry_id, saved.missed_count, saved.max_missed_allowed, number
            );
            Ok(MissedOutcome::Requeued(saved))
        }
        .await;

        locks.release().await;
        result
    }

    /// The active entry of an order that is already checked in. A missed or
    /// finished entry never comes back.
    pub async fn queued_entry_for_order(&self, order: &Order) -> Result<QueueEntry, SlotQueueError> {
        match self.store.find_queue_entry_by_order(order.id).await? {
            Some(entry) if entry.status.is_active() => Ok(entry),
            _ => {
                warn!("Order {} is checked in but no longer queued", order.id);
                Err(SlotQueueError::InvalidOrderState {
                    order_id: order.id,
                    status: order.status,
                })
            }
        }
    }

    /// Creates the waiting entry for a checked-in order, or returns the one
    /// that already exists.
    pub async fn enqueue_checked_in(&self, ctx: &RequestContext, order: &Order) -> Result<QueueEntry, SlotQueueError> {
        let doctor_id = order.doctor_id;
        let guard = self
            .locks
            .acquire(LockKey::QueueCall(doctor_id), &ctx.lock_holder(), self.config.queue_lock)
            .await?;

        let result: Result<QueueEntry, SlotQueueError> = async {
            if let Some(existing) = self.store.find_queue_entry_by_order(order.id).await? {
                if !existing.status.is_active() {
                    return Err(SlotQueueError::InvalidQueueState {
                        entry_id: existing.id,
                        status: existing.status,
                    });
                }
                debug!("Order {} already queued as entry {}", order.id, existing.id);
                self.queue.update_by_id(doctor_id, &existing).await;
                return Ok(existing);
            }

            let number = self.next_queue_number(ctx, doctor_id).await?;
            let now = Utc::now();
            let entry = self
                .store
                .insert_queue_entry(&QueueEntry {
                    id: 0,
                    order_id: order.id,
                    patient_id: order.patient_id,
                    doctor_id,
                    department_id: order.department_id,
                    is_priority: order.is_emergency,
                    queue_number: number,
                    status: QueueStatus::Waiting,
                    missed_count: 0,
                    max_missed_allowed: self.config.max_missed_allowed,
                    check_in_time: Some(now),
                    call_time: None,
                    start_time: None,
                    end_time: None,
                    created_at: now,
                    updated_at: now,
                })
                .await?;

            self.queue.insert(doctor_id, &entry).await;
            info!(
                "Patient {} queued for doctor {} as number {}{}",
                entry.patient_id,
                doctor_id,
                number,
                if entry.is_priority { " (priority)" } else { "" }
            );
            Ok(entry)
        }
        .await;

        guard.release().await;
        result
    }

    /// Deletes the queue entry of a cancelled order, if it has one.
    pub async fn remove_for_order(&self, ctx: &RequestContext, order: &Order) -> Result<bool, SlotQueueError> {
        let Some(entry) = self.store.find_queue_entry_by_order(order.id).await? else {
            return Ok(false);
        };
        let doctor_id = entry.doctor_id;
        let guard = self
            .locks
            .acquire(LockKey::QueueCall(doctor_id), &ctx.lock_holder(), self.config.queue_lock)
            .await?;

        let result: Result<bool, SlotQueueError> = async {
            let removed = self.store.delete_queue_entry(entry.id).await?;
            self.queue.remove_by_id(doctor_id, entry.id).await;
            info!("Entry {} removed with cancelled order {}", entry.id, order.id);
            Ok(removed)
        }
        .await;

        guard.release().await;
        result
    }

    /// Highest number among the cached queue and the durable history, plus one.
    pub async fn next_queue_number(&self, ctx: &RequestContext, doctor_id: i64) -> Result<u32, SlotQueueError> {
        let guard = self
            .locks
            .acquire(LockKey::QueueNumber(doctor_id), &ctx.lock_holder(), self.config.queue_lock)
            .await?;

        let result: Result<u32, SlotQueueError> = async {
            let cached = self.queue.max_queue_number(doctor_id).await?;
            let stored = self.store.max_queue_number(doctor_id).await?;
            Ok(cached.max(stored).unwrap_or(0) + 1)
        }
        .await;

        guard.release().await;
        result
    }

    pub async fn doctor_queue(&self, doctor_id: i64) -> Result<Vec<QueueEntry>, SlotQueueError> {
        self.queue.snapshot(doctor_id).await
    }

    /// 1-based place among the doctor's waiting patients.
    pub async fn patient_position(&self, doctor_id: i64, patient_id: i64) -> Result<Option<usize>, SlotQueueError> {
        self.queue.position_of(doctor_id, patient_id).await
    }

    /// The patient's live entry and where it stands, if queued anywhere.
    pub async fn patient_queue(&self, ctx: &RequestContext, patient_id: i64) -> Result<Option<PatientQueueView>, SlotQueueError> {
        if !ctx.is_privileged() && !ctx.is_patient(patient_id) {
            return Err(SlotQueueError::PermissionDenied(format!(
                "actor {} may not view the queue of patient {}",
                ctx.actor_id, patient_id
            )));
        }

        let Some(entry) = self
            .store
            .list_patient_queue_entries(patient_id)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };

        let queue = self.queue.snapshot(entry.doctor_id).await?;
        Ok(Some(PatientQueueView {
            position: waiting_position(&queue, patient_id),
            queue_length: queue.len(),
            entry,
        }))
    }

    async fn load_entry(&self, entry_id: i64) -> Result<QueueEntry, SlotQueueError> {
        self.store
            .get_queue_entry(entry_id)
            .await?
            .ok_or(SlotQueueError::QueueEntryNotFound(entry_id))
    }
}

fn authorize_doctor(ctx: &RequestContext, doctor_id: i64) -> Result<(), SlotQueueError> {
    if ctx.is_privileged() || ctx.is_doctor(doctor_id) {
        return Ok(());
    }
    Err(SlotQueueError::PermissionDenied(format!(
        "actor {} may not manage the queue of doctor {}",
        ctx.actor_id, doctor_id
    )))
}

fn require_status(entry: &QueueEntry, expected: QueueStatus) -> Result<(), SlotQueueError> {
    if entry.status != expected {
        return Err(SlotQueueError::InvalidQueueState {
            entry_id: entry.id,
            status: entry.status,
        });
    }
    Ok(())
}
