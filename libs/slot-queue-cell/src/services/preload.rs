use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::keys::LockKey;
use crate::models::{LockTiming, PreloadReport, Slot, SlotQueueConfig};
use crate::services::inventory::SlotInventoryService;
use crate::services::lock::DistributedLocks;
use crate::services::queue_store::DoctorQueueCache;
use crate::services::store::SlotQueueStore;
use crate::SlotQueueError;
use shared_models::auth::RequestContext;

/// Holds locks only briefly; anything busy is being maintained by a live
/// operation and is left alone.
const PRELOAD_LOCK_WAIT: Duration = Duration::from_millis(100);

enum Warmed {
    Done,
    Busy,
}

pub struct CachePreloadService {
    store: Arc<dyn SlotQueueStore>,
    inventory: Arc<SlotInventoryService>,
    queue: Arc<DoctorQueueCache>,
    locks: DistributedLocks,
    config: SlotQueueConfig,
}

impl CachePreloadService {
    pub fn new(
        store: Arc<dyn SlotQueueStore>,
        inventory: Arc<SlotInventoryService>,
        queue: Arc<DoctorQueueCache>,
        locks: DistributedLocks,
        config: SlotQueueConfig,
    ) -> Self {
        Self {
            store,
            inventory,
            queue,
            locks,
            config,
        }
    }

    /// Warms upcoming slots and rebuilds every live doctor queue.
    #[instrument(skip(self))]
    pub async fn preload(&self) -> Result<PreloadReport, SlotQueueError> {
        let today = Utc::now().date_naive();
        self.preload_from(today).await
    }

    pub async fn preload_from(&self, from: NaiveDate) -> Result<PreloadReport, SlotQueueError> {
        let to = from + ChronoDuration::days(i64::from(self.config.preload_days));
        let mut report = PreloadReport::default();
        let ctx = RequestContext::system();

        let slots = self.store.list_slots_between(from, to).await?;
        debug!("Preloading {} slots between {} and {}", slots.len(), from, to);
        for slot in &slots {
            match self.warm_slot(&ctx, slot).await {
                Ok(Warmed::Done) => report.slots_warmed += 1,
                Ok(Warmed::Busy) => report.slots_skipped += 1,
                Err(e) => {
                    warn!("Failed to warm slot {}: {}", slot.id, e);
                    report.failures += 1;
                }
            }
        }

        let doctors = self.store.list_doctors_with_active_queue().await?;
        let results = join_all(doctors.iter().map(|&doctor_id| self.rebuild_queue(&ctx, doctor_id))).await;
        for (doctor_id, result) in doctors.iter().zip(results) {
            match result {
                Ok(Warmed::Done) => report.queues_rebuilt += 1,
                Ok(Warmed::Busy) => debug!("Queue of doctor {} busy, left as is", doctor_id),
                Err(e) => {
                    warn!("Failed to rebuild queue of doctor {}: {}", doctor_id, e);
                    report.failures += 1;
                }
            }
        }

        info!(
            "Preload finished: {} slots warmed, {} skipped, {} queues rebuilt, {} failures",
            report.slots_warmed, report.slots_skipped, report.queues_rebuilt, report.failures
        );
        Ok(report)
    }

    async fn warm_slot(&self, ctx: &RequestContext, slot: &Slot) -> Result<Warmed, SlotQueueError> {
        let timing = LockTiming {
            wait: PRELOAD_LOCK_WAIT,
            lease: self.config.slot_lock.lease,
        };
        let guard = match self
            .locks
            .acquire(LockKey::SlotOperation(slot.id), &ctx.lock_holder(), timing)
            .await
        {
            Ok(guard) => guard,
            Err(SlotQueueError::SystemBusy { .. }) => return Ok(Warmed::Busy),
            Err(e) => return Err(e),
        };

        // Re-read under the lock; the listed record may predate a booking.
        let result: Result<(), SlotQueueError> = async {
            let current = self
                .store
                .get_slot(slot.id)
                .await?
                .ok_or(SlotQueueError::SlotNotFound(slot.id))?;
            self.inventory.warm(&current).await
        }
        .await;

        guard.release().await;
        result.map(|_| Warmed::Done)
    }

    async fn rebuild_queue(&self, ctx: &RequestContext, doctor_id: i64) -> Result<Warmed, SlotQueueError> {
        let timing = LockTiming {
            wait: PRELOAD_LOCK_WAIT,
            lease: self.config.queue_lock.lease,
        };
        let guard = match self
            .locks
            .acquire(LockKey::QueueCall(doctor_id), &ctx.lock_holder(), timing)
            .await
        {
            Ok(guard) => guard,
            Err(SlotQueueError::SystemBusy { .. }) => return Ok(Warmed::Busy),
            Err(e) => return Err(e),
        };

        let result = self.queue.rebuild(doctor_id).await;
        guard.release().await;
        result.map(|_| Warmed::Done)
    }
}
