use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::keys;
use crate::models::{arrange_queue, insertion_index, waiting_position, QueueEntry, SlotQueueConfig};
use crate::services::cache::CacheBackend;
use crate::services::store::SlotQueueStore;
use crate::SlotQueueError;

/// Raw cached items alongside their decoded entries.
type CachedQueue = (Vec<String>, Vec<QueueEntry>);

/// Cache-resident ordered queue per doctor, rebuildable from the store.
///
/// Does no locking of its own: mutations expect the caller to hold the
/// doctor's queue lock and to have written the store first, so that a
/// rebuild at any point reproduces the intended state.
pub struct DoctorQueueCache {
    store: Arc<dyn SlotQueueStore>,
    cache: Arc<dyn CacheBackend>,
    ttl: Duration,
    cas_retries: u32,
}

impl DoctorQueueCache {
    pub fn new(
        store: Arc<dyn SlotQueueStore>,
        cache: Arc<dyn CacheBackend>,
        config: &SlotQueueConfig,
    ) -> Self {
        Self {
            store,
            cache,
            ttl: config.queue_cache_ttl,
            cas_retries: config.queue_cas_retries.max(1),
        }
    }

    /// Reloads the doctor's active entries and swaps them in as one write.
    /// Returns the arranged queue even when the cache write fails.
    pub async fn rebuild(&self, doctor_id: i64) -> Result<Vec<QueueEntry>, SlotQueueError> {
        let entries = self.store.list_active_queue_entries(doctor_id).await?;
        let queue = arrange_queue(entries);

        match encode(&queue) {
            Ok(items) => {
                if let Err(e) = self
                    .cache
                    .list_swap(&keys::doctor_queue(doctor_id), None, &items, self.ttl)
                    .await
                {
                    warn!("Failed to write rebuilt queue for doctor {}: {}", doctor_id, e);
                }
            }
            Err(e) => error!("Failed to encode queue for doctor {}: {}", doctor_id, e),
        }

        debug!("Queue for doctor {} rebuilt with {} entries", doctor_id, queue.len());
        Ok(queue)
    }

    /// Current ordered queue; a missing or unreadable cache falls back to
    /// a rebuild.
    pub async fn snapshot(&self, doctor_id: i64) -> Result<Vec<QueueEntry>, SlotQueueError> {
        match self.read(doctor_id).await {
            Ok(Some((_, queue))) => Ok(queue),
            Ok(None) => self.rebuild(doctor_id).await,
            Err(e) => {
                warn!("Queue cache for doctor {} unreadable, rebuilding: {}", doctor_id, e);
                self.rebuild(doctor_id).await
            }
        }
    }

    /// Places the entry behind every entry of its class with a lower number.
    /// An entry with the same id is replaced.
    pub async fn insert(&self, doctor_id: i64, entry: &QueueEntry) {
        self.mutate(doctor_id, |queue| {
            queue.retain(|e| e.id != entry.id);
            let idx = insertion_index(queue, entry);
            queue.insert(idx, entry.clone());
            true
        })
        .await
    }

    pub async fn remove_by_id(&self, doctor_id: i64, entry_id: i64) {
        self.mutate(doctor_id, |queue| {
            let before = queue.len();
            queue.retain(|e| e.id != entry_id);
            queue.len() != before
        })
        .await
    }

    /// Replaces the entry in place. Position changes go through
    /// [`insert`](Self::insert) instead. A cached queue missing the entry
    /// gets it at its ordered position.
    pub async fn update_by_id(&self, doctor_id: i64, entry: &QueueEntry) {
        self.mutate(doctor_id, |queue| {
            match queue.iter_mut().find(|e| e.id == entry.id) {
                Some(current) => *current = entry.clone(),
                None => {
                    warn!("Entry {} missing from cached queue, restoring", entry.id);
                    let idx = insertion_index(queue, entry);
                    queue.insert(idx, entry.clone());
                }
            }
            true
        })
        .await
    }

    /// Drops the cached queue so that the next read rebuilds it.
    pub async fn invalidate(&self, doctor_id: i64) -> Result<(), SlotQueueError> {
        self.cache.delete(&[keys::doctor_queue(doctor_id)]).await
    }

    pub async fn position_of(&self, doctor_id: i64, patient_id: i64) -> Result<Option<usize>, SlotQueueError> {
        let queue = self.snapshot(doctor_id).await?;
        Ok(waiting_position(&queue, patient_id))
    }

    pub async fn max_queue_number(&self, doctor_id: i64) -> Result<Option<u32>, SlotQueueError> {
        let queue = self.snapshot(doctor_id).await?;
        Ok(queue.iter().map(|e| e.queue_number).max())
    }

    async fn read(&self, doctor_id: i64) -> Result<Option<CachedQueue>, SlotQueueError> {
        let Some(items) = self.cache.list_range(&keys::doctor_queue(doctor_id)).await? else {
            return Ok(None);
        };
        let queue = items
            .iter()
            .map(|item| serde_json::from_str::<QueueEntry>(item))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some((items, queue)))
    }

    /// Optimistic read-modify-write. `apply` returns whether it changed the
    /// queue. Conflicts are retried; anything else ends in a rebuild, and if
    /// even that cannot be written the key is dropped.
    async fn mutate<F>(&self, doctor_id: i64, mut apply: F)
    where
        F: FnMut(&mut Vec<QueueEntry>) -> bool + Send,
    {
        let key = keys::doctor_queue(doctor_id);

        for attempt in 1..=self.cas_retries {
            let (raw, mut queue) = match self.read(doctor_id).await {
                Ok(Some(cached)) => cached,
                Ok(None) => {
                    debug!("Queue for doctor {} not cached, rebuilding", doctor_id);
                    self.recover(doctor_id).await;
                    return;
                }
                Err(e) => {
                    warn!("Queue cache for doctor {} unreadable, rebuilding: {}", doctor_id, e);
                    self.recover(doctor_id).await;
                    return;
                }
            };

            if !apply(&mut queue) {
                return;
            }

            let items = match encode(&queue) {
                Ok(items) => items,
                Err(e) => {
                    error!("Failed to encode queue for doctor {}: {}", doctor_id, e);
                    self.recover(doctor_id).await;
                    return;
                }
            };

            match self.cache.list_swap(&key, Some(raw.as_slice()), &items, self.ttl).await {
                Ok(true) => return,
                Ok(false) => debug!(
                    "Queue for doctor {} changed during update (attempt {}/{})",
                    doctor_id, attempt, self.cas_retries
                ),
                Err(e) => {
                    warn!("Queue write for doctor {} failed: {}", doctor_id, e);
                    self.recover(doctor_id).await;
                    return;
                }
            }
        }

        warn!(
            "Queue for doctor {} kept changing after {} attempts, rebuilding",
            doctor_id, self.cas_retries
        );
        self.recover(doctor_id).await;
    }

    async fn recover(&self, doctor_id: i64) {
        let rebuilt = match self.store.list_active_queue_entries(doctor_id).await {
            Ok(entries) => encode(&arrange_queue(entries)),
            Err(e) => {
                warn!("Rebuild for doctor {} failed: {}", doctor_id, e);
                return self.invalidate_or_log(doctor_id).await;
            }
        };

        let written = match rebuilt {
            Ok(items) => self
                .cache
                .list_swap(&keys::doctor_queue(doctor_id), None, &items, self.ttl)
                .await
                .unwrap_or(false),
            Err(_) => false,
        };
        if !written {
            self.invalidate_or_log(doctor_id).await;
        }
    }

    async fn invalidate_or_log(&self, doctor_id: i64) {
        if let Err(e) = self.invalidate(doctor_id).await {
            error!("Queue cache for doctor {} may be stale: {}", doctor_id, e);
        }
    }
}

fn encode(queue: &[QueueEntry]) -> Result<Vec<String>, SlotQueueError> {
    queue
        .iter()
        .map(|entry| serde_json::to_string(entry).map_err(SlotQueueError::from))
        .collect()
}
