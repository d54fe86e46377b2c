pub mod cache;
pub mod inventory;
pub mod lifecycle;
pub mod lock;
pub mod memory;
pub mod orchestrator;
pub mod preload;
pub mod queue_store;
pub mod store;

pub use cache::*;
pub use inventory::*;
pub use lifecycle::*;
pub use lock::*;
pub use memory::*;
pub use orchestrator::*;
pub use preload::*;
pub use queue_store::*;
pub use store::*;

use std::sync::Arc;

use crate::models::SlotQueueConfig;

/// All core services wired over one set of backends.
#[derive(Clone)]
pub struct SlotQueueServices {
    pub inventory: Arc<SlotInventoryService>,
    pub queue: Arc<DoctorQueueCache>,
    pub lifecycle: Arc<QueueLifecycleService>,
    pub orchestrator: Arc<BookingOrchestrator>,
    pub preload: Arc<CachePreloadService>,
}

impl SlotQueueServices {
    pub fn new(
        store: Arc<dyn SlotQueueStore>,
        cache: Arc<dyn CacheBackend>,
        lock_manager: Arc<dyn LockManager>,
        config: SlotQueueConfig,
    ) -> Self {
        let locks = DistributedLocks::new(lock_manager);
        let inventory = Arc::new(SlotInventoryService::new(
            store.clone(),
            cache.clone(),
            config.clone(),
        ));
        let queue = Arc::new(DoctorQueueCache::new(store.clone(), cache, &config));
        let lifecycle = Arc::new(QueueLifecycleService::new(
            store.clone(),
            queue.clone(),
            locks.clone(),
            config.clone(),
        ));
        let orchestrator = Arc::new(BookingOrchestrator::new(
            store.clone(),
            inventory.clone(),
            lifecycle.clone(),
            locks.clone(),
            config.clone(),
        ));
        let preload = Arc::new(CachePreloadService::new(
            store,
            inventory.clone(),
            queue.clone(),
            locks,
            config,
        ));

        Self {
            inventory,
            queue,
            lifecycle,
            orchestrator,
            preload,
        }
    }
}
