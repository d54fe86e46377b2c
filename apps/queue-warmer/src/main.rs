use std::process::ExitCode;
use std::sync::Arc;
use dotenv::dotenv;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shared_config::AppConfig;
use shared_database::SupabaseClient;
use slot_queue_cell::{RedisCache, RedisLockManager, SlotQueueConfig, SlotQueueServices, SupabaseStore};

#[tokio::main]
async fn main() -> ExitCode {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,slot_queue_cell=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting slot and queue cache warmer");

    let config = AppConfig::from_env();
    if !config.is_configured() {
        warn!("Supabase is not fully configured, store reads will fail");
    }
    let settings = SlotQueueConfig::from_env();

    let cache = match RedisCache::new(&config).await {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            error!("Redis unavailable: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let lock_manager = Arc::new(RedisLockManager::new(cache.pool()));
    let store = Arc::new(SupabaseStore::new(Arc::new(SupabaseClient::new(&config))));

    let services = SlotQueueServices::new(store, cache, lock_manager, settings.clone());

    // First tick fires immediately, covering the warm-up on start.
    let mut ticker = interval(settings.preload_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = services.preload.preload().await {
                    error!("Preload failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    ExitCode::SUCCESS
}
