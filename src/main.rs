pub mod models {
    pub mod homekit;
    pub mod state;
}

pub mod client;
pub mod config;
pub mod envfile;
pub mod db {
    pub mod memory;
    pub mod models;
    pub mod pg;
    pub mod repo;
}
pub mod schema;
pub mod shutdown;
pub mod utils;
pub mod services {
    pub mod control;
    pub mod ingest;
    pub mod notify;
    pub mod realtime;
    pub mod refs;
    pub mod scheduler;
    pub mod state;
    pub mod window;
}

#[cfg(test)]
mod test_support;

use crate::client::{ChannelError, DeviceChannel, HttpBridgeChannel};
use crate::config::{Config, StorageBackend};
use crate::db::memory::MemoryRepository;
use crate::db::pg::PgRepository;
use crate::db::repo::Repository;
use crate::services::control::{DeviceController, ScheduledWrites};
use crate::services::ingest::ChangeReconciler;
use crate::services::notify::{LogNotifier, NotificationSink};
use crate::services::realtime::PollingScheduler;
use crate::services::refs::{self, AccessoryCache};
use crate::services::scheduler::TemperatureScheduler;
use crate::services::state::StateStore;
use crate::services::window::WindowOpenDetector;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

fn open_repository(cfg: &Config) -> Result<Arc<dyn Repository>, String> {
    match cfg.storage {
        StorageBackend::Postgres => {
            let repo = PgRepository::connect(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
            info!("Connected to database");
            repo.apply_migrations()?;
            Ok(Arc::new(repo))
        }
        StorageBackend::Memory => {
            warn!("STORAGE_BACKEND=memory: device history will not survive a restart");
            Ok(Arc::new(MemoryRepository::new()))
        }
    }
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (storage={:?}, bridge={}, poll_interval={}s, full_every={}, batch={}, bucket={}s, optimistic_timeout={}s, window_threshold={}C, scheduler_enabled={}, blocking_threads={})",
        cfg.storage,
        cfg.bridge_url,
        cfg.poll.interval.as_secs(),
        cfg.poll.full_every_ticks,
        cfg.poll.batch_size,
        cfg.history_bucket_secs,
        cfg.optimistic_timeout_secs,
        cfg.window.threshold_c,
        cfg.scheduler_enabled,
        cfg.blocking_threads
    );

    // 2) Single cooperative event loop; bridge calls go to the blocking pool
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(cfg.blocking_threads)
        .build()
        .map_err(|e| format!("Starting runtime failed: {}", e))?;
    runtime.block_on(serve(cfg))
}

async fn serve(cfg: Config) -> Result<(), String> {
    // 3) Storage
    let repo = open_repository(&cfg)?;

    // 4) Accessory metadata
    let channel: Arc<dyn DeviceChannel> = Arc::new(HttpBridgeChannel::new(&cfg.bridge_url));
    let accessories = refs::load_accessories(channel.as_ref(), &cfg.accessories_cache).await?;
    let cache = AccessoryCache::new(accessories);

    // 5) Device registry and last known state
    let state = StateStore::new(repo.clone(), cfg.history_bucket_secs, cfg.optimistic_timeout_secs).into_shared();
    refs::sync_registry(&state, &cache.snapshot())?;
    let restored = state
        .lock()
        .restore()
        .map_err(|e| format!("Restoring device state failed: {}", e))?;
    info!("Restored last known state for {} device(s)", restored);

    // 6) Wire components
    let (trigger, shutdown) = shutdown::channel();
    let sink: Arc<dyn NotificationSink> = Arc::new(LogNotifier);
    let detector = WindowOpenDetector::new(state.clone(), sink.clone(), cfg.window, shutdown.clone());
    let scheduled = ScheduledWrites::default();
    let reconciler = Arc::new(ChangeReconciler::new(
        state.clone(),
        cache.clone(),
        detector.clone(),
        sink,
        scheduled.clone(),
    ));
    let mut poller = PollingScheduler::new(channel.clone(), reconciler.clone(), state.clone(), cfg.poll);
    poller.discover(&cache);

    // 7) Subscriptions
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    match channel.subscribe(poller.monitored(), events_tx).await {
        Ok(()) => info!("Subscribed to {} characteristic(s)", poller.monitored().len()),
        Err(ChannelError::Unsupported(what)) => info!("Device channel has no {}; relying on polling", what),
        Err(e) => warn!("Subscribing to events failed: {}; relying on polling", e),
    }

    // 8) Loops
    let mut tasks = vec![
        tokio::spawn(poller.run(shutdown.clone())),
        tokio::spawn(reconciler.pump(events_rx, shutdown.clone())),
    ];
    if cfg.scheduler_enabled {
        let controller = Arc::new(DeviceController::new(state.clone(), channel.clone(), cache.clone(), scheduled));
        let scheduler = TemperatureScheduler::new(repo.clone(), state.clone(), controller);
        tasks.push(tokio::spawn(scheduler.run(shutdown.clone())));
    } else {
        info!("Temperature scheduler disabled via SCHEDULER_ENABLED=false");
    }

    // 9) Run until interrupted
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Waiting for Ctrl-C failed: {}", e))?;
    info!("Shutdown requested");
    trigger.trigger();
    let cancelled = detector.cancel_all();
    if cancelled > 0 {
        info!("Cancelled {} window timer(s)", cancelled);
    }
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    let flushed = state.lock().flush_all(Utc::now());
    info!("Final history flush wrote {} device(s)", flushed);
    Ok(())
}

fn main() {
    let loaded_env = match envfile::load_from_process() {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(file) = loaded_env.as_ref() {
        info!("Environment loaded from {}", file.summary());
        for key in file.unknown_keys() {
            warn!("{}: {} is not a tado-local setting", file.path.display(), key);
        }
    }

    info!(
        "tado-local {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
