//! The undertaker daemon: scans for expired DIDs on this worker's shard
//! and cascades their deletion, in a tick loop until stopped.

use clap::Parser;
use rucio_core::db::{migrations, ConnectionPool, DatabaseConfig, MigrationManager};
use rucio_core::did::DidStore;
use rucio_core::undertaker::Undertaker;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Rucio undertaker daemon", long_about = None)]
struct Args {
    /// This worker's index within the shard, 0-based.
    #[clap(long, env = "RUCIO_WORKER_NUMBER", default_value_t = 0)]
    worker_number: u32,

    /// Total number of undertaker workers sharing the expired-DID scan.
    #[clap(long, env = "RUCIO_TOTAL_WORKERS", default_value_t = 1)]
    total_workers: u32,

    /// Maximum DIDs deleted per tick.
    #[clap(long, env = "RUCIO_UNDERTAKER_BULK", default_value_t = 1000)]
    bulk: i64,

    /// Seconds to sleep between ticks once `delay - elapsed` is computed.
    #[clap(long, env = "RUCIO_UNDERTAKER_DELAY", default_value_t = 60)]
    delay: u64,

    /// Run a single batch and exit instead of looping.
    #[clap(long)]
    once: bool,

    /// Database connection URL.
    #[clap(long, env = "RUCIO_DATABASE_URL", default_value = "sqlite::memory:")]
    database_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::info!(
        "rucio-core {} starting undertakerd (worker {}/{})",
        rucio_core::VERSION,
        args.worker_number,
        args.total_workers
    );

    let pool = ConnectionPool::new(DatabaseConfig { url: args.database_url.clone(), ..Default::default() }).await?;
    let manager = MigrationManager::new(pool.clone());
    manager.init().await?;
    migrations::init_default_migrations(&manager);
    manager.run_pending().await?;

    let dids = Arc::new(DidStore::new(pool));
    let undertaker = Undertaker::new(
        args.worker_number,
        args.total_workers,
        args.bulk,
        Duration::from_secs(args.delay),
        dids,
    );

    let (running, notify) = undertaker.stop_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("undertakerd received shutdown signal");
        running.store(false, std::sync::atomic::Ordering::SeqCst);
        notify.notify_waiters();
    });

    undertaker.run(args.once).await?;
    let snapshot = undertaker.snapshot();
    log::info!(
        "undertakerd stopped: {} dids, {} locks, {} rules, {} tombstones deleted",
        snapshot.counters.dids,
        snapshot.counters.locks,
        snapshot.counters.rules,
        snapshot.counters.tombstones
    );
    Ok(())
}
