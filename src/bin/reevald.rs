//! The reevaluator daemon: drains the re-evaluation feed on this
//! worker's shard, extending and reconciling replication rule locks as
//! DIDs are attached to and detached from dataset/container trees, in a
//! tick loop until stopped.

use clap::Parser;
use rucio_core::db::{migrations, ConnectionPool, DatabaseConfig, MigrationManager};
use rucio_core::did::DidStore;
use rucio_core::lock::LockStore;
use rucio_core::quota::SqlAccountQuota;
use rucio_core::reeval::Reevaluator;
use rucio_core::rse::{LiteralRseExpressionResolver, SqlRseAttributeProvider};
use rucio_core::transfer::NullTransferSubmitter;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Rucio rule re-evaluation daemon", long_about = None)]
struct Args {
    /// This worker's index within the shard, 0-based.
    #[clap(long, env = "RUCIO_WORKER_NUMBER", default_value_t = 0)]
    worker_number: u32,

    /// Total number of reevaluator workers sharing the feed.
    #[clap(long, env = "RUCIO_TOTAL_WORKERS", default_value_t = 1)]
    total_workers: u32,

    /// Maximum feed items claimed per tick.
    #[clap(long, env = "RUCIO_REEVAL_BULK", default_value_t = 1000)]
    bulk: i64,

    /// Seconds to sleep between ticks once `delay - elapsed` is computed.
    #[clap(long, env = "RUCIO_REEVAL_DELAY", default_value_t = 60)]
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
        "rucio-core {} starting reevald (worker {}/{})",
        rucio_core::VERSION,
        args.worker_number,
        args.total_workers
    );

    let pool = ConnectionPool::new(DatabaseConfig { url: args.database_url.clone(), ..Default::default() }).await?;
    let manager = MigrationManager::new(pool.clone());
    manager.init().await?;
    migrations::init_default_migrations(&manager);
    manager.run_pending().await?;

    let dids = Arc::new(DidStore::new(pool.clone()));
    let locks = Arc::new(LockStore::new(pool.clone()));
    let quota = Arc::new(SqlAccountQuota::new(pool.clone()));
    let attrs = Arc::new(SqlRseAttributeProvider::new(pool.clone()));
    // The `tier=T1&country=FR`-style boolean grammar is an external
    // collaborator's concern; this daemon only resolves the literal,
    // comma-separated RSE id form.
    let expression = Arc::new(LiteralRseExpressionResolver);
    // No transfer-submission backend is wired into this crate yet;
    // reevaluation still materializes locks, it just can't hand them off.
    let transfers = Arc::new(NullTransferSubmitter);

    let reevaluator = Reevaluator::new(
        args.worker_number,
        args.total_workers,
        args.bulk,
        Duration::from_secs(args.delay),
        pool,
        dids,
        locks,
        expression,
        attrs,
        quota,
        transfers,
    );

    let (running, notify) = reevaluator.stop_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("reevald received shutdown signal");
        running.store(false, std::sync::atomic::Ordering::SeqCst);
        notify.notify_waiters();
    });

    reevaluator.run(args.once).await?;
    let snapshot = reevaluator.snapshot();
    log::info!(
        "reevald stopped: {} items processed, {} skipped",
        snapshot.counters.items_processed,
        snapshot.counters.items_skipped
    );
    Ok(())
}
