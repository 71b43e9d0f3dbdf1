//! The Hermes daemon: runs the STOMP broker loop and the SMTP email loop
//! concurrently, each draining the shared `messages` outbox.

use clap::Parser;
use rucio_core::db::{migrations, ConnectionPool, DatabaseConfig, MigrationManager};
use rucio_core::hermes::broker::{resolve_broker_hosts, BrokerClient, StompBrokerClient};
use rucio_core::hermes::email::{EmailConfig, EmailSender};
use rucio_core::hermes::heartbeat::Heartbeat;
use rucio_core::hermes::{BrokerWorker, EmailWorker, Outbox};
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Rucio Hermes message-delivery daemon", long_about = None)]
struct Args {
    #[clap(long, env = "RUCIO_WORKER_NUMBER", default_value_t = 0)]
    worker_number: u32,

    #[clap(long, env = "RUCIO_TOTAL_WORKERS", default_value_t = 1)]
    total_workers: u32,

    #[clap(long, env = "RUCIO_HERMES_BULK", default_value_t = 1000)]
    bulk: i64,

    #[clap(long, env = "RUCIO_HERMES_DELAY", default_value_t = 10)]
    delay: u64,

    /// DNS alias resolved to the pool of equivalent STOMP brokers.
    #[clap(long, env = "RUCIO_HERMES_BROKER_ALIAS", default_value = "localhost")]
    broker_alias: String,

    #[clap(long, env = "RUCIO_HERMES_BROKER_PORT", default_value_t = 61613)]
    broker_port: u16,

    #[clap(long, env = "RUCIO_HERMES_BROKER_SSL")]
    broker_use_ssl: bool,

    #[clap(long, env = "RUCIO_HERMES_BROKER_DESTINATION", default_value = "/topic/rucio.events")]
    broker_destination: String,

    /// Seconds to wait for a broker connection attempt before giving up.
    #[clap(long, env = "RUCIO_HERMES_BROKER_TIMEOUT", default_value_t = 3)]
    broker_timeout: u64,

    /// Seconds between reconnect attempts after a lost broker connection.
    #[clap(long, env = "RUCIO_HERMES_BROKER_RETRY", default_value_t = 10)]
    broker_retry: u64,

    #[clap(long, env = "RUCIO_HERMES_SMTP_HOST", default_value = "localhost")]
    smtp_host: String,

    #[clap(long, env = "RUCIO_HERMES_SMTP_PORT", default_value_t = 587)]
    smtp_port: u16,

    #[clap(long, env = "RUCIO_HERMES_SMTP_FROM", default_value = "rucio@example.org")]
    smtp_from: String,

    #[clap(long)]
    once: bool,

    #[clap(long, env = "RUCIO_DATABASE_URL", default_value = "sqlite::memory:")]
    database_url: String,

    /// Skip the broker loop entirely (useful when no STOMP broker is
    /// reachable in this environment, e.g. local development).
    #[clap(long)]
    no_broker: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::info!("rucio-core {} starting hermesd", rucio_core::VERSION);
    log::debug!("broker connect timeout {}s, retry interval {}s", args.broker_timeout, args.broker_retry);

    let pool = ConnectionPool::new(DatabaseConfig { url: args.database_url.clone(), ..Default::default() }).await?;
    let manager = MigrationManager::new(pool.clone());
    manager.init().await?;
    migrations::init_default_migrations(&manager);
    manager.run_pending().await?;

    let email_heartbeat = Heartbeat::new(pool.clone(), "hermesd-email", args.worker_number);
    email_heartbeat.live(args.total_workers).await?;

    let email_sender = EmailSender::new(EmailConfig {
        smtp_host: args.smtp_host.clone(),
        smtp_port: args.smtp_port,
        credentials: None,
        from: args.smtp_from.clone(),
    })?;

    let mut email_worker = EmailWorker::new(
        args.worker_number,
        args.total_workers,
        args.bulk,
        Duration::from_secs(args.delay),
        Outbox::new(pool.clone()),
        email_sender,
        "email",
    );

    let email_handle = tokio::spawn({
        let once = args.once;
        async move {
            if let Err(e) = email_worker.run(once).await {
                log::error!("hermes email worker exited: {e}");
            }
        }
    });

    let broker_handle = if args.no_broker {
        None
    } else {
        let hosts = match resolve_broker_hosts(&args.broker_alias, args.broker_port).await {
            Ok(h) => h,
            Err(e) => {
                log::warn!("hermes broker alias resolution failed, running email-only: {e}");
                Vec::new()
            }
        };

        if hosts.is_empty() {
            None
        } else {
            let clients: Vec<Box<dyn BrokerClient>> = hosts
                .into_iter()
                .map(|(host, port)| {
                    Box::new(StompBrokerClient::new(host, port, args.broker_use_ssl, None)) as Box<dyn BrokerClient>
                })
                .collect();

            let mut broker_worker = BrokerWorker::new(
                args.broker_destination.clone(),
                args.worker_number,
                args.total_workers,
                args.bulk,
                Duration::from_secs(args.delay),
                Outbox::new(pool.clone()),
                clients,
            );

            Some(tokio::spawn({
                let once = args.once;
                async move {
                    if let Err(e) = broker_worker.run(once).await {
                        log::error!("hermes broker worker exited: {e}");
                    }
                }
            }))
        }
    };

    email_handle.await?;
    if let Some(handle) = broker_handle {
        handle.await?;
    }
    email_heartbeat.die().await?;

    log::info!("hermesd stopped");
    Ok(())
}
