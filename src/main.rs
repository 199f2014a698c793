use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Error, Result};
use clap::Parser;
use log::{debug, info, trace, warn};
use sqlx::PgPool;

mod alerts;
mod cli;
mod config;
mod discovery;
mod error;
mod housekeeper;
mod icmp;
mod models;
mod ping_worker;
mod queue;
mod scheduler;
mod snmp;
mod snmp_worker;
mod state;
mod store;
mod tsdb;
mod vault;
mod worker;

use cli::{Command, Opts, WorkerClassArg};
use config::Config;
use queue::{Partition, Queue};
use scheduler::{
    Scheduler, TASK_CHECK_WORKER_HEALTH, TASK_CLEANUP_ALERTS, TASK_CLEANUP_INTERFACES,
    TASK_DISCOVER_BATCH, TASK_EVALUATE_ALERTS, TASK_PING_BATCH, TASK_SNMP_BATCH,
    TASK_VACUUM_IDLE_TX,
};
use tsdb::TsdbWriter;
use worker::WorkerHarness;

fn main() -> Result<(), Error> {
    env_logger::init();
    dotenvy::dotenv().ok();

    let cli: Opts = Opts::parse();
    trace!("main: parsed options {:#?}", cli);

    let config = config::from_env()?;
    config::validate(&config)?;
    let config = Arc::new(config);

    if cli.command == Command::ConfigTest {
        println!("Config is OK");
        return Ok(());
    }

    if config.tokio.console {
        debug!("main: tokio-console instrumentation on");
        console_subscriber::init();
    }

    let rt = build_runtime(&config.tokio)?;
    debug!("main: runtime ready, entering {:?}", cli.command);
    rt.block_on(run(cli.command, config))
}

fn build_runtime(settings: &config::TokioSettings) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = match settings.runtime {
        config::TokioRuntime::CurrentThread => {
            debug!("runtime: single-threaded executor");
            tokio::runtime::Builder::new_current_thread()
        }
        config::TokioRuntime::MultiThread { worker_threads } => {
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            match worker_threads {
                Some(count) => {
                    debug!("runtime: threaded executor, {} workers", count);
                    builder.worker_threads(count);
                }
                None => debug!("runtime: threaded executor, worker count left to tokio"),
            }
            builder
        }
    };

    builder
        .thread_name_fn(next_runtime_thread_name)
        .enable_all()
        .build()
}

fn next_runtime_thread_name() -> String {
    static NEXT_THREAD: AtomicUsize = AtomicUsize::new(0);
    format!("ward-flux-{}", NEXT_THREAD.fetch_add(1, Ordering::Relaxed))
}

async fn run(command: Command, config: Arc<Config>) -> Result<(), Error> {
    let pool = store::connect(&config.db_url, config.db_max_connections).await?;
    store::run_migrations(&pool).await?;

    if command == Command::Migrate {
        println!("Migrations are OK");
        return Ok(());
    }

    let class = match command {
        Command::Run { class } => class,
        _ => unreachable!("subcommands handled above"),
    };

    let queue = Queue::new(pool.clone());
    let (writer, _writer_handle) = tsdb::spawn_writer(config.tsdb_url.clone());

    match class {
        WorkerClassArg::Scheduler => {
            info!("main: starting scheduler");
            Scheduler::new(pool, queue, config).run().await
        }
        WorkerClassArg::Monitoring => run_monitoring(pool, queue, writer, config).await,
        WorkerClassArg::Snmp => run_snmp(pool, queue, writer, config).await,
        WorkerClassArg::Alerts => run_alerts(pool, queue, writer, config).await,
        WorkerClassArg::Maintenance => run_maintenance(pool, queue, writer, config).await,
        WorkerClassArg::All => {
            info!("main: starting scheduler and all worker classes in one process");
            let mut handles = Vec::new();
            {
                let scheduler =
                    Scheduler::new(pool.clone(), queue.clone(), config.clone());
                handles.push(tokio::spawn(async move { scheduler.run().await }));
            }
            {
                let (pool, queue, writer, config) =
                    (pool.clone(), queue.clone(), writer.clone(), config.clone());
                handles.push(tokio::spawn(run_monitoring(pool, queue, writer, config)));
            }
            {
                let (pool, queue, writer, config) =
                    (pool.clone(), queue.clone(), writer.clone(), config.clone());
                handles.push(tokio::spawn(run_snmp(pool, queue, writer, config)));
            }
            {
                let (pool, queue, writer, config) =
                    (pool.clone(), queue.clone(), writer.clone(), config.clone());
                handles.push(tokio::spawn(run_alerts(pool, queue, writer, config)));
            }
            {
                handles.push(tokio::spawn(run_maintenance(pool, queue, writer, config)));
            }
            for handle in handles {
                handle.await??;
            }
            Ok(())
        }
    }
}

async fn run_monitoring(
    pool: PgPool,
    queue: Queue,
    writer: TsdbWriter,
    config: Arc<Config>,
) -> Result<(), Error> {
    let prober = Arc::new(icmp::Prober::new(config.icmp.clone())?);
    let ctx = Arc::new(ping_worker::PingWorkerCtx {
        pool,
        writer: writer.clone(),
        prober,
        config: config.clone(),
    });
    let harness = WorkerHarness::new(queue, writer, config, Partition::Monitoring);

    loop {
        let ctx = ctx.clone();
        harness
            .run(move |task| {
                let ctx = ctx.clone();
                async move {
                    match task.message.task.as_str() {
                        TASK_PING_BATCH => {
                            ping_worker::handle_ping_batch(&ctx, &task.message.args).await
                        }
                        other => {
                            warn!("monitoring: unknown task {:?}, dropping", other);
                            Ok(())
                        }
                    }
                }
            })
            .await?;
        info!("monitoring: recycling worker");
    }
}

async fn run_snmp(
    pool: PgPool,
    queue: Queue,
    writer: TsdbWriter,
    config: Arc<Config>,
) -> Result<(), Error> {
    let vault = Arc::new(vault::Vault::new(&config.vault_key)?);
    let ctx = Arc::new(snmp_worker::SnmpWorkerCtx {
        pool,
        writer: writer.clone(),
        client: snmp::SnmpClient::new(config.snmp.clone()),
        vault,
        config: config.clone(),
    });
    let harness = WorkerHarness::new(queue, writer, config, Partition::Snmp);

    loop {
        let ctx = ctx.clone();
        harness
            .run(move |task| {
                let ctx = ctx.clone();
                async move {
                    match task.message.task.as_str() {
                        TASK_SNMP_BATCH => {
                            snmp_worker::handle_snmp_batch(&ctx, &task.message.args).await
                        }
                        TASK_DISCOVER_BATCH => {
                            snmp_worker::handle_discover_batch(&ctx, &task.message.args).await
                        }
                        other => {
                            warn!("snmp: unknown task {:?}, dropping", other);
                            Ok(())
                        }
                    }
                }
            })
            .await?;
        info!("snmp: recycling worker");
    }
}

async fn run_alerts(
    pool: PgPool,
    queue: Queue,
    writer: TsdbWriter,
    config: Arc<Config>,
) -> Result<(), Error> {
    let reader = tsdb::TsdbReader::new(&config.tsdb_url)?;
    let engine = Arc::new(alerts::AlertEngine::new(pool, reader));
    let harness = WorkerHarness::new(queue, writer, config, Partition::Alerts);

    loop {
        let engine = engine.clone();
        harness
            .run(move |task| {
                let engine = engine.clone();
                async move {
                    match task.message.task.as_str() {
                        TASK_EVALUATE_ALERTS => engine.evaluate_tick().await.map(|_| ()),
                        other => {
                            warn!("alerts: unknown task {:?}, dropping", other);
                            Ok(())
                        }
                    }
                }
            })
            .await?;
        info!("alerts: recycling worker");
    }
}

async fn run_maintenance(
    pool: PgPool,
    queue: Queue,
    writer: TsdbWriter,
    config: Arc<Config>,
) -> Result<(), Error> {
    let reader = tsdb::TsdbReader::new(&config.tsdb_url)?;
    let ctx = Arc::new(housekeeper::MaintenanceCtx {
        pool,
        writer: writer.clone(),
        reader,
        config: config.clone(),
    });
    let harness = WorkerHarness::new(queue, writer, config, Partition::Maintenance);

    loop {
        let ctx = ctx.clone();
        harness
            .run(move |task| {
                let ctx = ctx.clone();
                async move {
                    match task.message.task.as_str() {
                        TASK_CLEANUP_INTERFACES => {
                            housekeeper::cleanup_stale_interfaces(&ctx).await
                        }
                        TASK_CLEANUP_ALERTS => {
                            let deep = task.message.args["deep"].as_bool().unwrap_or(false);
                            housekeeper::cleanup_resolved_alerts(&ctx, deep).await
                        }
                        TASK_CHECK_WORKER_HEALTH => housekeeper::check_worker_health(&ctx).await,
                        TASK_VACUUM_IDLE_TX => housekeeper::vacuum_idle_transactions(&ctx).await,
                        other => {
                            warn!("maintenance: unknown task {:?}, dropping", other);
                            Ok(())
                        }
                    }
                }
            })
            .await?;
        info!("maintenance: recycling worker");
    }
}
