use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use log::{debug, info, warn};
use rand::Rng;
use sqlx::PgPool;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::config::Config;
use crate::queue::{Partition, Queue};
use crate::store;

pub const TASK_PING_BATCH: &str = "ping-batch";
pub const TASK_SNMP_BATCH: &str = "snmp-batch";
pub const TASK_DISCOVER_BATCH: &str = "discover-batch";
pub const TASK_EVALUATE_ALERTS: &str = "evaluate-alerts";
pub const TASK_CLEANUP_INTERFACES: &str = "cleanup-stale-interfaces";
pub const TASK_CLEANUP_ALERTS: &str = "cleanup-resolved-alerts";
pub const TASK_CHECK_WORKER_HEALTH: &str = "check-worker-health";
pub const TASK_VACUUM_IDLE_TX: &str = "vacuum-idle-transactions";

/// Fleet size to batch size, tuned to bound worker memory and keep a
/// batch's wall clock under the polling period.
pub fn batch_size(device_count: i64) -> usize {
    match device_count {
        n if n <= 100 => 25,
        n if n <= 500 => 50,
        n if n <= 1000 => 100,
        n if n <= 5000 => 200,
        _ => 500,
    }
}

pub fn chunk_batches(ids: &[Uuid], size: usize) -> Vec<Vec<Uuid>> {
    ids.chunks(size.max(1)).map(|chunk| chunk.to_vec()).collect()
}

/// Emits due tasks into the queue on fixed cadences. Does no work itself;
/// the schedule is rebuilt from configuration at startup, so nothing stale
/// survives an upgrade.
pub struct Scheduler {
    pool: PgPool,
    queue: Queue,
    config: Arc<Config>,
}

impl Scheduler {
    pub fn new(pool: PgPool, queue: Queue, config: Arc<Config>) -> Self {
        Scheduler { pool, queue, config }
    }

    /// Splits the enabled fleet into batch tasks. Skips the tick entirely
    /// when the partition is backed up: the next tick supersedes.
    async fn enqueue_device_batches(
        &self,
        partition: Partition,
        task: &str,
    ) -> Result<usize, Error> {
        let depth = self.queue.depth(partition).await?;
        if depth > self.config.queue_high_water {
            warn!(
                "scheduler({}): backpressure, queue depth {} > {}, skipping tick",
                task, depth, self.config.queue_high_water
            );
            return Ok(0);
        }

        let ids = store::enabled_device_ids(&self.pool).await?;
        let size = batch_size(ids.len() as i64);
        let batches = chunk_batches(&ids, size);
        let count = batches.len();

        for (batch_index, device_ids) in batches.into_iter().enumerate() {
            self.queue
                .enqueue(
                    partition,
                    task,
                    serde_json::json!({
                        "batch_index": batch_index,
                        "device_ids": device_ids,
                    }),
                )
                .await?;
        }

        debug!(
            "scheduler({}): enqueued {} batches of up to {} devices",
            task, count, size
        );
        Ok(count)
    }

    async fn enqueue_plain(&self, partition: Partition, task: &str, args: serde_json::Value) {
        if let Err(error) = self.queue.enqueue(partition, task, args).await {
            warn!("scheduler({}): enqueue failed: {:#}", task, error);
        }
    }

    /// Runs every cadence loop until the process exits. Each loop sleeps a
    /// random fraction of its period first so a fleet-wide restart does not
    /// synchronize every tick.
    pub async fn run(self) -> Result<(), Error> {
        let scheduler = Arc::new(self);
        let mut handles = Vec::new();

        {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                let period = s.config.cadence.ping_period;
                startup_jitter(period).await;
                let mut ticker = tick_every(period);
                loop {
                    ticker.tick().await;
                    if let Err(error) = s
                        .enqueue_device_batches(Partition::Monitoring, TASK_PING_BATCH)
                        .await
                    {
                        warn!("scheduler(ping): tick failed: {:#}", error);
                    }
                }
            }));
        }

        {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                let period = s.config.cadence.snmp_period;
                startup_jitter(period).await;
                let mut ticker = tick_every(period);
                loop {
                    ticker.tick().await;
                    if let Err(error) = s
                        .enqueue_device_batches(Partition::Snmp, TASK_SNMP_BATCH)
                        .await
                    {
                        warn!("scheduler(snmp): tick failed: {:#}", error);
                    }
                }
            }));
        }

        {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                let period = s.config.cadence.discovery_period;
                startup_jitter(period.min(300)).await;
                let mut ticker = tick_every(period);
                loop {
                    ticker.tick().await;
                    if let Err(error) = s
                        .enqueue_device_batches(Partition::Snmp, TASK_DISCOVER_BATCH)
                        .await
                    {
                        warn!("scheduler(discovery): tick failed: {:#}", error);
                    }
                }
            }));
        }

        {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                let period = s.config.cadence.alert_period;
                startup_jitter(period).await;
                let mut ticker = tick_every(period);
                loop {
                    ticker.tick().await;
                    s.enqueue_plain(Partition::Alerts, TASK_EVALUATE_ALERTS, serde_json::json!({}))
                        .await;
                }
            }));
        }

        {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                let period = s.config.cadence.interface_cleanup_period;
                startup_jitter(period.min(600)).await;
                let mut ticker = tick_every(period);
                loop {
                    ticker.tick().await;
                    s.enqueue_plain(
                        Partition::Maintenance,
                        TASK_CLEANUP_INTERFACES,
                        serde_json::json!({}),
                    )
                    .await;
                }
            }));
        }

        {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                let period = s.config.cadence.alert_cleanup_period;
                startup_jitter(period.min(600)).await;
                let mut ticker = tick_every(period);
                let mut tick_count: u64 = 0;
                loop {
                    ticker.tick().await;
                    // weekly deep pass vacuums after the delete
                    let deep = tick_count % 7 == 0;
                    tick_count += 1;
                    s.enqueue_plain(
                        Partition::Maintenance,
                        TASK_CLEANUP_ALERTS,
                        serde_json::json!({ "deep": deep }),
                    )
                    .await;
                }
            }));
        }

        {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                let period = s.config.cadence.worker_health_period;
                startup_jitter(period).await;
                let mut ticker = tick_every(period);
                loop {
                    ticker.tick().await;
                    s.enqueue_plain(
                        Partition::Maintenance,
                        TASK_CHECK_WORKER_HEALTH,
                        serde_json::json!({}),
                    )
                    .await;
                }
            }));
        }

        {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move {
                let period = s.config.cadence.idle_tx_period;
                startup_jitter(period).await;
                let mut ticker = tick_every(period);
                loop {
                    ticker.tick().await;
                    s.enqueue_plain(
                        Partition::Maintenance,
                        TASK_VACUUM_IDLE_TX,
                        serde_json::json!({}),
                    )
                    .await;
                }
            }));
        }

        info!("scheduler: {} cadence loops running", handles.len());
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

fn tick_every(period_seconds: u64) -> tokio::time::Interval {
    let mut ticker = interval(Duration::from_secs(period_seconds.max(1)));
    // a stalled process must not replay missed ticks; the next one supersedes
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn startup_jitter(period_seconds: u64) {
    if period_seconds == 0 {
        return;
    }
    let delay = Duration::from_secs(rand::thread_rng().gen_range(0..period_seconds));
    debug!("scheduler: startup delay -> sleeping for {:?}", delay);
    tokio::time::sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_table() {
        assert_eq!(batch_size(1), 25);
        assert_eq!(batch_size(100), 25);
        assert_eq!(batch_size(101), 50);
        assert_eq!(batch_size(500), 50);
        assert_eq!(batch_size(875), 100);
        assert_eq!(batch_size(1000), 100);
        assert_eq!(batch_size(5000), 200);
        assert_eq!(batch_size(5001), 500);
        assert_eq!(batch_size(50_000), 500);
    }

    #[test]
    fn fleet_of_875_becomes_nine_batches() {
        let ids: Vec<Uuid> = (0..875).map(|_| Uuid::new_v4()).collect();
        let batches = chunk_batches(&ids, batch_size(ids.len() as i64));
        assert_eq!(batches.len(), 9);
        assert!(batches[..8].iter().all(|b| b.len() == 100));
        assert_eq!(batches[8].len(), 75);
        // every device is covered exactly once
        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, 875);
    }

    #[test]
    fn empty_fleet_has_no_batches() {
        assert!(chunk_batches(&[], 25).is_empty());
    }
}
