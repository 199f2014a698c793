use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::config::Config;
use crate::queue::{ClaimedTask, Partition, Queue, VISIBILITY_TIMEOUT};
use crate::tsdb::{Sample, TsdbWriter};

const IDLE_POLL: Duration = Duration::from_millis(1000);
const EXPIRY_SWEEP: Duration = Duration::from_secs(60);

/// Claim -> dispatch -> ack loop for one worker class. Returns after
/// `max_tasks_per_child` tasks so the caller can recycle the worker, which
/// bounds leaks in long-lived processes.
pub struct WorkerHarness {
    pub queue: Queue,
    pub writer: TsdbWriter,
    pub config: Arc<Config>,
    pub partition: Partition,
    pub worker_id: String,
}

impl WorkerHarness {
    pub fn new(
        queue: Queue,
        writer: TsdbWriter,
        config: Arc<Config>,
        partition: Partition,
    ) -> Self {
        let worker_id = format!(
            "{}-{}-{}",
            partition.as_str(),
            std::process::id(),
            &uuid::Uuid::new_v4().to_string()[..8]
        );
        WorkerHarness {
            queue,
            writer,
            config,
            partition,
            worker_id,
        }
    }

    fn heartbeat(&self) {
        let now = Utc::now();
        self.writer.write(
            Sample::new("worker_heartbeat", 1.0, now)
                .with_label("worker_class", self.partition.as_str()),
        );
        self.writer.write(
            Sample::new(
                "tsdb_out_of_order_dropped_total",
                self.writer.dropped_total() as f64,
                now,
            )
            .with_label("worker_class", self.partition.as_str()),
        );
    }

    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), Error>
    where
        F: Fn(ClaimedTask) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        info!(
            "worker({}): consuming partition {}",
            self.worker_id, self.partition
        );
        self.heartbeat();

        let heartbeat_period = Duration::from_secs(self.config.cadence.worker_health_period);
        let mut last_heartbeat = Instant::now();
        let mut last_expiry_sweep = Instant::now();
        let mut tasks_done: u64 = 0;

        loop {
            if last_heartbeat.elapsed() >= heartbeat_period {
                self.heartbeat();
                last_heartbeat = Instant::now();
            }
            if last_expiry_sweep.elapsed() >= EXPIRY_SWEEP {
                if let Err(error) = self.queue.requeue_expired(VISIBILITY_TIMEOUT).await {
                    warn!("worker({}): expiry sweep failed: {:#}", self.worker_id, error);
                }
                last_expiry_sweep = Instant::now();
            }

            let claimed = match self.queue.claim(self.partition, &self.worker_id).await {
                Ok(claimed) => claimed,
                Err(error) => {
                    warn!("worker({}): claim failed: {:#}", self.worker_id, error);
                    tokio::time::sleep(IDLE_POLL).await;
                    continue;
                }
            };

            let task = match claimed {
                Some(task) => task,
                None => {
                    tokio::time::sleep(IDLE_POLL).await;
                    continue;
                }
            };

            let task_id = task.id;
            let task_name = task.message.task.clone();
            let started = Instant::now();

            // a failed handler is still acked: missed work is covered by the
            // next tick, never replayed into a pile-up
            if let Err(error) = handler(task).await {
                warn!(
                    "worker({}): task {} (#{}) failed: {:#}",
                    self.worker_id, task_name, task_id, error
                );
            }
            if let Err(error) = self.queue.ack(task_id).await {
                warn!(
                    "worker({}): ack of #{} failed: {:#}",
                    self.worker_id, task_id, error
                );
            }

            debug!(
                "worker({}): task {} (#{}) took {:?}",
                self.worker_id,
                task_name,
                task_id,
                started.elapsed()
            );

            tasks_done += 1;
            if tasks_done >= self.config.max_tasks_per_child {
                info!(
                    "worker({}): processed {} tasks, recycling",
                    self.worker_id, tasks_done
                );
                return Ok(());
            }
        }
    }
}
