use std::fmt;
use std::time::Duration;

use anyhow::Error;
use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::{CoreError, ErrorKind};

/// Hard cap on a serialized task payload.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// How long a claimed task may sit unacked before redelivery.
pub const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(600);

/// The four disjoint queue partitions, one per worker class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Monitoring,
    Snmp,
    Alerts,
    Maintenance,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Monitoring => "monitoring",
            Partition::Snmp => "snmp",
            Partition::Alerts => "alerts",
            Partition::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire shape of a queued task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub kwargs: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ClaimedTask {
    pub id: i64,
    pub partition: Partition,
    pub message: TaskMessage,
    pub attempts: i32,
}

pub fn parse_partition(raw: &str) -> Option<Partition> {
    match raw {
        "monitoring" => Some(Partition::Monitoring),
        "snmp" => Some(Partition::Snmp),
        "alerts" => Some(Partition::Alerts),
        "maintenance" => Some(Partition::Maintenance),
        _ => None,
    }
}

/// Serializes and size-checks a payload before it goes on the wire.
pub fn encode_payload(message: &TaskMessage) -> Result<serde_json::Value, CoreError> {
    let value = serde_json::to_value(message)
        .map_err(|e| CoreError::new(ErrorKind::Internal, format!("unserializable task: {}", e)))?;
    let size = value.to_string().len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(CoreError::new(
            ErrorKind::Backpressure,
            format!("task payload is {} bytes, cap is {}", size, MAX_PAYLOAD_BYTES),
        ));
    }
    Ok(value)
}

/// Durable FIFO over the relational store; at-least-once delivery with
/// per-task ack and visibility-timeout redelivery.
#[derive(Clone)]
pub struct Queue {
    pool: PgPool,
}

impl Queue {
    pub fn new(pool: PgPool) -> Self {
        Queue { pool }
    }

    pub async fn enqueue(
        &self,
        partition: Partition,
        task: &str,
        args: serde_json::Value,
    ) -> Result<i64, Error> {
        let message = TaskMessage {
            task: task.to_string(),
            args,
            kwargs: serde_json::json!({}),
            enqueued_at: Utc::now(),
        };
        let payload = encode_payload(&message)?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO task_queue (partition, task, payload) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(partition.as_str())
        .bind(task)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await?;

        trace!("queue({}): enqueued {} as #{}", partition, task, id);
        Ok(id)
    }

    /// Claims the oldest unclaimed task in the partition, if any. Claims
    /// are atomic across competing workers via SKIP LOCKED.
    pub async fn claim(
        &self,
        partition: Partition,
        worker_id: &str,
    ) -> Result<Option<ClaimedTask>, Error> {
        let row: Option<(i64, String, serde_json::Value, i32)> = sqlx::query_as(
            "UPDATE task_queue SET claimed_by = $2, claimed_at = now(), attempts = attempts + 1 \
             WHERE id = (SELECT id FROM task_queue \
                         WHERE partition = $1 AND claimed_at IS NULL \
                         ORDER BY id LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING id, partition, payload, attempts",
        )
        .bind(partition.as_str())
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some((id, _partition, payload, attempts)) => {
                let message: TaskMessage = serde_json::from_value(payload)?;
                debug!(
                    "queue({}): {} claimed #{} ({}), attempt {}",
                    partition, worker_id, id, message.task, attempts
                );
                Ok(Some(ClaimedTask {
                    id,
                    partition,
                    message,
                    attempts,
                }))
            }
        }
    }

    pub async fn ack(&self, task_id: i64) -> Result<(), Error> {
        sqlx::query("DELETE FROM task_queue WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Unclaimed depth of a partition, for the backpressure check.
    pub async fn depth(&self, partition: Partition) -> Result<i64, Error> {
        let (depth,): (i64,) = sqlx::query_as(
            "SELECT count(*) FROM task_queue WHERE partition = $1 AND claimed_at IS NULL",
        )
        .bind(partition.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(depth)
    }

    /// Returns claimed-but-unacked tasks to the queue once their visibility
    /// window lapses (crashed worker, lost ack).
    pub async fn requeue_expired(&self, visibility: Duration) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE task_queue SET claimed_by = NULL, claimed_at = NULL \
             WHERE claimed_at < now() - $1::interval",
        )
        .bind(format!("{} seconds", visibility.as_secs()))
        .execute(&self.pool)
        .await?;
        let requeued = result.rows_affected();
        if requeued > 0 {
            debug!("queue: redelivering {} expired tasks", requeued);
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_round_trip() {
        for partition in [
            Partition::Monitoring,
            Partition::Snmp,
            Partition::Alerts,
            Partition::Maintenance,
        ] {
            assert_eq!(parse_partition(partition.as_str()), Some(partition));
        }
        assert_eq!(parse_partition("bogus"), None);
    }

    #[test]
    fn payload_cap_is_enforced() {
        let small = TaskMessage {
            task: "ping-batch".into(),
            args: serde_json::json!({"batch_index": 0, "device_ids": ["a", "b"]}),
            kwargs: serde_json::json!({}),
            enqueued_at: Utc::now(),
        };
        assert!(encode_payload(&small).is_ok());

        let oversized = TaskMessage {
            task: "ping-batch".into(),
            args: serde_json::json!({"blob": "x".repeat(MAX_PAYLOAD_BYTES)}),
            kwargs: serde_json::json!({}),
            enqueued_at: Utc::now(),
        };
        let error = encode_payload(&oversized).unwrap_err();
        assert_eq!(error.kind, ErrorKind::Backpressure);
    }

    #[test]
    fn task_message_wire_shape() {
        let message = TaskMessage {
            task: "evaluate-alerts".into(),
            args: serde_json::json!({}),
            kwargs: serde_json::json!({}),
            enqueued_at: Utc::now(),
        };
        let value = encode_payload(&message).unwrap();
        assert_eq!(value["task"], "evaluate-alerts");
        assert!(value["enqueued_at"].is_string());
        // timestamps cross the boundary with an explicit UTC marker
        let raw = value["enqueued_at"].as_str().unwrap();
        assert!(raw.ends_with('Z') || raw.contains("+00:00"));
    }
}
