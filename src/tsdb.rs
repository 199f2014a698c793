use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Error};
use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use log::{debug, info, trace, warn};
use size_format::SizeFormatterSI;

use crate::models::Device;

const WRITE_PATH: &str = "/api/v1/import/prometheus";
const QUERY_PATH: &str = "/api/v1/query";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const BATCH_MAX: usize = 500;
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];
const REINJECT_BACKOFF: Duration = Duration::from_secs(8);

/// One labeled measurement on its way to the time-series store.
#[derive(Debug, Clone)]
pub struct Sample {
    pub metric: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(metric: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
        Sample {
            metric: metric.into(),
            labels: vec![],
            value,
            timestamp,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    pub fn with_labels(mut self, labels: &[(String, String)]) -> Self {
        self.labels.extend_from_slice(labels);
        self
    }

    /// Identity of the series for the monotonic-timestamp guard.
    fn series_key(&self) -> String {
        let mut labels = self.labels.clone();
        labels.sort();
        let mut key = self.metric.clone();
        for (k, v) in labels {
            let _ = write!(key, ",{}={}", k, v);
        }
        key
    }
}

/// The label set every device-scoped sample must carry.
pub fn device_labels(device: &Device) -> Vec<(String, String)> {
    let mut labels = vec![
        ("device".to_string(), device.name.clone()),
        ("ip".to_string(), device.ip.clone()),
        ("device_type".to_string(), device.device_type.to_string()),
    ];
    if let Some(branch) = &device.branch {
        labels.push(("branch".to_string(), branch.clone()));
    }
    if let Some(region) = &device.region {
        labels.push(("region".to_string(), region.clone()));
    }
    labels
}

pub fn sanitize_metric(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// `metric{label="value",…} value timestamp_ms`, one line per sample.
pub fn format_line(sample: &Sample) -> String {
    let mut line = sanitize_metric(&sample.metric);
    if !sample.labels.is_empty() {
        line.push('{');
        for (i, (key, value)) in sample.labels.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            let _ = write!(
                line,
                "{}=\"{}\"",
                sanitize_metric(key),
                escape_label_value(value)
            );
        }
        line.push('}');
    }
    let _ = write!(
        line,
        " {} {}",
        sample.value,
        sample.timestamp.timestamp_millis()
    );
    line
}

/// Cheap clonable handle handed to every worker.
#[derive(Clone)]
pub struct TsdbWriter {
    sender: Sender<Sample>,
    dropped: Arc<AtomicU64>,
}

impl TsdbWriter {
    pub fn write(&self, sample: Sample) {
        // unbounded channel: the writer task applies backpressure by
        // logging buffered memory, never by blocking a probe
        let _ = self.sender.send(sample);
    }

    pub fn write_all(&self, samples: impl IntoIterator<Item = Sample>) {
        for sample in samples {
            self.write(sample);
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawns the background writer task; returns the handle workers clone.
pub fn spawn_writer(tsdb_url: String) -> (TsdbWriter, tokio::task::JoinHandle<()>) {
    let (sender, receiver) = flume::unbounded();
    let dropped = Arc::new(AtomicU64::new(0));
    let writer = TsdbWriter {
        sender: sender.clone(),
        dropped: dropped.clone(),
    };

    let handle = tokio::spawn(async move {
        tsdb_send_safe(tsdb_url, sender, receiver, dropped).await;
    });

    (writer, handle)
}

/// Keeps the write loop alive; on transport errors the in-flight batch is
/// reinjected and the loop restarts after a backoff.
async fn tsdb_send_safe(
    tsdb_url: String,
    sender: Sender<Sample>,
    receiver: Receiver<Sample>,
    dropped: Arc<AtomicU64>,
) {
    let client = match reqwest::Client::builder().timeout(HTTP_TIMEOUT).build() {
        Ok(client) => client,
        Err(error) => {
            warn!("tsdb_send_safe: could not build http client: {}", error);
            return;
        }
    };

    // per-series timestamp high-water marks, kept across reconnects
    let mut last_written: HashMap<String, i64> = HashMap::new();

    loop {
        let send = tsdb_send(
            &tsdb_url,
            &client,
            &sender,
            &receiver,
            &dropped,
            &mut last_written,
        )
        .await;
        if let Err(error) = send {
            let queue_len = receiver.len();
            let memory_consumed = std::mem::size_of::<Sample>() as u64 * queue_len as u64;
            warn!(
                "tsdb_send_safe({}): error {:#}; buffering {} samples, using {} memory; backing off for {:?}",
                tsdb_url, error, queue_len, SizeFormatterSI::new(memory_consumed), REINJECT_BACKOFF
            );
            tokio::time::sleep(REINJECT_BACKOFF).await;
            info!(
                "tsdb_send_safe({}): backoff {:?} done, retrying...",
                tsdb_url, REINJECT_BACKOFF
            );
        }
    }
}

async fn tsdb_send(
    tsdb_url: &str,
    client: &reqwest::Client,
    sender: &Sender<Sample>,
    receiver: &Receiver<Sample>,
    dropped: &AtomicU64,
    last_written: &mut HashMap<String, i64>,
) -> Result<(), Error> {
    let url = format!("{}{}", tsdb_url.trim_end_matches('/'), WRITE_PATH);

    loop {
        let first = receiver.recv_async().await?;
        let mut batch = vec![first];
        while batch.len() < BATCH_MAX {
            match receiver.try_recv() {
                Ok(sample) => batch.push(sample),
                Err(_) => break,
            }
        }

        // per-series timestamps must be monotonic for correct rate()
        batch.retain(|sample| {
            let key = sample.series_key();
            let ts = sample.timestamp.timestamp_millis();
            match last_written.get(&key) {
                Some(last) if *last > ts => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "tsdb_send: dropping out-of-order sample for {} ({} < {})",
                        sample.metric, ts, last
                    );
                    false
                }
                _ => {
                    last_written.insert(key, ts);
                    true
                }
            }
        });
        if batch.is_empty() {
            continue;
        }

        let body = batch
            .iter()
            .map(format_line)
            .collect::<Vec<_>>()
            .join("\n");
        trace!("tsdb_send: sending {} lines", batch.len());

        let mut attempt = 0;
        loop {
            match client.post(&url).body(body.clone()).send().await {
                Ok(response) if response.status().is_success() => break,
                Ok(response) if response.status().is_client_error() => {
                    // a malformed batch will never succeed: log and drop
                    warn!(
                        "tsdb_send: dropping batch of {} samples, server said {}",
                        batch.len(),
                        response.status()
                    );
                    break;
                }
                Ok(response) if attempt < RETRY_DELAYS.len() => {
                    debug!(
                        "tsdb_send: attempt {} got {}, retrying",
                        attempt,
                        response.status()
                    );
                    tokio::time::sleep(RETRY_DELAYS[attempt]).await;
                    attempt += 1;
                }
                Ok(response) => {
                    reinject(sender, batch);
                    bail!("server error {} after retries", response.status());
                }
                Err(error) if attempt < RETRY_DELAYS.len() => {
                    debug!("tsdb_send: attempt {} failed ({}), retrying", attempt, error);
                    tokio::time::sleep(RETRY_DELAYS[attempt]).await;
                    attempt += 1;
                }
                Err(error) => {
                    reinject(sender, batch);
                    return Err(error.into());
                }
            }
        }
    }
}

fn reinject(sender: &Sender<Sample>, batch: Vec<Sample>) {
    debug!("tsdb_send: reinjecting {} samples into channel", batch.len());
    for sample in batch {
        let _ = sender.send(sample);
    }
}

/// Read side: Prometheus-compatible instant queries, used only for the
/// aggregates the alert engine cannot compute from the relational store.
pub struct TsdbReader {
    base_url: String,
    client: reqwest::Client,
}

impl TsdbReader {
    pub fn new(tsdb_url: &str) -> Result<Self, Error> {
        Ok(TsdbReader {
            base_url: tsdb_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?,
        })
    }

    pub async fn query_instant(
        &self,
        query: &str,
    ) -> Result<Vec<(HashMap<String, String>, f64)>, Error> {
        let url = format!("{}{}", self.base_url, QUERY_PATH);
        let response = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = response.json().await?;
        parse_instant_response(&body)
    }
}

pub fn parse_instant_response(
    body: &serde_json::Value,
) -> Result<Vec<(HashMap<String, String>, f64)>, Error> {
    if body["status"] != "success" {
        bail!("query failed: {}", body["status"]);
    }
    let mut out = Vec::new();
    let results = body["data"]["result"].as_array().cloned().unwrap_or_default();
    for entry in results {
        let labels: HashMap<String, String> = entry["metric"]
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let value = entry["value"][1]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok());
        if let Some(value) = value {
            out.push((labels, value));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn formats_line_with_labels_and_millis() {
        let sample = Sample::new("device_ping_rtt_ms", 12.5, ts())
            .with_label("device", "br1-sw1")
            .with_label("ip", "10.0.0.1");
        assert_eq!(
            format_line(&sample),
            "device_ping_rtt_ms{device=\"br1-sw1\",ip=\"10.0.0.1\"} 12.5 1700000000000"
        );
    }

    #[test]
    fn formats_line_without_labels() {
        let sample = Sample::new("worker_heartbeat", 1.0, ts());
        assert_eq!(format_line(&sample), "worker_heartbeat 1 1700000000000");
    }

    #[test]
    fn escapes_label_values_and_sanitizes_names() {
        let sample = Sample::new("interface-if-name", 1.0, ts())
            .with_label("ifName", "Gi0/1 \"uplink\"");
        let line = format_line(&sample);
        assert!(line.starts_with("interface_if_name{ifName=\"Gi0/1 \\\"uplink\\\"\"}"));
    }

    #[test]
    fn series_key_ignores_label_order() {
        let a = Sample::new("m", 1.0, ts())
            .with_label("x", "1")
            .with_label("y", "2");
        let b = Sample::new("m", 1.0, ts())
            .with_label("y", "2")
            .with_label("x", "1");
        assert_eq!(a.series_key(), b.series_key());
    }

    #[test]
    fn parses_instant_query_response() {
        let body: serde_json::Value = serde_json::from_str(
            r#"{
                "status": "success",
                "data": {
                    "resultType": "vector",
                    "result": [
                        {"metric": {"device": "sw1"}, "value": [1700000000, "42.5"]},
                        {"metric": {"device": "sw2"}, "value": [1700000000, "7"]}
                    ]
                }
            }"#,
        )
        .unwrap();
        let parsed = parse_instant_response(&body).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0["device"], "sw1");
        assert_eq!(parsed[0].1, 42.5);
    }

    #[test]
    fn rejects_failed_query_response() {
        let body: serde_json::Value =
            serde_json::from_str(r#"{"status": "error", "data": {}}"#).unwrap();
        assert!(parse_instant_response(&body).is_err());
    }
}
