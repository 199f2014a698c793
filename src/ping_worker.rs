use std::sync::Arc;

use anyhow::{Context, Error};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::time::Instant;
use uuid::Uuid;

use crate::alerts::{RULE_DEVICE_DOWN, RULE_DEVICE_FLAPPING, RULE_DEVICE_RECOVERED};
use crate::config::Config;
use crate::icmp::{ProbeResult, Prober};
use crate::models::{Device, Severity};
use crate::state::{self, StateEvent};
use crate::store;
use crate::tsdb::{device_labels, Sample, TsdbWriter};

#[derive(Debug, Serialize, Deserialize)]
pub struct PingBatchArgs {
    pub batch_index: usize,
    pub device_ids: Vec<Uuid>,
}

pub struct PingWorkerCtx {
    pub pool: PgPool,
    pub writer: TsdbWriter,
    pub prober: Arc<Prober>,
    pub config: Arc<Config>,
}

fn down_severity(isp_uplink: bool) -> Severity {
    if isp_uplink {
        Severity::Critical
    } else {
        Severity::High
    }
}

/// Consumes one ping-batch task: probes every device with bounded fan-out,
/// writes the reachability samples and drives the state machine. Bounded by
/// the batch deadline; devices not reached in time are covered by the next
/// tick.
pub async fn handle_ping_batch(ctx: &PingWorkerCtx, args: &serde_json::Value) -> Result<(), Error> {
    let args: PingBatchArgs =
        serde_json::from_value(args.clone()).context("malformed ping-batch args")?;
    let devices = store::devices_by_ids(&ctx.pool, &args.device_ids).await?;
    let total = devices.len();
    let deadline =
        Instant::now() + ctx.config.batch_timeout(ctx.config.cadence.ping_period);

    debug!(
        "ping_batch(#{}): probing {} devices",
        args.batch_index, total
    );

    let mut results = stream::iter(devices)
        .map(|device| async move { process_device(ctx, device).await })
        .buffer_unordered(ctx.config.icmp.fanout);

    let mut completed = 0usize;
    let mut failed = 0usize;
    loop {
        match tokio::time::timeout_at(deadline, results.next()).await {
            Ok(Some(Ok(()))) => completed += 1,
            Ok(Some(Err(device_error))) => {
                failed += 1;
                warn!("ping_batch(#{}): {:#}", args.batch_index, device_error);
            }
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "ping_batch(#{}): deadline hit, partial completion {}/{} (remainder covered by next tick)",
                    args.batch_index, completed, total
                );
                break;
            }
        }
    }

    info!(
        "ping_batch(#{}): done, {} ok, {} failed of {}",
        args.batch_index, completed, failed, total
    );
    Ok(())
}

async fn process_device(ctx: &PingWorkerCtx, device: Device) -> Result<(), Error> {
    let ip = match device.ip.parse() {
        Ok(ip) => ip,
        Err(_) => {
            // bad inventory data is contained, not fatal for the batch
            warn!("ping({}): unparseable address {:?}", device.name, device.ip);
            return Ok(());
        }
    };

    let result = ctx.prober.probe(ip).await;
    let now = Utc::now();
    write_samples(&ctx.writer, &device, &result);

    // the state machine runs in its own short transaction under a row lock;
    // a connection failure aborts this device only and the next tick retries
    let mut tx = ctx
        .pool
        .begin()
        .await
        .with_context(|| format!("ping({}): could not begin transaction", device.name))?;

    let fields = match store::lock_device_state(&mut tx, device.id).await? {
        Some(fields) => fields,
        None => {
            debug!("ping({}): device vanished mid-batch", device.name);
            return Ok(());
        }
    };

    let old_status = fields.status_label();
    let transition = state::apply_ping(
        &fields,
        result.reachable,
        now,
        &ctx.config.flap,
        device.is_isp_uplink(),
    );

    if transition.status_changed {
        store::insert_status_change(
            &mut tx,
            device.id,
            old_status,
            transition.fields.status_label(),
            now,
        )
        .await?;
    }
    store::insert_ping_result(
        &mut tx,
        device.id,
        result.reachable,
        result.avg_rtt_ms,
        result.loss_ratio,
        now,
    )
    .await?;
    let last_seen = result.reachable.then_some(now);
    store::save_device_state(&mut tx, device.id, &transition.fields, last_seen).await?;
    tx.commit().await?;

    if let Some(violation) = state::invariant_violation(&transition.fields, result.reachable) {
        error!("ping({}): state invariant violated: {}", device.name, violation);
        ctx.writer.write(
            Sample::new("state_machine_violation", 1.0, now)
                .with_labels(&device_labels(&device)),
        );
    }

    apply_alert_events(ctx, &device, &transition).await?;
    Ok(())
}

fn write_samples(writer: &TsdbWriter, device: &Device, result: &ProbeResult) {
    let now = Utc::now();
    let labels = device_labels(device);

    writer.write(
        Sample::new(
            "device_ping_status",
            if result.reachable { 1.0 } else { 0.0 },
            now,
        )
        .with_labels(&labels),
    );
    writer.write(Sample::new("device_ping_loss_ratio", result.loss_ratio, now).with_labels(&labels));
    if let Some(rtt) = result.avg_rtt_ms {
        writer.write(Sample::new("device_ping_rtt_ms", rtt, now).with_labels(&labels));
    }
    if let Some(kind) = result.error_kind {
        writer.write(
            Sample::new("device_ping_error", 1.0, now)
                .with_labels(&labels)
                .with_label("kind", kind.as_str()),
        );
    }
}

/// Alert side effects of a transition. Runs after the state transaction has
/// committed so an alert write failure never rolls back device state.
async fn apply_alert_events(
    ctx: &PingWorkerCtx,
    device: &Device,
    transition: &state::Transition,
) -> Result<(), Error> {
    let now = Utc::now();
    let isp = device.is_isp_uplink();
    let flapping = transition.fields.is_flapping;

    for event in &transition.events {
        match event {
            StateEvent::WentDown => {
                if flapping {
                    debug!("ping({}): down alert suppressed while flapping", device.name);
                    continue;
                }
                let mut context = std::collections::HashMap::new();
                context.insert("ip".to_string(), device.ip.clone());
                store::open_alert(
                    &ctx.pool,
                    None,
                    RULE_DEVICE_DOWN,
                    Some(device.id),
                    down_severity(isp),
                    now,
                    &context,
                )
                .await?;
            }
            StateEvent::Recovered => {
                store::resolve_alert_by_name(&ctx.pool, device.id, RULE_DEVICE_DOWN, now).await?;
                if ctx.config.recovery_events_enabled && !flapping {
                    store::insert_resolved_event(
                        &ctx.pool,
                        RULE_DEVICE_RECOVERED,
                        device.id,
                        Severity::Low,
                        now,
                    )
                    .await?;
                }
            }
            StateEvent::FlappingStarted => {
                // flapping supersedes the individual down/up churn
                store::resolve_alert_by_name(&ctx.pool, device.id, RULE_DEVICE_DOWN, now).await?;
                let mut context = std::collections::HashMap::new();
                context.insert("ip".to_string(), device.ip.clone());
                context.insert(
                    "flap_count".to_string(),
                    transition.fields.flap_count.to_string(),
                );
                store::open_alert(
                    &ctx.pool,
                    None,
                    RULE_DEVICE_FLAPPING,
                    Some(device.id),
                    down_severity(isp),
                    now,
                    &context,
                )
                .await?;
            }
            StateEvent::FlappingCleared => {
                store::resolve_alert_by_name(&ctx.pool, device.id, RULE_DEVICE_FLAPPING, now)
                    .await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_args_round_trip() {
        let args = PingBatchArgs {
            batch_index: 3,
            device_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
        };
        let value = serde_json::to_value(&args).unwrap();
        let parsed: PingBatchArgs = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.batch_index, 3);
        assert_eq!(parsed.device_ids.len(), 2);
    }

    #[test]
    fn isp_uplinks_page_at_critical() {
        assert_eq!(down_severity(true), Severity::Critical);
        assert_eq!(down_severity(false), Severity::High);
    }
}
