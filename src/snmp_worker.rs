use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Error};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::Config;
use crate::discovery::classify_vendor;
use crate::error::CoreError;
use crate::models::{Device, Interface};
use crate::snmp::{oids, DeviceSession, SnmpClient, SnmpValue};
use crate::store;
use crate::tsdb::{device_labels, sanitize_metric, Sample, TsdbWriter};
use crate::vault::Vault;

#[derive(Debug, Serialize, Deserialize)]
pub struct SnmpBatchArgs {
    pub batch_index: usize,
    pub device_ids: Vec<Uuid>,
}

pub struct SnmpWorkerCtx {
    pub pool: PgPool,
    pub writer: TsdbWriter,
    pub client: SnmpClient,
    pub vault: Arc<Vault>,
    pub config: Arc<Config>,
}

/// Per-interface counter columns collected for critical and ISP links.
const INTERFACE_COUNTERS: &[(&str, &str)] = &[
    ("interface_if_hc_in_octets", oids::IF_HC_IN_OCTETS),
    ("interface_if_hc_out_octets", oids::IF_HC_OUT_OCTETS),
    ("interface_if_in_errors", oids::IF_IN_ERRORS),
    ("interface_if_out_errors", oids::IF_OUT_ERRORS),
    ("interface_if_in_discards", oids::IF_IN_DISCARDS),
    ("interface_if_out_discards", oids::IF_OUT_DISCARDS),
    ("interface_if_admin_status", oids::IF_ADMIN_STATUS),
    ("interface_if_oper_status", oids::IF_OPER_STATUS),
];

/// Consumes one snmp-batch task. SNMP results only ever produce samples;
/// reachability state belongs to the ICMP path alone.
pub async fn handle_snmp_batch(ctx: &SnmpWorkerCtx, args: &serde_json::Value) -> Result<(), Error> {
    let args: SnmpBatchArgs =
        serde_json::from_value(args.clone()).context("malformed snmp-batch args")?;
    let devices = store::devices_by_ids(&ctx.pool, &args.device_ids).await?;
    let total = devices.len();
    let deadline =
        Instant::now() + ctx.config.batch_timeout(ctx.config.cadence.snmp_period);

    debug!(
        "snmp_batch(#{}): polling {} devices",
        args.batch_index, total
    );

    let mut results = stream::iter(devices)
        .map(|device| async move {
            let name = device.name.clone();
            (name, poll_device(ctx, device).await)
        })
        .buffer_unordered(ctx.config.snmp.fanout);

    let mut completed = 0usize;
    loop {
        match tokio::time::timeout_at(deadline, results.next()).await {
            Ok(Some((name, Ok(samples)))) => {
                completed += 1;
                debug!("snmp_batch: {} produced {} samples", name, samples);
            }
            Ok(Some((name, Err(device_error)))) => {
                // contained: the device is skipped for this tick
                completed += 1;
                debug!("snmp_batch: {} skipped: {:#}", name, device_error);
            }
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "snmp_batch(#{}): deadline hit, partial completion {}/{}",
                    args.batch_index, completed, total
                );
                break;
            }
        }
    }
    Ok(())
}

async fn poll_device(ctx: &SnmpWorkerCtx, device: Device) -> Result<usize, Error> {
    let credential = match ctx.vault.credential_for(&ctx.pool, device.id).await? {
        Some(credential) => credential,
        None => {
            debug!("snmp({}): no credential, skipping", device.name);
            return Ok(0);
        }
    };

    let mut session = match ctx.client.connect(&device.ip, &credential).await {
        Ok(session) => session,
        Err(error) => {
            emit_error_sample(ctx, &device, &error);
            return Err(error.into());
        }
    };

    if device.vendor.is_none() {
        if let Err(error) = autodetect_vendor(ctx, &device, &mut session).await {
            debug!("snmp({}): vendor detection failed: {:#}", device.name, error);
        }
    }

    let mut written = 0;
    written += poll_items(ctx, &device, &mut session).await?;
    written += poll_interface_counters(ctx, &device, &mut session).await?;
    Ok(written)
}

/// First successful contact for an untagged device: classify sysDescr and
/// sysObjectID, then attach the matching template's items.
async fn autodetect_vendor(
    ctx: &SnmpWorkerCtx,
    device: &Device,
    session: &mut DeviceSession,
) -> Result<(), Error> {
    let sys_descr = session.get_one(oids::SYS_DESCR).await?;
    let sys_object_id = session.get_one(oids::SYS_OBJECT_ID).await?;

    let descr = sys_descr.as_str().unwrap_or("");
    let object_id = match &sys_object_id {
        SnmpValue::OidValue(oid) => oid.as_str(),
        _ => "",
    };

    let vendor = match classify_vendor(descr, object_id) {
        Some(vendor) => vendor,
        None => {
            debug!("snmp({}): vendor not recognized from {:?}", device.name, descr);
            return Ok(());
        }
    };

    store::set_device_vendor(&ctx.pool, device.id, vendor).await?;
    info!("snmp({}): vendor detected as {}", device.name, vendor);

    if let Some(template) =
        store::template_for(&ctx.pool, vendor, &device.device_type.to_string()).await?
    {
        let applied = store::apply_template(&ctx.pool, device.id, template.id).await?;
        if applied > 0 {
            info!(
                "snmp({}): applied template {:?} ({} items)",
                device.name, template.name, applied
            );
        }
    }
    Ok(())
}

/// Polls the device's active monitoring items; one sample per numeric item.
async fn poll_items(
    ctx: &SnmpWorkerCtx,
    device: &Device,
    session: &mut DeviceSession,
) -> Result<usize, Error> {
    let items = store::active_items(&ctx.pool, device.id).await?;
    if items.is_empty() {
        return Ok(0);
    }

    let now = Utc::now();
    let mut written = 0;
    for item in &items {
        let value = match session.get_one(&item.oid).await {
            Ok(value) => value,
            Err(error) => {
                emit_error_sample(ctx, device, &error);
                debug!("snmp({}): item {} failed: {}", device.name, item.name, error);
                continue;
            }
        };
        if let Some(kind) = value.error_kind() {
            ctx.writer.write(
                Sample::new("device_snmp_error", 1.0, now)
                    .with_labels(&device_labels(device))
                    .with_label("kind", kind.as_str()),
            );
            debug!(
                "snmp({}): item {} has no instance on the device",
                device.name, item.name
            );
            continue;
        }
        match value.as_f64() {
            Some(value) => {
                ctx.writer.write(
                    Sample::new(format!("snmp_{}", sanitize_metric(&item.name)), value, now)
                        .with_label("device", device.name.clone())
                        .with_label("ip", device.ip.clone())
                        .with_label("oid", item.oid.clone()),
                );
                written += 1;
            }
            None => {
                debug!(
                    "snmp({}): item {} returned a non-numeric value",
                    device.name, item.name
                );
            }
        }
    }
    Ok(written)
}

/// Collects the IF-MIB counter columns for interfaces flagged critical or
/// ISP. Counters are written raw; the time-series store computes rates, so
/// 64-bit wraparound needs no local handling.
async fn poll_interface_counters(
    ctx: &SnmpWorkerCtx,
    device: &Device,
    session: &mut DeviceSession,
) -> Result<usize, Error> {
    let monitored = store::monitored_interfaces(&ctx.pool, device.id).await?;
    if monitored.is_empty() {
        return Ok(0);
    }
    let by_index: HashMap<i32, &Interface> =
        monitored.iter().map(|i| (i.if_index, i)).collect();

    let base_labels = device_labels(device);
    let now = Utc::now();
    let mut written = 0;

    for (metric, column) in INTERFACE_COUNTERS {
        let rows = match session.bulkwalk(column).await {
            Ok(rows) => rows,
            Err(error) => {
                emit_error_sample(ctx, device, &error);
                debug!("snmp({}): walk {} failed: {}", device.name, column, error);
                continue;
            }
        };
        for (suffix, value) in rows {
            let Some(if_index) = suffix.first().map(|i| *i as i32) else {
                continue;
            };
            let Some(iface) = by_index.get(&if_index) else {
                continue;
            };
            let Some(value) = value.as_f64() else {
                continue;
            };

            let mut sample = Sample::new(*metric, value, now)
                .with_labels(&base_labels)
                .with_label("ifIndex", if_index.to_string());
            if let Some(name) = &iface.if_name {
                sample = sample.with_label("ifName", name.clone());
            }
            if let Some(provider) = &iface.isp_provider {
                sample = sample.with_label("isp_provider", provider.clone());
            }
            ctx.writer.write(sample);
            written += 1;
        }
    }
    Ok(written)
}

/// Consumes one discover-batch task: walks the interface tables of every
/// device in the batch and upserts the classified rows.
pub async fn handle_discover_batch(
    ctx: &SnmpWorkerCtx,
    args: &serde_json::Value,
) -> Result<(), Error> {
    let args: SnmpBatchArgs =
        serde_json::from_value(args.clone()).context("malformed discover-batch args")?;
    let devices = store::devices_by_ids(&ctx.pool, &args.device_ids).await?;
    let total = devices.len();
    let deadline =
        Instant::now() + ctx.config.batch_timeout(ctx.config.cadence.discovery_period);

    debug!(
        "discover_batch(#{}): walking {} devices",
        args.batch_index, total
    );

    let mut results = stream::iter(devices)
        .map(|device| async move {
            let name = device.name.clone();
            (name, discover_device(ctx, device).await)
        })
        .buffer_unordered(ctx.config.snmp.fanout);

    let mut completed = 0usize;
    loop {
        match tokio::time::timeout_at(deadline, results.next()).await {
            Ok(Some((_, Ok(_)))) => completed += 1,
            Ok(Some((name, Err(device_error)))) => {
                completed += 1;
                debug!("discover_batch: {} skipped: {:#}", name, device_error);
            }
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "discover_batch(#{}): deadline hit, partial completion {}/{}",
                    args.batch_index, completed, total
                );
                break;
            }
        }
    }
    Ok(())
}

async fn discover_device(ctx: &SnmpWorkerCtx, device: Device) -> Result<usize, Error> {
    let credential = match ctx.vault.credential_for(&ctx.pool, device.id).await? {
        Some(credential) => credential,
        None => {
            debug!("discovery({}): no credential, skipping", device.name);
            return Ok(0);
        }
    };
    let mut session = match ctx.client.connect(&device.ip, &credential).await {
        Ok(session) => session,
        Err(error) => {
            emit_error_sample(ctx, &device, &error);
            return Err(error.into());
        }
    };

    let rows = crate::discovery::walk_interfaces(&mut session).await?;
    crate::discovery::persist_interfaces(&ctx.pool, &device, &rows).await
}

fn emit_error_sample(ctx: &SnmpWorkerCtx, device: &Device, error: &CoreError) {
    ctx.writer.write(
        Sample::new("device_snmp_error", 1.0, Utc::now())
            .with_labels(&device_labels(device))
            .with_label("kind", error.kind.as_str()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_counter_set_matches_required_metrics() {
        let metrics: Vec<&str> = INTERFACE_COUNTERS.iter().map(|(m, _)| *m).collect();
        for required in [
            "interface_if_hc_in_octets",
            "interface_if_hc_out_octets",
            "interface_if_in_errors",
            "interface_if_out_errors",
            "interface_if_in_discards",
            "interface_if_out_discards",
            "interface_if_admin_status",
            "interface_if_oper_status",
        ] {
            assert!(metrics.contains(&required), "missing {}", required);
        }
    }

    #[test]
    fn batch_args_round_trip() {
        let args = SnmpBatchArgs {
            batch_index: 0,
            device_ids: vec![Uuid::new_v4()],
        };
        let value = serde_json::to_value(&args).unwrap();
        let parsed: SnmpBatchArgs = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.device_ids.len(), 1);
    }
}
