use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Error;
use chrono::{Duration as ChronoDuration, Utc};
use log::{info, warn};
use sqlx::PgPool;

use crate::alerts::RULE_WORKER_MISSING;
use crate::config::Config;
use crate::models::Severity;
use crate::store;
use crate::tsdb::{Sample, TsdbReader, TsdbWriter};

/// Cumulative idle-transaction kills for this process.
static IDLE_TX_KILLED: AtomicU64 = AtomicU64::new(0);

const WORKER_CLASSES: &[&str] = &["monitoring", "snmp", "alerts", "maintenance"];

pub struct MaintenanceCtx {
    pub pool: PgPool,
    pub writer: TsdbWriter,
    pub reader: TsdbReader,
    pub config: Arc<Config>,
}

fn chrono_from_std(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero())
}

/// Interface rows not re-confirmed by discovery within the TTL are removed;
/// the per-interface series in the TSDB age out via its retention.
pub async fn cleanup_stale_interfaces(ctx: &MaintenanceCtx) -> Result<(), Error> {
    let cutoff = Utc::now() - chrono_from_std(ctx.config.retention.stale_interfaces);
    let deleted = store::delete_stale_interfaces(&ctx.pool, cutoff).await?;
    info!("housekeeper: deleted {} stale interfaces", deleted);
    emit_deleted(ctx, "interfaces", deleted);

    if deleted > 100 {
        store::vacuum_analyze(&ctx.pool, "interfaces").await?;
    }
    Ok(())
}

/// Resolved alerts and ping diagnostics past retention go away; the weekly
/// deep pass vacuums the affected tables afterwards.
pub async fn cleanup_resolved_alerts(ctx: &MaintenanceCtx, deep: bool) -> Result<(), Error> {
    let now = Utc::now();

    let alert_cutoff = now - chrono_from_std(ctx.config.retention.resolved_alerts);
    let alerts_deleted = store::delete_resolved_alerts(&ctx.pool, alert_cutoff).await?;
    emit_deleted(ctx, "alert_history", alerts_deleted);

    let ping_cutoff = now - chrono_from_std(ctx.config.retention.ping_results);
    let pings_deleted = store::delete_old_ping_results(&ctx.pool, ping_cutoff).await?;
    emit_deleted(ctx, "ping_results", pings_deleted);

    info!(
        "housekeeper: deleted {} resolved alerts, {} ping results (deep={})",
        alerts_deleted, pings_deleted, deep
    );

    if deep {
        store::vacuum_analyze(&ctx.pool, "alert_history").await?;
        store::vacuum_analyze(&ctx.pool, "ping_results").await?;
    }
    Ok(())
}

/// Kills backends idle in transaction beyond the allowed age and advances
/// the kill counter metric.
pub async fn vacuum_idle_transactions(ctx: &MaintenanceCtx) -> Result<(), Error> {
    let killed = store::kill_idle_transactions(&ctx.pool, ctx.config.idle_tx_max).await?;
    if killed > 0 {
        warn!("housekeeper: terminated {} idle transactions", killed);
    }
    let total = IDLE_TX_KILLED.fetch_add(killed, Ordering::Relaxed) + killed;
    ctx.writer
        .write(Sample::new("db_idle_tx_killed_total", total as f64, Utc::now()));
    Ok(())
}

/// A worker class with no heartbeat for more than twice the heartbeat
/// period is declared missing; recovery resolves the alert.
pub async fn check_worker_health(ctx: &MaintenanceCtx) -> Result<(), Error> {
    let window = ctx.config.cadence.worker_health_period * 2;
    let query = format!(
        "count by (worker_class) (count_over_time(worker_heartbeat[{}s]))",
        window
    );
    let now = Utc::now();

    let alive: Vec<String> = match ctx.reader.query_instant(&query).await {
        Ok(series) => series
            .into_iter()
            .filter_map(|(labels, _)| labels.get("worker_class").cloned())
            .collect(),
        Err(error) => {
            // without the TSDB there is no evidence either way; do not page
            warn!("housekeeper: heartbeat query failed: {:#}", error);
            return Ok(());
        }
    };

    for class in WORKER_CLASSES {
        let rule_name = format!("{}: {}", RULE_WORKER_MISSING, class);
        if alive.iter().any(|c| c == class) {
            if store::resolve_system_alert(&ctx.pool, &rule_name, now).await? {
                info!("housekeeper: worker class {} is back", class);
            }
        } else {
            let mut context = std::collections::HashMap::new();
            context.insert("worker_class".to_string(), (*class).to_string());
            if store::open_alert(
                &ctx.pool,
                None,
                &rule_name,
                None,
                Severity::High,
                now,
                &context,
            )
            .await?
            {
                warn!("housekeeper: worker class {} has gone quiet", class);
            }
        }
    }
    Ok(())
}

fn emit_deleted(ctx: &MaintenanceCtx, table: &str, deleted: u64) {
    if deleted > 0 {
        ctx.writer.write(
            Sample::new("housekeeping_deleted_rows", deleted as f64, Utc::now())
                .with_label("table", table),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_partition_has_a_heartbeat_class() {
        for partition in ["monitoring", "snmp", "alerts", "maintenance"] {
            assert!(WORKER_CLASSES.contains(&partition));
        }
    }
}
