use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Error};
use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgConnection, PgPool};
use uuid::Uuid;

use crate::models::{
    AlertHistory, AlertRule, Device, Interface, MonitoringItem, MonitoringTemplate, Severity,
};
use crate::state::StateFields;

const DEVICE_COLUMNS: &str = "d.id, d.name, d.ip, d.hostname, d.vendor, d.device_type, d.model, \
     d.location, d.description, d.enabled, d.role, d.tags, d.custom_fields, d.branch_id, \
     b.name AS branch, b.region AS region, \
     d.down_since, d.last_seen, d.is_flapping, d.flap_count, d.flapping_since, \
     d.last_flap_detected, d.status_change_times";

/// One pool per worker process, capped well under the server's limit;
/// connections go back to the pool the moment a query ends.
pub async fn connect(db_url: &str, max_connections: u32) -> Result<PgPool, Error> {
    let options: PgConnectOptions = db_url
        .parse::<PgConnectOptions>()
        .context("DB_URL is not a valid postgres url")?
        .log_statements(log::LevelFilter::Trace);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(60))
        .connect_with(options)
        .await
        .context("could not connect to the relational store")?;

    debug!("store: pool ready (max {} connections)", max_connections);
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), Error> {
    info!("store: running migrations");
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("migrations failed")?;
    Ok(())
}

// --- devices -------------------------------------------------------------

pub async fn count_enabled_devices(pool: &PgPool) -> Result<i64, Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM devices WHERE enabled")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn enabled_device_ids(pool: &PgPool) -> Result<Vec<Uuid>, Error> {
    let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM devices WHERE enabled ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn devices_by_ids(pool: &PgPool, ids: &[Uuid]) -> Result<Vec<Device>, Error> {
    let query = format!(
        "SELECT {} FROM devices d LEFT JOIN branches b ON b.id = d.branch_id \
         WHERE d.id = ANY($1) AND d.enabled",
        DEVICE_COLUMNS
    );
    Ok(sqlx::query_as(&query).bind(ids).fetch_all(pool).await?)
}

pub async fn all_enabled_devices(pool: &PgPool) -> Result<Vec<Device>, Error> {
    let query = format!(
        "SELECT {} FROM devices d LEFT JOIN branches b ON b.id = d.branch_id WHERE d.enabled",
        DEVICE_COLUMNS
    );
    Ok(sqlx::query_as(&query).fetch_all(pool).await?)
}

pub async fn set_device_vendor(pool: &PgPool, device_id: Uuid, vendor: &str) -> Result<(), Error> {
    sqlx::query("UPDATE devices SET vendor = $2 WHERE id = $1")
        .bind(device_id)
        .bind(vendor)
        .execute(pool)
        .await?;
    Ok(())
}

// --- state machine persistence ------------------------------------------

/// Serializes all state reads and writes for one device behind a row lock.
pub async fn lock_device_state(
    conn: &mut PgConnection,
    device_id: Uuid,
) -> Result<Option<StateFields>, Error> {
    let row: Option<(
        Option<DateTime<Utc>>,
        bool,
        i32,
        Option<DateTime<Utc>>,
        Option<DateTime<Utc>>,
        Vec<DateTime<Utc>>,
    )> = sqlx::query_as(
        "SELECT down_since, is_flapping, flap_count, flapping_since, last_flap_detected, \
                status_change_times \
         FROM devices WHERE id = $1 FOR UPDATE",
    )
    .bind(device_id)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(
        |(down_since, is_flapping, flap_count, flapping_since, last_flap_detected, times)| {
            StateFields {
                down_since,
                is_flapping,
                flap_count,
                flapping_since,
                last_flap_detected,
                status_change_times: times,
            }
        },
    ))
}

pub async fn save_device_state(
    conn: &mut PgConnection,
    device_id: Uuid,
    fields: &StateFields,
    last_seen: Option<DateTime<Utc>>,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE devices SET down_since = $2, is_flapping = $3, flap_count = $4, \
                flapping_since = $5, last_flap_detected = $6, status_change_times = $7, \
                last_seen = COALESCE($8, last_seen) \
         WHERE id = $1",
    )
    .bind(device_id)
    .bind(fields.down_since)
    .bind(fields.is_flapping)
    .bind(fields.flap_count)
    .bind(fields.flapping_since)
    .bind(fields.last_flap_detected)
    .bind(&fields.status_change_times)
    .bind(last_seen)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_status_change(
    conn: &mut PgConnection,
    device_id: Uuid,
    old_status: &str,
    new_status: &str,
    changed_at: DateTime<Utc>,
) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO status_changes (device_id, old_status, new_status, changed_at) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(device_id)
    .bind(old_status)
    .bind(new_status)
    .bind(changed_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn insert_ping_result(
    conn: &mut PgConnection,
    device_id: Uuid,
    reachable: bool,
    avg_rtt_ms: Option<f64>,
    loss_ratio: f64,
    measured_at: DateTime<Utc>,
) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO ping_results (device_id, reachable, avg_rtt_ms, loss_ratio, measured_at) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(device_id)
    .bind(reachable)
    .bind(avg_rtt_ms)
    .bind(loss_ratio)
    .bind(measured_at)
    .execute(conn)
    .await?;
    Ok(())
}

// --- monitoring items and templates -------------------------------------

pub async fn active_items(pool: &PgPool, device_id: Uuid) -> Result<Vec<MonitoringItem>, Error> {
    Ok(sqlx::query_as(
        "SELECT id, device_id, name, oid, interval_seconds, value_type, units, enabled \
         FROM monitoring_items WHERE device_id = $1 AND enabled",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await?)
}

pub async fn template_for(
    pool: &PgPool,
    vendor: &str,
    device_type: &str,
) -> Result<Option<MonitoringTemplate>, Error> {
    Ok(sqlx::query_as(
        "SELECT id, name, vendor, device_type FROM monitoring_templates \
         WHERE lower(vendor) = lower($1) \
         ORDER BY (device_type::text = $2) DESC NULLS LAST LIMIT 1",
    )
    .bind(vendor)
    .bind(device_type)
    .fetch_optional(pool)
    .await?)
}

/// Instantiates a template's items for a device; replays are no-ops.
pub async fn apply_template(
    pool: &PgPool,
    device_id: Uuid,
    template_id: Uuid,
) -> Result<u64, Error> {
    let result = sqlx::query(
        "INSERT INTO monitoring_items \
             (device_id, name, oid, interval_seconds, value_type, units, enabled) \
         SELECT $1, name, oid, interval_seconds, value_type, units, enabled \
         FROM template_items WHERE template_id = $2 \
         ON CONFLICT (device_id, oid) DO NOTHING",
    )
    .bind(device_id)
    .bind(template_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

// --- interfaces ----------------------------------------------------------

pub async fn monitored_interfaces(pool: &PgPool, device_id: Uuid) -> Result<Vec<Interface>, Error> {
    Ok(sqlx::query_as(
        "SELECT device_id, if_index, if_name, if_alias, if_descr, if_type, interface_type, \
                admin_status, oper_status, speed_bps, is_critical, is_isp, isp_provider, last_seen \
         FROM interfaces WHERE device_id = $1 AND (is_critical OR is_isp)",
    )
    .bind(device_id)
    .fetch_all(pool)
    .await?)
}

pub async fn upsert_interface(pool: &PgPool, iface: &Interface) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO interfaces \
             (device_id, if_index, if_name, if_alias, if_descr, if_type, interface_type, \
              admin_status, oper_status, speed_bps, is_critical, is_isp, isp_provider, last_seen) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
         ON CONFLICT (device_id, if_index) DO UPDATE SET \
             if_name = EXCLUDED.if_name, if_alias = EXCLUDED.if_alias, \
             if_descr = EXCLUDED.if_descr, if_type = EXCLUDED.if_type, \
             interface_type = EXCLUDED.interface_type, admin_status = EXCLUDED.admin_status, \
             oper_status = EXCLUDED.oper_status, speed_bps = EXCLUDED.speed_bps, \
             is_critical = EXCLUDED.is_critical, is_isp = EXCLUDED.is_isp, \
             isp_provider = EXCLUDED.isp_provider, last_seen = EXCLUDED.last_seen",
    )
    .bind(iface.device_id)
    .bind(iface.if_index)
    .bind(&iface.if_name)
    .bind(&iface.if_alias)
    .bind(&iface.if_descr)
    .bind(iface.if_type)
    .bind(iface.interface_type)
    .bind(iface.admin_status)
    .bind(iface.oper_status)
    .bind(iface.speed_bps)
    .bind(iface.is_critical)
    .bind(iface.is_isp)
    .bind(&iface.isp_provider)
    .bind(iface.last_seen)
    .execute(pool)
    .await?;
    Ok(())
}

// --- alert rules and history ---------------------------------------------

pub async fn enabled_alert_rules(pool: &PgPool) -> Result<Vec<AlertRule>, Error> {
    Ok(sqlx::query_as(
        "SELECT id, name, expression, severity, enabled, cooldown_seconds, auto_resolve, \
                applies_to \
         FROM alert_rules WHERE enabled",
    )
    .fetch_all(pool)
    .await?)
}

pub async fn open_alerts(pool: &PgPool) -> Result<Vec<AlertHistory>, Error> {
    Ok(sqlx::query_as(
        "SELECT id, rule_id, rule_name, device_id, severity, triggered_at, resolved_at, context \
         FROM alert_history WHERE resolved_at IS NULL",
    )
    .fetch_all(pool)
    .await?)
}

/// Opens an alert unless one is already open for `(device, rule_name)`;
/// the partial unique index makes replays a no-op.
pub async fn open_alert(
    pool: &PgPool,
    rule_id: Option<Uuid>,
    rule_name: &str,
    device_id: Option<Uuid>,
    severity: Severity,
    triggered_at: DateTime<Utc>,
    context: &HashMap<String, String>,
) -> Result<bool, Error> {
    let query = if device_id.is_some() {
        "INSERT INTO alert_history (rule_id, rule_name, device_id, severity, triggered_at, context) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (device_id, rule_name) WHERE resolved_at IS NULL AND device_id IS NOT NULL \
         DO NOTHING"
    } else {
        "INSERT INTO alert_history (rule_id, rule_name, device_id, severity, triggered_at, context) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (rule_name) WHERE resolved_at IS NULL AND device_id IS NULL \
         DO NOTHING"
    };
    let result = sqlx::query(query)
        .bind(rule_id)
        .bind(rule_name)
        .bind(device_id)
        .bind(severity)
        .bind(triggered_at)
        .bind(sqlx::types::Json(context))
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Records an informational event as an already-resolved alert row.
pub async fn insert_resolved_event(
    pool: &PgPool,
    rule_name: &str,
    device_id: Uuid,
    severity: Severity,
    at: DateTime<Utc>,
) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO alert_history (rule_name, device_id, severity, triggered_at, resolved_at) \
         VALUES ($1, $2, $3, $4, $4)",
    )
    .bind(rule_name)
    .bind(device_id)
    .bind(severity)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Resolves the open system-scoped alert with this name, if any.
pub async fn resolve_system_alert(
    pool: &PgPool,
    rule_name: &str,
    resolved_at: DateTime<Utc>,
) -> Result<bool, Error> {
    let result = sqlx::query(
        "UPDATE alert_history SET resolved_at = $2 \
         WHERE device_id IS NULL AND rule_name = $1 AND resolved_at IS NULL",
    )
    .bind(rule_name)
    .bind(resolved_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn resolve_alert(
    pool: &PgPool,
    alert_id: Uuid,
    resolved_at: DateTime<Utc>,
    reason: Option<&str>,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE alert_history SET resolved_at = $2, \
                context = CASE WHEN $3::text IS NULL THEN context \
                               ELSE context || jsonb_build_object('resolution', $3::text) END \
         WHERE id = $1 AND resolved_at IS NULL",
    )
    .bind(alert_id)
    .bind(resolved_at)
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(())
}

/// Resolves the open alert for `(device, rule_name)`, if any.
pub async fn resolve_alert_by_name(
    pool: &PgPool,
    device_id: Uuid,
    rule_name: &str,
    resolved_at: DateTime<Utc>,
) -> Result<bool, Error> {
    let result = sqlx::query(
        "UPDATE alert_history SET resolved_at = $3 \
         WHERE device_id = $1 AND rule_name = $2 AND resolved_at IS NULL",
    )
    .bind(device_id)
    .bind(rule_name)
    .bind(resolved_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Most recent resolution time for the cooldown check.
pub async fn last_resolved_at(
    pool: &PgPool,
    device_id: Uuid,
    rule_name: &str,
) -> Result<Option<DateTime<Utc>>, Error> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        "SELECT resolved_at FROM alert_history \
         WHERE device_id = $1 AND rule_name = $2 AND resolved_at IS NOT NULL \
         ORDER BY resolved_at DESC LIMIT 1",
    )
    .bind(device_id)
    .bind(rule_name)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(at,)| at))
}

// --- housekeeping --------------------------------------------------------

pub async fn delete_stale_interfaces(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64, Error> {
    let result = sqlx::query("DELETE FROM interfaces WHERE last_seen < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_resolved_alerts(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64, Error> {
    let result = sqlx::query("DELETE FROM alert_history WHERE resolved_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_old_ping_results(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64, Error> {
    let result = sqlx::query("DELETE FROM ping_results WHERE measured_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn vacuum_analyze(pool: &PgPool, table: &str) -> Result<(), Error> {
    // VACUUM cannot be parameterized; the table name comes from a fixed
    // internal list, never from input
    sqlx::query(&format!("VACUUM (ANALYZE) {}", table))
        .execute(pool)
        .await?;
    Ok(())
}

/// Terminates backends idle in transaction beyond the allowed age.
/// Returns the number of backends killed.
pub async fn kill_idle_transactions(pool: &PgPool, max_idle: Duration) -> Result<u64, Error> {
    let rows: Vec<(i32,)> = sqlx::query_as(
        "SELECT pid FROM pg_stat_activity \
         WHERE state = 'idle in transaction' \
           AND xact_start < now() - $1::interval \
           AND pid <> pg_backend_pid()",
    )
    .bind(format!("{} seconds", max_idle.as_secs()))
    .fetch_all(pool)
    .await?;

    let mut killed = 0;
    for (pid,) in rows {
        let (terminated,): (bool,) = sqlx::query_as("SELECT pg_terminate_backend($1)")
            .bind(pid)
            .fetch_one(pool)
            .await?;
        if terminated {
            killed += 1;
        }
    }
    Ok(killed)
}
