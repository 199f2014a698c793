use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Error};
use log::debug;

/// Tick periods for the scheduler, all in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Cadence {
    pub ping_period: u64,
    pub snmp_period: u64,
    pub alert_period: u64,
    pub discovery_period: u64,
    pub interface_cleanup_period: u64,
    pub alert_cleanup_period: u64,
    pub worker_health_period: u64,
    pub idle_tx_period: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IcmpSettings {
    pub count: u32,
    pub timeout: Duration,
    pub interval: Duration,
    pub fanout: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnmpSettings {
    pub timeout: Duration,
    pub retries: u32,
    pub fanout: usize,
    pub max_repetitions: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlapSettings {
    pub window: Duration,
    pub threshold: u32,
    pub clear_window: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Retention {
    pub ping_results: Duration,
    pub stale_interfaces: Duration,
    pub resolved_alerts: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokioRuntime {
    MultiThread { worker_threads: Option<usize> },
    CurrentThread,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokioSettings {
    pub runtime: TokioRuntime,
    pub console: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub tsdb_url: String,
    pub vault_key: String,
    pub cadence: Cadence,
    pub icmp: IcmpSettings,
    pub snmp: SnmpSettings,
    pub flap: FlapSettings,
    pub retention: Retention,
    pub queue_high_water: i64,
    pub max_tasks_per_child: u64,
    pub db_max_connections: u32,
    pub idle_tx_max: Duration,
    pub recovery_events_enabled: bool,
    pub tokio: TokioSettings,
}

impl Config {
    /// Batch deadline for a worker task, derived from the driving period.
    pub fn batch_timeout(&self, period_seconds: u64) -> Duration {
        Duration::from_secs(period_seconds.saturating_sub(5).max(1))
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, Error>
where
    <T as FromStr>::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool, Error> {
    match env::var(name) {
        Ok(raw) => match raw.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => bail!("invalid {}={:?}: expected a boolean", name, raw),
        },
        Err(_) => Ok(default),
    }
}

pub fn from_env() -> Result<Config, Error> {
    debug!("config: loading from environment");

    let db_url = env::var("DB_URL").context("DB_URL must be set")?;
    // the durable queue lives in the relational store; QUEUE_URL is
    // recognized for compatibility and defaults to DB_URL
    let _queue_url = env::var("QUEUE_URL").unwrap_or_else(|_| db_url.clone());
    let tsdb_url = env::var("TSDB_URL").context("TSDB_URL must be set")?;
    let vault_key = env::var("VAULT_KEY").context("VAULT_KEY must be set")?;

    let cadence = Cadence {
        ping_period: env_or("PING_PERIOD_SECONDS", 30)?,
        snmp_period: env_or("SNMP_PERIOD_SECONDS", 60)?,
        alert_period: env_or("ALERT_PERIOD_SECONDS", 30)?,
        discovery_period: env_or("DISCOVERY_PERIOD_SECONDS", 3600)?,
        interface_cleanup_period: env_or("INTERFACE_CLEANUP_PERIOD_SECONDS", 86_400)?,
        alert_cleanup_period: env_or("ALERT_CLEANUP_PERIOD_SECONDS", 86_400)?,
        worker_health_period: env_or("WORKER_HEALTH_PERIOD_SECONDS", 300)?,
        idle_tx_period: env_or("IDLE_TX_PERIOD_SECONDS", 300)?,
    };

    let icmp = IcmpSettings {
        count: env_or("ICMP_COUNT", 3)?,
        timeout: Duration::from_millis(env_or("ICMP_TIMEOUT_MS", 1000)?),
        interval: Duration::from_millis(env_or("ICMP_INTERVAL_MS", 200)?),
        fanout: env_or("ICMP_FANOUT", 50)?,
    };

    let snmp = SnmpSettings {
        timeout: Duration::from_secs(env_or("SNMP_TIMEOUT_SECONDS", 5)?),
        retries: env_or("SNMP_RETRIES", 3)?,
        fanout: env_or("SNMP_FANOUT", 50)?,
        max_repetitions: env_or("SNMP_MAX_REPETITIONS", 20)?,
    };

    let flap = FlapSettings {
        window: Duration::from_secs(env_or("FLAP_WINDOW_SECONDS", 300)?),
        threshold: env_or("FLAP_THRESHOLD", 3)?,
        clear_window: Duration::from_secs(env_or("FLAP_CLEAR_SECONDS", 900)?),
    };

    let retention = Retention {
        ping_results: Duration::from_secs(env_or("PING_RETENTION_DAYS", 30u64)? * 86_400),
        stale_interfaces: Duration::from_secs(env_or("STALE_INTERFACE_TTL_DAYS", 7u64)? * 86_400),
        resolved_alerts: Duration::from_secs(env_or("ALERT_RETENTION_DAYS", 7u64)? * 86_400),
    };

    let runtime = match env::var("TOKIO_RUNTIME").as_deref() {
        Ok("current_thread") => TokioRuntime::CurrentThread,
        Ok("multi_thread") | Err(_) => TokioRuntime::MultiThread {
            worker_threads: match env::var("TOKIO_WORKER_THREADS") {
                Ok(raw) => Some(
                    raw.parse()
                        .map_err(|e| anyhow::anyhow!("invalid TOKIO_WORKER_THREADS: {}", e))?,
                ),
                Err(_) => None,
            },
        },
        Ok(other) => bail!("invalid TOKIO_RUNTIME={:?}", other),
    };

    let config = Config {
        db_url,
        tsdb_url,
        vault_key,
        cadence,
        icmp,
        snmp,
        flap,
        retention,
        queue_high_water: env_or("QUEUE_HIGH_WATER", 1000)?,
        max_tasks_per_child: env_or("MAX_TASKS_PER_CHILD", 1000)?,
        db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
        idle_tx_max: Duration::from_secs(env_or("IDLE_TX_MAX_SECONDS", 60)?),
        recovery_events_enabled: env_bool("RECOVERY_EVENTS_ENABLED", false)?,
        tokio: TokioSettings {
            runtime,
            console: env_bool("TOKIO_CONSOLE", false)?,
        },
    };

    debug!("config: loaded {:?}", config.cadence);
    Ok(config)
}

/// Sanity checks beyond parse errors, run by `config-test` and at startup.
pub fn validate(config: &Config) -> Result<(), Error> {
    if config.icmp.count == 0 {
        bail!("ICMP_COUNT must be at least 1");
    }
    if config.icmp.fanout == 0 || config.snmp.fanout == 0 {
        bail!("fanout must be at least 1");
    }
    if config.flap.threshold < 2 {
        bail!("FLAP_THRESHOLD below 2 would flag every transition as flapping");
    }
    if config.db_max_connections > 20 {
        bail!(
            "DB_MAX_CONNECTIONS={} exceeds the per-process cap of 20",
            config.db_max_connections
        );
    }
    if config.cadence.ping_period < 10 {
        bail!("PING_PERIOD_SECONDS below 10 leaves no headroom for a batch");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_required_env() {
        env::set_var("DB_URL", "postgres://localhost/wardflux");
        env::set_var("TSDB_URL", "http://localhost:8428");
        env::set_var("VAULT_KEY", "0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn defaults_match_documented_values() {
        set_required_env();

        let config = from_env().unwrap();
        assert_eq!(config.cadence.ping_period, 30);
        assert_eq!(config.cadence.snmp_period, 60);
        assert_eq!(config.icmp.count, 3);
        assert_eq!(config.icmp.timeout, Duration::from_millis(1000));
        assert_eq!(config.snmp.retries, 3);
        assert_eq!(config.flap.threshold, 3);
        assert_eq!(config.flap.window, Duration::from_secs(300));
        assert!(!config.recovery_events_enabled);
        validate(&config).unwrap();
    }

    #[test]
    fn batch_timeout_leaves_headroom() {
        set_required_env();

        let config = from_env().unwrap();
        assert_eq!(config.batch_timeout(30), Duration::from_secs(25));
        // never collapses to zero for very short periods
        assert_eq!(config.batch_timeout(3), Duration::from_secs(1));
    }
}
