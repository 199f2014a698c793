use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "device_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Router,
    Switch,
    Firewall,
    Ap,
    Nvr,
    Server,
    Other,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceType::Router => "router",
            DeviceType::Switch => "switch",
            DeviceType::Firewall => "firewall",
            DeviceType::Ap => "ap",
            DeviceType::Nvr => "nvr",
            DeviceType::Server => "server",
            DeviceType::Other => "other",
        };
        f.write_str(s)
    }
}

/// Severity ordering matters: dedup keeps the highest per device per tick.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "severity", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "item_value_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ItemValueType {
    Counter32,
    Counter64,
    Gauge,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "interface_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Isp,
    Wan,
    Trunk,
    Access,
    Mgmt,
    Loopback,
    Tunnel,
    Virtual,
    Other,
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterfaceType::Isp => "isp",
            InterfaceType::Wan => "wan",
            InterfaceType::Trunk => "trunk",
            InterfaceType::Access => "access",
            InterfaceType::Mgmt => "mgmt",
            InterfaceType::Loopback => "loopback",
            InterfaceType::Tunnel => "tunnel",
            InterfaceType::Virtual => "virtual",
            InterfaceType::Other => "other",
        };
        f.write_str(s)
    }
}

/// A monitored device, joined with its branch for label resolution.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub ip: String,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub device_type: DeviceType,
    pub model: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub enabled: bool,
    pub role: Option<String>,
    pub tags: Vec<String>,
    pub custom_fields: Json<HashMap<String, String>>,
    pub branch_id: Option<Uuid>,
    pub branch: Option<String>,
    pub region: Option<String>,
    // state machine fields
    pub down_since: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub is_flapping: bool,
    pub flap_count: i32,
    pub flapping_since: Option<DateTime<Utc>>,
    pub last_flap_detected: Option<DateTime<Utc>>,
    pub status_change_times: Vec<DateTime<Utc>>,
}

impl Device {
    /// `down_since IS NULL` is the sole source of truth for UP.
    pub fn is_up(&self) -> bool {
        self.down_since.is_none()
    }

    /// ISP uplinks get a lower flap threshold and higher alert severity.
    /// An explicit role wins; the last-octet convention is the fallback for
    /// deployments that encode uplinks in the addressing plan.
    pub fn is_isp_uplink(&self) -> bool {
        if let Some(role) = &self.role {
            return role == "isp-uplink";
        }
        self.ip
            .rsplit('.')
            .next()
            .map(|octet| octet == "5")
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Interface {
    pub device_id: Uuid,
    pub if_index: i32,
    pub if_name: Option<String>,
    pub if_alias: Option<String>,
    pub if_descr: Option<String>,
    pub if_type: Option<i32>,
    pub interface_type: InterfaceType,
    pub admin_status: Option<i32>,
    pub oper_status: Option<i32>,
    pub speed_bps: Option<i64>,
    pub is_critical: bool,
    pub is_isp: bool,
    pub isp_provider: Option<String>,
    pub last_seen: DateTime<Utc>,
}

/// Encrypted credential material as stored; decryption lives in the vault.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CredentialRow {
    pub device_id: Uuid,
    pub version: i16,
    pub community_ciphertext: Option<String>,
    pub security_name: Option<String>,
    pub auth_protocol: Option<String>,
    pub auth_key_ciphertext: Option<String>,
    pub priv_protocol: Option<String>,
    pub priv_key_ciphertext: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MonitoringItem {
    pub id: Uuid,
    pub device_id: Uuid,
    pub name: String,
    pub oid: String,
    pub interval_seconds: i32,
    pub value_type: ItemValueType,
    pub units: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MonitoringTemplate {
    pub id: Uuid,
    pub name: String,
    pub vendor: Option<String>,
    pub device_type: Option<DeviceType>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertRule {
    pub id: Uuid,
    pub name: String,
    pub expression: String,
    pub severity: Severity,
    pub enabled: bool,
    pub cooldown_seconds: i32,
    pub auto_resolve: bool,
    pub applies_to: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertHistory {
    pub id: Uuid,
    pub rule_id: Option<Uuid>,
    pub rule_name: String,
    /// Null for system-scoped alerts (e.g. a missing worker class).
    pub device_id: Option<Uuid>,
    pub severity: Severity,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub context: Json<HashMap<String, String>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatusChange {
    pub device_id: Uuid,
    pub old_status: String,
    pub new_status: String,
    pub changed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(ip: &str, role: Option<&str>) -> Device {
        Device {
            id: Uuid::new_v4(),
            name: "sw1".into(),
            ip: ip.into(),
            hostname: None,
            vendor: None,
            device_type: DeviceType::Switch,
            model: None,
            location: None,
            description: None,
            enabled: true,
            role: role.map(String::from),
            tags: vec![],
            custom_fields: Json(HashMap::new()),
            branch_id: None,
            branch: None,
            region: None,
            down_since: None,
            last_seen: None,
            is_flapping: false,
            flap_count: 0,
            flapping_since: None,
            last_flap_detected: None,
            status_change_times: vec![],
        }
    }

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn isp_uplink_from_role_or_last_octet() {
        assert!(device("192.168.1.5", None).is_isp_uplink());
        assert!(!device("192.168.1.50", None).is_isp_uplink());
        assert!(device("10.0.0.9", Some("isp-uplink")).is_isp_uplink());
        // explicit role overrides the addressing heuristic
        assert!(!device("192.168.1.5", Some("core")).is_isp_uplink());
    }

    #[test]
    fn up_is_derived_from_down_since() {
        let mut d = device("10.0.0.1", None);
        assert!(d.is_up());
        d.down_since = Some(Utc::now());
        assert!(!d.is_up());
    }
}
