use std::collections::BTreeMap;

use anyhow::Error;
use chrono::Utc;
use log::{debug, info, warn};
use sqlx::PgPool;

use crate::models::{Device, Interface, InterfaceType};
use crate::snmp::{oids, DeviceSession, SnmpValue};
use crate::store;

/// Raw ifTable/ifXTable row, merged across column walks by ifIndex.
#[derive(Debug, Clone, Default)]
pub struct RawInterface {
    pub if_index: i32,
    pub if_descr: Option<String>,
    pub if_name: Option<String>,
    pub if_alias: Option<String>,
    pub if_type: Option<i32>,
    pub admin_status: Option<i32>,
    pub oper_status: Option<i32>,
    /// ifSpeed, bits per second.
    pub if_speed: Option<i64>,
    /// ifHighSpeed, megabits per second; takes precedence when non-zero.
    pub if_high_speed: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub interface_type: InterfaceType,
    pub isp_provider: Option<String>,
    pub is_isp: bool,
    pub is_critical: bool,
    pub speed_bps: Option<i64>,
}

// IANAifType values the rules table keys on.
const IFTYPE_LOOPBACK: i32 = 24;
const IFTYPE_TUNNEL: i32 = 131;
const IFTYPE_PROP_VIRTUAL: i32 = 53;
const IFTYPE_L2_VLAN: i32 = 135;
const IFTYPE_L3_VLAN: i32 = 136;

const GBPS: i64 = 1_000_000_000;

/// Known upstream providers, matched case-insensitively against ifAlias.
const ISP_PROVIDERS: &[(&str, &str)] = &[
    ("magti", "Magti"),
    ("silknet", "Silknet"),
    ("caucasus", "Caucasus Online"),
    ("beeline", "Beeline"),
    ("veon", "Beeline"),
    ("skytel", "Skytel"),
    ("datacom", "Datacom"),
    ("akado", "Akado"),
];

const WAN_KEYWORDS: &[&str] = &["wan", "internet", "outside", "external"];
const MGMT_KEYWORDS: &[&str] = &["mgmt", "management", "oob"];
const TRUNK_KEYWORDS: &[&str] = &["trunk", "port-channel", "po", "ae", "bond", "lag"];
const CRITICAL_KEYWORDS: &[&str] = &["critical", "core", "uplink", "backbone"];

fn contains_keyword(haystack: &str, keywords: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    keywords.iter().any(|kw| {
        if kw.len() <= 2 {
            // short tokens like "po"/"ae" only match as a name prefix
            lower.starts_with(kw)
                && lower[kw.len()..]
                    .chars()
                    .next()
                    .map(|c| c.is_ascii_digit())
                    .unwrap_or(false)
        } else {
            lower.contains(kw)
        }
    })
}

pub fn match_isp_provider(alias: &str) -> Option<String> {
    let lower = alias.to_lowercase();
    ISP_PROVIDERS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, name)| (*name).to_string())
}

/// Deterministic rules table over ifType, name patterns and alias keywords.
pub fn classify(raw: &RawInterface) -> Classified {
    let name = raw.if_name.as_deref().unwrap_or("");
    let alias = raw.if_alias.as_deref().unwrap_or("");
    let descr = raw.if_descr.as_deref().unwrap_or("");
    let name_and_alias = format!("{} {} {}", name, alias, descr);

    let isp_provider = match_isp_provider(alias).or_else(|| match_isp_provider(descr));
    let alias_says_isp = isp_provider.is_some() || name_and_alias.to_lowercase().contains("isp");

    let interface_type = if alias_says_isp {
        InterfaceType::Isp
    } else if contains_keyword(&name_and_alias, WAN_KEYWORDS) {
        InterfaceType::Wan
    } else if raw.if_type == Some(IFTYPE_LOOPBACK) || name.to_lowercase().starts_with("lo") {
        InterfaceType::Loopback
    } else if raw.if_type == Some(IFTYPE_TUNNEL) || name.to_lowercase().starts_with("tun") {
        InterfaceType::Tunnel
    } else if matches!(
        raw.if_type,
        Some(IFTYPE_PROP_VIRTUAL) | Some(IFTYPE_L2_VLAN) | Some(IFTYPE_L3_VLAN)
    ) || name.to_lowercase().starts_with("vlan")
    {
        InterfaceType::Virtual
    } else if contains_keyword(&name_and_alias, MGMT_KEYWORDS) {
        InterfaceType::Mgmt
    } else if contains_keyword(name, TRUNK_KEYWORDS) || contains_keyword(alias, TRUNK_KEYWORDS) {
        InterfaceType::Trunk
    } else if raw.if_type == Some(6) {
        InterfaceType::Access
    } else {
        InterfaceType::Other
    };

    // ifHighSpeed (Mbps) wins over ifSpeed when non-zero
    let speed_bps = match raw.if_high_speed {
        Some(mbps) if mbps > 0 => Some(mbps * 1_000_000),
        _ => raw.if_speed.filter(|bps| *bps > 0),
    };

    let is_isp = interface_type == InterfaceType::Isp;
    let fast_trunk =
        interface_type == InterfaceType::Trunk && speed_bps.map(|s| s >= GBPS).unwrap_or(false);
    let is_critical =
        is_isp || contains_keyword(&name_and_alias, CRITICAL_KEYWORDS) || fast_trunk;

    Classified {
        interface_type,
        isp_provider: if is_isp { isp_provider } else { None },
        is_isp,
        is_critical,
        speed_bps,
    }
}

/// Maps sysObjectID enterprise numbers (then sysDescr keywords) to a vendor.
pub fn classify_vendor(sys_descr: &str, sys_object_id: &str) -> Option<&'static str> {
    const ENTERPRISES: &[(&str, &str)] = &[
        ("1.3.6.1.4.1.9.", "cisco"),
        ("1.3.6.1.4.1.2011.", "huawei"),
        ("1.3.6.1.4.1.2636.", "juniper"),
        ("1.3.6.1.4.1.14988.", "mikrotik"),
        ("1.3.6.1.4.1.11.", "hpe"),
        ("1.3.6.1.4.1.25506.", "hpe"),
        ("1.3.6.1.4.1.12356.", "fortinet"),
        ("1.3.6.1.4.1.41112.", "ubiquiti"),
        ("1.3.6.1.4.1.39165.", "hikvision"),
    ];
    for (prefix, vendor) in ENTERPRISES {
        if sys_object_id.starts_with(prefix) || sys_object_id == prefix.trim_end_matches('.') {
            return Some(vendor);
        }
    }

    const KEYWORDS: &[(&str, &str)] = &[
        ("cisco", "cisco"),
        ("huawei", "huawei"),
        ("juniper", "juniper"),
        ("junos", "juniper"),
        ("mikrotik", "mikrotik"),
        ("routeros", "mikrotik"),
        ("comware", "hpe"),
        ("procurve", "hpe"),
        ("aruba", "hpe"),
        ("fortigate", "fortinet"),
        ("fortinet", "fortinet"),
        ("ubiquiti", "ubiquiti"),
        ("edgeos", "ubiquiti"),
        ("hikvision", "hikvision"),
        ("dahua", "dahua"),
    ];
    let lower = sys_descr.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, vendor)| *vendor)
}

fn column_i32(rows: &[(Vec<u64>, SnmpValue)], out: &mut BTreeMap<i32, RawInterface>, set: fn(&mut RawInterface, i32)) {
    for (suffix, value) in rows {
        if let (Some(index), Some(v)) = (suffix.first(), value.as_i64()) {
            let entry = out.entry(*index as i32).or_default();
            entry.if_index = *index as i32;
            set(entry, v as i32);
        }
    }
}

fn column_i64(rows: &[(Vec<u64>, SnmpValue)], out: &mut BTreeMap<i32, RawInterface>, set: fn(&mut RawInterface, i64)) {
    for (suffix, value) in rows {
        if let (Some(index), Some(v)) = (suffix.first(), value.as_i64()) {
            let entry = out.entry(*index as i32).or_default();
            entry.if_index = *index as i32;
            set(entry, v);
        }
    }
}

fn column_str(rows: &[(Vec<u64>, SnmpValue)], out: &mut BTreeMap<i32, RawInterface>, set: fn(&mut RawInterface, String)) {
    for (suffix, value) in rows {
        if let (Some(index), Some(v)) = (suffix.first(), value.as_str()) {
            let entry = out.entry(*index as i32).or_default();
            entry.if_index = *index as i32;
            set(entry, v.to_string());
        }
    }
}

/// Walks the interface tables of one device and merges the columns by
/// ifIndex (names and values are zipped by index, not by row position, so
/// sparse tables stay aligned).
pub async fn walk_interfaces(session: &mut DeviceSession) -> Result<Vec<RawInterface>, Error> {
    let mut merged: BTreeMap<i32, RawInterface> = BTreeMap::new();

    column_str(&session.bulkwalk(oids::IF_DESCR).await?, &mut merged, |r, v| {
        r.if_descr = Some(v)
    });
    column_str(&session.bulkwalk(oids::IF_NAME).await?, &mut merged, |r, v| {
        r.if_name = Some(v)
    });
    column_str(&session.bulkwalk(oids::IF_ALIAS).await?, &mut merged, |r, v| {
        r.if_alias = Some(v)
    });
    column_i32(&session.bulkwalk(oids::IF_TYPE).await?, &mut merged, |r, v| {
        r.if_type = Some(v)
    });
    column_i32(
        &session.bulkwalk(oids::IF_ADMIN_STATUS).await?,
        &mut merged,
        |r, v| r.admin_status = Some(v),
    );
    column_i32(
        &session.bulkwalk(oids::IF_OPER_STATUS).await?,
        &mut merged,
        |r, v| r.oper_status = Some(v),
    );
    column_i64(&session.bulkwalk(oids::IF_SPEED).await?, &mut merged, |r, v| {
        r.if_speed = Some(v)
    });
    column_i64(
        &session.bulkwalk(oids::IF_HIGH_SPEED).await?,
        &mut merged,
        |r, v| r.if_high_speed = Some(v),
    );

    Ok(merged.into_values().collect())
}

/// Classifies and upserts every discovered row; returns the row count.
/// Re-running discovery for the same device is equivalent to one run.
pub async fn persist_interfaces(
    pool: &PgPool,
    device: &Device,
    raw_rows: &[RawInterface],
) -> Result<usize, Error> {
    let now = Utc::now();
    let mut stored = 0;

    for raw in raw_rows {
        let classified = classify(raw);
        let iface = Interface {
            device_id: device.id,
            if_index: raw.if_index,
            if_name: raw.if_name.clone(),
            if_alias: raw.if_alias.clone(),
            if_descr: raw.if_descr.clone(),
            if_type: raw.if_type,
            interface_type: classified.interface_type,
            admin_status: raw.admin_status,
            oper_status: raw.oper_status,
            speed_bps: classified.speed_bps,
            is_critical: classified.is_critical,
            is_isp: classified.is_isp,
            isp_provider: classified.isp_provider.clone(),
            last_seen: now,
        };
        if let Err(error) = store::upsert_interface(pool, &iface).await {
            warn!(
                "discovery({}): upsert ifIndex {} failed: {:#}",
                device.ip, raw.if_index, error
            );
        } else {
            stored += 1;
        }
    }

    if stored > 0 {
        info!(
            "discovery({}): stored {} interfaces",
            device.ip, stored
        );
    } else {
        debug!("discovery({}): no interfaces stored", device.ip);
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str, alias: &str, if_type: i32, high_speed_mbps: i64) -> RawInterface {
        RawInterface {
            if_index: 1,
            if_descr: Some(name.to_string()),
            if_name: Some(name.to_string()),
            if_alias: Some(alias.to_string()),
            if_type: Some(if_type),
            admin_status: Some(1),
            oper_status: Some(1),
            if_speed: Some(4_294_967_295),
            if_high_speed: Some(high_speed_mbps),
        }
    }

    #[test]
    fn isp_uplink_with_known_provider() {
        let classified = classify(&raw("GigabitEthernet0/1", "MAGTI-ISP-UPLINK", 6, 1000));
        assert_eq!(classified.interface_type, InterfaceType::Isp);
        assert_eq!(classified.isp_provider.as_deref(), Some("Magti"));
        assert!(classified.is_isp);
        assert!(classified.is_critical);
        assert_eq!(classified.speed_bps, Some(1_000_000_000));
    }

    #[test]
    fn unknown_provider_is_null_but_still_isp() {
        let classified = classify(&raw("Gi0/2", "SOMEISP uplink", 6, 100));
        assert_eq!(classified.interface_type, InterfaceType::Isp);
        assert_eq!(classified.isp_provider, None);
        assert!(classified.is_isp);
    }

    #[test]
    fn loopback_and_vlan_types() {
        let lo = classify(&raw("Loopback0", "", IFTYPE_LOOPBACK, 0));
        assert_eq!(lo.interface_type, InterfaceType::Loopback);
        assert!(!lo.is_critical);

        let vlan = classify(&raw("Vlan100", "", IFTYPE_L3_VLAN, 0));
        assert_eq!(vlan.interface_type, InterfaceType::Virtual);
    }

    #[test]
    fn gigabit_trunk_is_critical() {
        let classified = classify(&raw("Po1", "trunk to access stack", 6, 10_000));
        assert_eq!(classified.interface_type, InterfaceType::Trunk);
        assert!(classified.is_critical);

        let slow = classify(&raw("Fa0/24", "trunk to lab", 6, 100));
        assert_eq!(slow.interface_type, InterfaceType::Trunk);
        assert!(!slow.is_critical);
    }

    #[test]
    fn high_speed_precedence_over_if_speed() {
        let mut r = raw("Gi0/3", "access port", 6, 0);
        r.if_speed = Some(1_000_000_000);
        let classified = classify(&r);
        // ifHighSpeed of 0 falls back to ifSpeed
        assert_eq!(classified.speed_bps, Some(1_000_000_000));

        r.if_high_speed = Some(10_000);
        let classified = classify(&r);
        assert_eq!(classified.speed_bps, Some(10_000_000_000));
    }

    #[test]
    fn access_port_defaults() {
        let classified = classify(&raw("Gi0/10", "desk 14", 6, 1000));
        assert_eq!(classified.interface_type, InterfaceType::Access);
        assert!(!classified.is_isp);
        assert!(!classified.is_critical);
    }

    #[test]
    fn vendor_from_enterprise_oid() {
        assert_eq!(
            classify_vendor("something", "1.3.6.1.4.1.9.1.1745"),
            Some("cisco")
        );
        assert_eq!(
            classify_vendor("anything", "1.3.6.1.4.1.14988.1"),
            Some("mikrotik")
        );
    }

    #[test]
    fn vendor_from_sys_descr_keywords() {
        assert_eq!(
            classify_vendor("Cisco IOS Software, C2960X", "1.3.6.1.4.1.99999.1"),
            Some("cisco")
        );
        assert_eq!(
            classify_vendor("RouterOS CRS328", "1.3.6.1.4.1.99999.1"),
            Some("mikrotik")
        );
        assert_eq!(classify_vendor("generic thing", "1.3.6.1.4.1.99999.1"), None);
    }
}
