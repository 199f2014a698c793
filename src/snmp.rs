use std::time::Duration;

use log::{debug, trace, warn};
use snmp2::{AsyncSession, Oid, Value, v3};
use tokio::time::timeout;

use crate::config::SnmpSettings;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::vault::{AuthProtocol, PrivProtocol, SnmpCredential};

pub const SNMP_PORT: u16 = 161;

/// Well-known IF-MIB and SNMPv2-MIB columns polled by the core.
pub mod oids {
    pub const SYS_DESCR: &str = "1.3.6.1.2.1.1.1.0";
    pub const SYS_OBJECT_ID: &str = "1.3.6.1.2.1.1.2.0";

    pub const IF_DESCR: &str = "1.3.6.1.2.1.2.2.1.2";
    pub const IF_TYPE: &str = "1.3.6.1.2.1.2.2.1.3";
    pub const IF_SPEED: &str = "1.3.6.1.2.1.2.2.1.5";
    pub const IF_ADMIN_STATUS: &str = "1.3.6.1.2.1.2.2.1.7";
    pub const IF_OPER_STATUS: &str = "1.3.6.1.2.1.2.2.1.8";
    pub const IF_IN_DISCARDS: &str = "1.3.6.1.2.1.2.2.1.13";
    pub const IF_IN_ERRORS: &str = "1.3.6.1.2.1.2.2.1.14";
    pub const IF_OUT_DISCARDS: &str = "1.3.6.1.2.1.2.2.1.19";
    pub const IF_OUT_ERRORS: &str = "1.3.6.1.2.1.2.2.1.20";

    pub const IF_NAME: &str = "1.3.6.1.2.1.31.1.1.1.1";
    pub const IF_HC_IN_OCTETS: &str = "1.3.6.1.2.1.31.1.1.1.6";
    pub const IF_HC_OUT_OCTETS: &str = "1.3.6.1.2.1.31.1.1.1.10";
    pub const IF_HIGH_SPEED: &str = "1.3.6.1.2.1.31.1.1.1.15";
    pub const IF_ALIAS: &str = "1.3.6.1.2.1.31.1.1.1.18";
}

/// Owned decode of a response varbind value.
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Int(i64),
    Counter32(u32),
    Counter64(u64),
    Unsigned(u32),
    Timeticks(u32),
    Str(String),
    Bytes(Vec<u8>),
    OidValue(String),
    IpAddress(String),
    Null,
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
}

impl SnmpValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SnmpValue::Int(v) => Some(*v as f64),
            SnmpValue::Counter32(v) => Some(f64::from(*v)),
            SnmpValue::Counter64(v) => Some(*v as f64),
            SnmpValue::Unsigned(v) => Some(f64::from(*v)),
            SnmpValue::Timeticks(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SnmpValue::Int(v) => Some(*v),
            SnmpValue::Counter32(v) => Some(i64::from(*v)),
            SnmpValue::Unsigned(v) => Some(i64::from(*v)),
            SnmpValue::Counter64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SnmpValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Per-OID failure class carried inside an otherwise good response.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            SnmpValue::NoSuchObject | SnmpValue::NoSuchInstance | SnmpValue::EndOfMibView => {
                Some(ErrorKind::NotFound)
            }
            _ => None,
        }
    }

    fn from_value(value: &Value) -> SnmpValue {
        match value {
            Value::Integer(v) => SnmpValue::Int(*v),
            Value::Counter32(v) => SnmpValue::Counter32(*v),
            Value::Counter64(v) => SnmpValue::Counter64(*v),
            Value::Unsigned32(v) => SnmpValue::Unsigned(*v),
            Value::Timeticks(v) => SnmpValue::Timeticks(*v),
            Value::OctetString(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => SnmpValue::Str(text.to_string()),
                Err(_) => SnmpValue::Bytes(bytes.to_vec()),
            },
            Value::ObjectIdentifier(oid) => SnmpValue::OidValue(oid_to_string(oid)),
            Value::IpAddress(ip) => {
                SnmpValue::IpAddress(format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]))
            }
            Value::NoSuchObject => SnmpValue::NoSuchObject,
            Value::NoSuchInstance => SnmpValue::NoSuchInstance,
            Value::EndOfMibView => SnmpValue::EndOfMibView,
            _ => SnmpValue::Null,
        }
    }
}

pub fn parse_oid_str(oid: &str) -> CoreResult<Vec<u64>> {
    oid.trim_matches('.')
        .split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| CoreError::decode(format!("invalid oid component {:?} in {}", part, oid)))
        })
        .collect()
}

pub fn oid_vec_to_string(parts: &[u64]) -> String {
    parts
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

pub fn oid_vec_starts_with(oid: &[u64], base: &[u64]) -> bool {
    oid.len() >= base.len() && oid[..base.len()] == *base
}

fn oid_to_vec(oid: &Oid) -> Vec<u64> {
    oid.iter().map(|it| it.collect()).unwrap_or_default()
}

fn oid_to_string(oid: &Oid) -> String {
    oid_vec_to_string(&oid_to_vec(oid))
}

fn oid_from_vec(parts: &[u64]) -> CoreResult<Oid<'static>> {
    Oid::from(parts).map_err(|_| CoreError::decode(format!("invalid oid {:?}", parts)))
}

fn classify(error: &snmp2::Error) -> ErrorKind {
    match error {
        snmp2::Error::Send | snmp2::Error::Receive => ErrorKind::Network,
        snmp2::Error::CommunityMismatch => ErrorKind::Auth,
        _ => ErrorKind::Decode,
    }
}

/// SNMP client settings shared by every session this worker opens.
#[derive(Clone)]
pub struct SnmpClient {
    settings: SnmpSettings,
}

/// One device's session plus the request policy applied to it.
pub struct DeviceSession {
    session: AsyncSession,
    target: String,
    timeout: Duration,
    retries: u32,
    max_repetitions: u32,
}

impl SnmpClient {
    pub fn new(settings: SnmpSettings) -> Self {
        SnmpClient { settings }
    }

    /// Opens a session for the device. v3 performs engine-id discovery up
    /// front; v2c sessions are connectionless and cheap.
    pub async fn connect(
        &self,
        ip: &str,
        credential: &SnmpCredential,
    ) -> CoreResult<DeviceSession> {
        let target = if ip.contains(':') {
            ip.to_string()
        } else {
            format!("{}:{}", ip, SNMP_PORT)
        };

        let session = match credential {
            SnmpCredential::V2c { community } => {
                AsyncSession::new_v2c(&target, community.as_bytes(), 0)
                    .await
                    .map_err(|e| CoreError::network(format!("v2c session to {}: {:?}", target, e)))?
            }
            SnmpCredential::V3 {
                security_name,
                auth_protocol,
                auth_key,
                priv_protocol,
                priv_key,
            } => {
                let security = build_v3_security(
                    security_name,
                    *auth_protocol,
                    auth_key.as_deref(),
                    *priv_protocol,
                    priv_key.as_deref(),
                )?;
                let mut session = AsyncSession::new_v3(&target, 0, security)
                    .await
                    .map_err(|e| CoreError::network(format!("v3 session to {}: {:?}", target, e)))?;
                // engine id and time sync discovery
                match timeout(self.settings.timeout, session.init()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        return Err(CoreError::new(
                            classify(&error),
                            format!("v3 init for {}: {:?}", target, error),
                        ))
                    }
                    Err(_) => {
                        return Err(CoreError::timeout(format!("v3 init for {}", target)));
                    }
                }
                session
            }
        };

        Ok(DeviceSession {
            session,
            target,
            timeout: self.settings.timeout,
            retries: self.settings.retries,
            max_repetitions: self.settings.max_repetitions,
        })
    }
}

impl DeviceSession {
    /// GET a single scalar, retried per policy.
    pub async fn get_one(&mut self, oid_str: &str) -> CoreResult<SnmpValue> {
        let parts = parse_oid_str(oid_str)?;
        let mut attempt = 0;
        loop {
            let oid = oid_from_vec(&parts)?;
            let result = match timeout(self.timeout, self.session.get(&oid)).await {
                Ok(Ok(mut pdu)) => match pdu.varbinds.next() {
                    Some((_oid, value)) => Ok(SnmpValue::from_value(&value)),
                    None => Err(CoreError::decode(format!(
                        "empty response from {} for {}",
                        self.target, oid_str
                    ))),
                },
                Ok(Err(error)) => Err(CoreError::new(
                    classify(&error),
                    format!("get {} from {}: {:?}", oid_str, self.target, error),
                )),
                Err(_) => Err(CoreError::timeout(format!(
                    "get {} from {}",
                    oid_str, self.target
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(error) if retryable(error.kind) && attempt < self.retries => {
                    let backoff = Duration::from_secs(1 << attempt.min(2));
                    trace!(
                        "snmp({}): attempt {} failed ({}), backing off {:?}",
                        self.target,
                        attempt,
                        error,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// GET a set of scalars; per-OID outcomes, a timeout aborts the set.
    pub async fn get_many(&mut self, oid_strs: &[String]) -> CoreResult<Vec<(String, SnmpValue)>> {
        let mut out = Vec::with_capacity(oid_strs.len());
        for oid_str in oid_strs {
            match self.get_one(oid_str).await {
                Ok(value) => out.push((oid_str.clone(), value)),
                Err(error) if error.kind == ErrorKind::Timeout => return Err(error),
                Err(error) => {
                    debug!("snmp({}): {} skipped: {}", self.target, oid_str, error);
                }
            }
        }
        Ok(out)
    }

    /// Single GETNEXT step.
    pub async fn get_next(&mut self, oid_str: &str) -> CoreResult<(Vec<u64>, SnmpValue)> {
        let parts = parse_oid_str(oid_str)?;
        let oid = oid_from_vec(&parts)?;
        match timeout(self.timeout, self.session.getnext(&oid)).await {
            Ok(Ok(mut pdu)) => match pdu.varbinds.next() {
                Some((next_oid, value)) => {
                    Ok((oid_to_vec(&next_oid), SnmpValue::from_value(&value)))
                }
                None => Err(CoreError::decode(format!(
                    "empty getnext response from {}",
                    self.target
                ))),
            },
            Ok(Err(error)) => Err(CoreError::new(
                classify(&error),
                format!("getnext {} from {}: {:?}", oid_str, self.target, error),
            )),
            Err(_) => Err(CoreError::timeout(format!(
                "getnext {} from {}",
                oid_str, self.target
            ))),
        }
    }

    /// Walk a whole column with GETBULK, stopping at the subtree boundary.
    /// Returns `(index_suffix, value)` pairs; for IF-MIB columns the suffix
    /// is the ifIndex. On oversized responses the repetition count is
    /// halved and the walk restarted.
    pub async fn bulkwalk(&mut self, base_str: &str) -> CoreResult<Vec<(Vec<u64>, SnmpValue)>> {
        let base = parse_oid_str(base_str)?;
        let mut repetitions = self.max_repetitions;

        loop {
            match self.bulkwalk_once(&base, repetitions).await {
                Ok(rows) => return Ok(rows),
                Err(error) if error.kind == ErrorKind::Decode && repetitions > 1 => {
                    // response too big for the transport: halve and retry
                    repetitions = (repetitions / 2).max(1);
                    warn!(
                        "snmp({}): bulkwalk {} retrying with max-repetitions={}",
                        self.target, base_str, repetitions
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn bulkwalk_once(
        &mut self,
        base: &[u64],
        repetitions: u32,
    ) -> CoreResult<Vec<(Vec<u64>, SnmpValue)>> {
        let mut rows: Vec<(Vec<u64>, SnmpValue)> = vec![];
        let mut current = base.to_vec();
        let mut attempt = 0;

        loop {
            let oid = oid_from_vec(&current)?;
            let pdu = match timeout(
                self.timeout,
                self.session.getbulk(&[&oid], 0, repetitions),
            )
            .await
            {
                Ok(Ok(pdu)) => pdu,
                Ok(Err(error)) => {
                    return Err(CoreError::new(
                        classify(&error),
                        format!("getbulk from {}: {:?}", self.target, error),
                    ))
                }
                Err(_) if attempt < self.retries => {
                    let backoff = Duration::from_secs(1 << attempt.min(2));
                    trace!(
                        "snmp({}): bulkwalk attempt {} timed out, backing off {:?}",
                        self.target,
                        attempt,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                    continue;
                }
                Err(_) => {
                    return Err(CoreError::timeout(format!("getbulk from {}", self.target)));
                }
            };

            let mut varbinds = pdu.varbinds;
            let mut last: Option<Vec<u64>> = None;
            let mut done = false;
            for (resp_oid, value) in &mut varbinds {
                let resp_vec = oid_to_vec(&resp_oid);
                if !oid_vec_starts_with(&resp_vec, base)
                    || matches!(value, Value::EndOfMibView)
                {
                    done = true;
                    break;
                }
                let suffix = resp_vec[base.len()..].to_vec();
                rows.push((suffix, SnmpValue::from_value(&value)));
                last = Some(resp_vec);
            }

            match (done, last) {
                (true, _) | (false, None) => return Ok(rows),
                (false, Some(last)) => current = last,
            }
        }
    }
}

fn retryable(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Timeout | ErrorKind::Network)
}

fn build_v3_security(
    security_name: &str,
    auth_protocol: Option<AuthProtocol>,
    auth_key: Option<&str>,
    priv_protocol: Option<PrivProtocol>,
    priv_key: Option<&str>,
) -> CoreResult<v3::Security> {
    let username = security_name.as_bytes();

    let auth_proto = auth_protocol.map(|p| match p {
        AuthProtocol::Md5 => v3::AuthProtocol::Md5,
        AuthProtocol::Sha => v3::AuthProtocol::Sha1,
    });

    let security = match (auth_proto, priv_protocol) {
        (None, None) => v3::Security::new(username, b""),
        (None, Some(_)) => {
            return Err(CoreError::new(
                ErrorKind::Auth,
                "privacy requires authentication",
            ))
        }
        (Some(proto), None) => {
            let auth_key = auth_key
                .ok_or_else(|| CoreError::new(ErrorKind::Auth, "auth protocol without key"))?;
            v3::Security::new(username, auth_key.as_bytes()).with_auth_protocol(proto)
        }
        (Some(proto), Some(cipher)) => {
            let auth_key = auth_key
                .ok_or_else(|| CoreError::new(ErrorKind::Auth, "auth protocol without key"))?;
            let priv_key = priv_key
                .ok_or_else(|| CoreError::new(ErrorKind::Auth, "priv protocol without key"))?;
            let cipher = match cipher {
                PrivProtocol::Des => v3::Cipher::Des,
                PrivProtocol::Aes => v3::Cipher::Aes128,
            };
            v3::Security::new(username, auth_key.as_bytes())
                .with_auth_protocol(proto)
                .with_auth(v3::Auth::AuthPriv {
                    cipher,
                    privacy_password: priv_key.as_bytes().to_vec(),
                })
        }
    };

    Ok(security)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_oids() {
        let parts = parse_oid_str("1.3.6.1.2.1.31.1.1.1.6").unwrap();
        assert_eq!(parts, vec![1, 3, 6, 1, 2, 1, 31, 1, 1, 1, 6]);
        assert_eq!(oid_vec_to_string(&parts), "1.3.6.1.2.1.31.1.1.1.6");
        // leading dot form is accepted
        assert_eq!(parse_oid_str(".1.3.6").unwrap(), vec![1, 3, 6]);
        assert!(parse_oid_str("1.3.x").is_err());
    }

    #[test]
    fn subtree_boundary_detection() {
        let base = parse_oid_str(oids::IF_NAME).unwrap();
        let inside = parse_oid_str("1.3.6.1.2.1.31.1.1.1.1.42").unwrap();
        let outside = parse_oid_str("1.3.6.1.2.1.31.1.1.1.2.1").unwrap();
        assert!(oid_vec_starts_with(&inside, &base));
        assert!(!oid_vec_starts_with(&outside, &base));
        assert!(!oid_vec_starts_with(&base[..3], &base));
    }

    #[test]
    fn numeric_value_conversions() {
        assert_eq!(SnmpValue::Counter64(10_000_000_000).as_f64(), Some(1e10));
        assert_eq!(SnmpValue::Int(-3).as_i64(), Some(-3));
        assert_eq!(SnmpValue::Str("Gi0/1".into()).as_f64(), None);
        assert_eq!(SnmpValue::NoSuchInstance.as_f64(), None);
    }

    #[test]
    fn retry_policy_covers_transient_kinds_only() {
        assert!(retryable(ErrorKind::Timeout));
        assert!(retryable(ErrorKind::Network));
        assert!(!retryable(ErrorKind::Auth));
        assert!(!retryable(ErrorKind::Decode));
    }
}
