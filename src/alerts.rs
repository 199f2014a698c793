use std::collections::HashMap;

use anyhow::Error;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use sqlx::PgPool;

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::models::{AlertRule, Device, Severity};
use crate::store;
use crate::tsdb::TsdbReader;

/// Alert names owned by the state machine rather than by operator rules.
pub const RULE_DEVICE_DOWN: &str = "Device Down";
pub const RULE_DEVICE_FLAPPING: &str = "Device Flapping";
pub const RULE_DEVICE_RECOVERED: &str = "Device Recovered";
pub const RULE_WORKER_MISSING: &str = "Worker Missing";

const BUILTIN_RULES: &[&str] = &[
    RULE_DEVICE_DOWN,
    RULE_DEVICE_FLAPPING,
    RULE_DEVICE_RECOVERED,
    RULE_WORKER_MISSING,
];

pub fn is_builtin_rule(name: &str) -> bool {
    // worker-health alerts carry the class in the name ("Worker Missing: snmp")
    BUILTIN_RULES.contains(&name) || name.starts_with(RULE_WORKER_MISSING)
}

/// ISP uplinks alert one severity level higher.
pub fn escalate(severity: Severity) -> Severity {
    match severity {
        Severity::Low => Severity::Medium,
        Severity::Medium => Severity::High,
        Severity::High | Severity::Critical => Severity::Critical,
    }
}

// --- expression grammar ---------------------------------------------------
//
//   expr     := and_expr ( OR and_expr )*
//   and_expr := primary ( AND primary )*
//   primary  := '(' expr ')' | predicate
//
// Predicates are a closed set; right-hand sides are constants.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricRef {
    PingUnreachableSeconds,
    StatusChangesIn { window_seconds: i64 },
    AvgPingMs,
    PacketLoss,
    InterfaceInErrorRate,
    InterfaceOutDiscardRate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Cmp {
        metric: MetricRef,
        op: CmpOp,
        value: f64,
    },
    IpLike(String),
    IsIsp,
    VendorEq(String),
    DeviceTypeEq(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Like,
    Op(CmpOp),
    Number(f64),
    Word(String),
    Quoted(String),
}

fn tokenize(input: &str) -> CoreResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => text.push(ch),
                        None => {
                            return Err(CoreError::decode(format!(
                                "unterminated string in expression {:?}",
                                input
                            )))
                        }
                    }
                }
                tokens.push(Token::Quoted(text));
            }
            '>' | '<' | '=' | '!' => {
                chars.next();
                let eq = chars.peek() == Some(&'=');
                if eq {
                    chars.next();
                }
                let op = match (c, eq) {
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    ('=', _) => CmpOp::Eq,
                    _ => {
                        return Err(CoreError::decode(format!(
                            "unsupported operator {:?} in {:?}",
                            c, input
                        )))
                    }
                };
                tokens.push(Token::Op(op));
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        text.push(ch);
                        chars.next();
                    } else if ch.is_ascii_alphabetic() || ch == '%' || ch == '_' {
                        // window literal like 5m, or a bare LIKE pattern
                        text.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if text.chars().all(|ch| ch.is_ascii_digit() || ch == '.') {
                    let number = text.parse::<f64>().map_err(|_| {
                        CoreError::decode(format!("bad number {:?} in {:?}", text, input))
                    })?;
                    tokens.push(Token::Number(number));
                } else {
                    tokens.push(Token::Word(text));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '%' {
                        text.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match text.to_ascii_uppercase().as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    "LIKE" => tokens.push(Token::Like),
                    _ => tokens.push(Token::Word(text)),
                }
            }
            other => {
                return Err(CoreError::decode(format!(
                    "unexpected character {:?} in {:?}",
                    other, input
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> CoreResult<()> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            other => Err(CoreError::decode(format!(
                "expected {:?}, found {:?}",
                expected, other
            ))),
        }
    }

    fn parse_expr(&mut self) -> CoreResult<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> CoreResult<Expr> {
        let mut left = self.parse_primary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_primary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> CoreResult<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Word(word)) => self.parse_predicate(&word),
            other => Err(CoreError::decode(format!(
                "expected predicate, found {:?}",
                other
            ))),
        }
    }

    fn parse_predicate(&mut self, word: &str) -> CoreResult<Expr> {
        match word {
            "is_isp" => Ok(Expr::IsIsp),
            "ip" => {
                self.expect(&Token::Like)?;
                match self.next() {
                    Some(Token::Quoted(pattern)) | Some(Token::Word(pattern)) => {
                        Ok(Expr::IpLike(pattern))
                    }
                    other => Err(CoreError::decode(format!(
                        "ip LIKE expects a pattern, found {:?}",
                        other
                    ))),
                }
            }
            "vendor" => {
                self.expect(&Token::Op(CmpOp::Eq))?;
                match self.next() {
                    Some(Token::Quoted(value)) | Some(Token::Word(value)) => {
                        Ok(Expr::VendorEq(value))
                    }
                    other => Err(CoreError::decode(format!(
                        "vendor = expects a value, found {:?}",
                        other
                    ))),
                }
            }
            "device_type" => {
                self.expect(&Token::Op(CmpOp::Eq))?;
                match self.next() {
                    Some(Token::Quoted(value)) | Some(Token::Word(value)) => {
                        Ok(Expr::DeviceTypeEq(value))
                    }
                    other => Err(CoreError::decode(format!(
                        "device_type = expects a value, found {:?}",
                        other
                    ))),
                }
            }
            "status_changes_in" => {
                self.expect(&Token::LParen)?;
                let window_seconds = match self.next() {
                    Some(Token::Word(window)) => parse_window(&window)?,
                    Some(Token::Number(seconds)) => seconds as i64,
                    other => {
                        return Err(CoreError::decode(format!(
                            "status_changes_in expects a window, found {:?}",
                            other
                        )))
                    }
                };
                self.expect(&Token::RParen)?;
                let (op, value) = self.parse_comparison()?;
                Ok(Expr::Cmp {
                    metric: MetricRef::StatusChangesIn { window_seconds },
                    op,
                    value,
                })
            }
            "ping_unreachable_seconds" => self.finish_metric(MetricRef::PingUnreachableSeconds),
            "avg_ping_ms" => self.finish_metric(MetricRef::AvgPingMs),
            "packet_loss" => self.finish_metric(MetricRef::PacketLoss),
            "interface_in_error_rate" => self.finish_metric(MetricRef::InterfaceInErrorRate),
            "interface_out_discard_rate" => self.finish_metric(MetricRef::InterfaceOutDiscardRate),
            other => Err(CoreError::decode(format!("unknown predicate {:?}", other))),
        }
    }

    fn finish_metric(&mut self, metric: MetricRef) -> CoreResult<Expr> {
        let (op, value) = self.parse_comparison()?;
        Ok(Expr::Cmp { metric, op, value })
    }

    fn parse_comparison(&mut self) -> CoreResult<(CmpOp, f64)> {
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            other => {
                return Err(CoreError::decode(format!(
                    "expected comparison operator, found {:?}",
                    other
                )))
            }
        };
        let value = match self.next() {
            Some(Token::Number(value)) => value,
            other => {
                return Err(CoreError::decode(format!(
                    "expected numeric constant, found {:?}",
                    other
                )))
            }
        };
        Ok((op, value))
    }
}

/// Windows are written `300s`, `5m` or `1h`.
fn parse_window(raw: &str) -> CoreResult<i64> {
    let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => {
            return Err(CoreError::decode(format!("bad window {:?}", raw)));
        }
    };
    let amount: i64 = digits
        .parse()
        .map_err(|_| CoreError::decode(format!("bad window {:?}", raw)))?;
    Ok(amount * multiplier)
}

pub fn parse_expression(input: &str) -> CoreResult<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(CoreError::new(ErrorKind::Decode, "empty expression"));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(CoreError::decode(format!(
            "trailing tokens after expression in {:?}",
            input
        )));
    }
    Ok(expr)
}

// --- evaluation -----------------------------------------------------------

/// Last-window aggregates fetched from the time-series store, per device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregates {
    pub avg_ping_ms: Option<f64>,
    pub packet_loss: Option<f64>,
    pub interface_in_error_rate: Option<f64>,
    pub interface_out_discard_rate: Option<f64>,
}

fn compare(left: f64, op: CmpOp, right: f64) -> bool {
    match op {
        CmpOp::Gt => left > right,
        CmpOp::Ge => left >= right,
        CmpOp::Lt => left < right,
        CmpOp::Le => left <= right,
        CmpOp::Eq => (left - right).abs() < f64::EPSILON,
    }
}

/// SQL LIKE with `%` and `_`, case-sensitive, no escapes.
pub fn like_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    // dp[i][j]: pattern[..i] matches text[..j]
    let mut dp = vec![vec![false; t.len() + 1]; p.len() + 1];
    dp[0][0] = true;
    for i in 1..=p.len() {
        if p[i - 1] == '%' {
            dp[i][0] = dp[i - 1][0];
        }
    }
    for i in 1..=p.len() {
        for j in 1..=t.len() {
            dp[i][j] = match p[i - 1] {
                '%' => dp[i - 1][j] || dp[i][j - 1],
                '_' => dp[i - 1][j - 1],
                c => dp[i - 1][j - 1] && c == t[j - 1],
            };
        }
    }
    dp[p.len()][t.len()]
}

pub fn eval(expr: &Expr, device: &Device, aggs: &Aggregates, now: DateTime<Utc>) -> bool {
    match expr {
        Expr::Or(left, right) => {
            eval(left, device, aggs, now) || eval(right, device, aggs, now)
        }
        Expr::And(left, right) => {
            eval(left, device, aggs, now) && eval(right, device, aggs, now)
        }
        Expr::IsIsp => device.is_isp_uplink(),
        Expr::IpLike(pattern) => like_match(pattern, &device.ip),
        Expr::VendorEq(value) => device
            .vendor
            .as_deref()
            .map(|v| v.eq_ignore_ascii_case(value))
            .unwrap_or(false),
        Expr::DeviceTypeEq(value) => device.device_type.to_string().eq_ignore_ascii_case(value),
        Expr::Cmp { metric, op, value } => {
            let left = match metric {
                MetricRef::PingUnreachableSeconds => device
                    .down_since
                    .map(|since| (now - since).num_seconds().max(0) as f64),
                MetricRef::StatusChangesIn { window_seconds } => {
                    let cutoff = now - ChronoDuration::seconds(*window_seconds);
                    Some(
                        device
                            .status_change_times
                            .iter()
                            .filter(|t| **t >= cutoff)
                            .count() as f64,
                    )
                }
                MetricRef::AvgPingMs => aggs.avg_ping_ms,
                MetricRef::PacketLoss => aggs.packet_loss,
                MetricRef::InterfaceInErrorRate => aggs.interface_in_error_rate,
                MetricRef::InterfaceOutDiscardRate => aggs.interface_out_discard_rate,
            };
            // a missing observation never satisfies a condition
            left.map(|left| compare(left, *op, *value)).unwrap_or(false)
        }
    }
}

fn mentions_tsdb_metric(expr: &Expr) -> bool {
    match expr {
        Expr::Or(l, r) | Expr::And(l, r) => mentions_tsdb_metric(l) || mentions_tsdb_metric(r),
        Expr::Cmp { metric, .. } => matches!(
            metric,
            MetricRef::AvgPingMs
                | MetricRef::PacketLoss
                | MetricRef::InterfaceInErrorRate
                | MetricRef::InterfaceOutDiscardRate
        ),
        _ => false,
    }
}

// --- per-tick evaluation --------------------------------------------------

#[derive(Debug, Default, PartialEq)]
pub struct EvalStats {
    pub created: usize,
    pub resolved: usize,
    pub suppressed: usize,
}

pub struct AlertEngine {
    pool: PgPool,
    reader: TsdbReader,
    cooldown_default: ChronoDuration,
}

/// A rule that matched a device this tick, before dedup.
#[derive(Debug, Clone)]
struct Candidate {
    rule_id: uuid::Uuid,
    rule_name: String,
    severity: Severity,
    cooldown_seconds: i64,
}

/// Highest severity wins; ties break on rule name for determinism.
fn pick_highest(mut candidates: Vec<Candidate>) -> Option<Candidate> {
    candidates.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.rule_name.cmp(&b.rule_name))
    });
    candidates.into_iter().next()
}

impl AlertEngine {
    pub fn new(pool: PgPool, reader: TsdbReader) -> Self {
        AlertEngine {
            pool,
            reader,
            cooldown_default: ChronoDuration::seconds(60),
        }
    }

    /// One evaluation pass over every enabled rule and device.
    pub async fn evaluate_tick(&self) -> Result<EvalStats, Error> {
        let now = Utc::now();
        let mut stats = EvalStats::default();

        let rules = store::enabled_alert_rules(&self.pool).await?;
        let devices = store::all_enabled_devices(&self.pool).await?;
        let open = store::open_alerts(&self.pool).await?;

        let parsed: Vec<(AlertRule, Expr, Option<Expr>)> = rules
            .into_iter()
            .filter_map(|rule| {
                let expr = match parse_expression(&rule.expression) {
                    Ok(expr) => expr,
                    Err(error) => {
                        warn!(
                            "alerts: rule {:?} has a bad expression, skipping: {}",
                            rule.name, error
                        );
                        return None;
                    }
                };
                let scope = match rule.applies_to.as_deref() {
                    None | Some("") => None,
                    Some(raw) => match parse_expression(raw) {
                        Ok(scope) => Some(scope),
                        Err(error) => {
                            warn!(
                                "alerts: rule {:?} has a bad scope, skipping: {}",
                                rule.name, error
                            );
                            return None;
                        }
                    },
                };
                Some((rule, expr, scope))
            })
            .collect();

        let needs_aggregates = parsed.iter().any(|(_, expr, _)| mentions_tsdb_metric(expr));
        let aggregates = if needs_aggregates {
            self.fetch_aggregates().await.unwrap_or_else(|error| {
                warn!("alerts: aggregate queries failed, window metrics skipped: {:#}", error);
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        // current matching set, deduplicated to the highest severity per device
        let empty = Aggregates::default();
        let mut matched_names: HashMap<uuid::Uuid, Vec<String>> = HashMap::new();
        for device in &devices {
            let aggs = aggregates.get(&device.name).unwrap_or(&empty);
            let candidates: Vec<Candidate> = parsed
                .iter()
                .filter(|(_, expr, scope)| {
                    scope
                        .as_ref()
                        .map(|s| eval(s, device, aggs, now))
                        .unwrap_or(true)
                        && eval(expr, device, aggs, now)
                })
                .map(|(rule, _, _)| Candidate {
                    rule_id: rule.id,
                    rule_name: rule.name.clone(),
                    severity: if device.is_isp_uplink() {
                        escalate(rule.severity)
                    } else {
                        rule.severity
                    },
                    cooldown_seconds: i64::from(rule.cooldown_seconds),
                })
                .collect();

            matched_names.insert(
                device.id,
                candidates.iter().map(|c| c.rule_name.clone()).collect(),
            );

            if device.is_flapping {
                // only the flapping alert may stay open for this device
                for alert in open.iter().filter(|a| {
                    a.device_id == Some(device.id) && a.rule_name != RULE_DEVICE_FLAPPING
                }) {
                    store::resolve_alert(&self.pool, alert.id, now, Some("superseded-by-flapping"))
                        .await?;
                    stats.suppressed += 1;
                }
                continue;
            }

            let winner = match pick_highest(candidates) {
                Some(winner) => winner,
                None => continue,
            };

            if open
                .iter()
                .any(|a| a.device_id == Some(device.id) && a.rule_name == winner.rule_name)
            {
                continue;
            }

            // cooldown: a freshly resolved alert must not re-fire immediately
            if let Some(resolved_at) =
                store::last_resolved_at(&self.pool, device.id, &winner.rule_name).await?
            {
                let cooldown = if winner.cooldown_seconds > 0 {
                    ChronoDuration::seconds(winner.cooldown_seconds)
                } else {
                    self.cooldown_default
                };
                if now - resolved_at < cooldown {
                    debug!(
                        "alerts: {} for {} still cooling down",
                        winner.rule_name, device.name
                    );
                    continue;
                }
            }

            let mut context = HashMap::new();
            context.insert("ip".to_string(), device.ip.clone());
            if let Some(down_since) = device.down_since {
                context.insert("down_since".to_string(), down_since.to_rfc3339());
            }
            if store::open_alert(
                &self.pool,
                Some(winner.rule_id),
                &winner.rule_name,
                Some(device.id),
                winner.severity,
                now,
                &context,
            )
            .await?
            {
                info!(
                    "alerts: opened {:?} ({}) for {}",
                    winner.rule_name, winner.severity, device.name
                );
                stats.created += 1;
            } else {
                // a concurrent evaluator won the insert; the unique index
                // keeps exactly one row open
                debug!(
                    "alerts: {} for {} lost an open race ({})",
                    winner.rule_name,
                    device.name,
                    ErrorKind::Conflict
                );
            }
        }

        // resolution pass: open alerts whose rule (matched BY NAME, so a
        // re-created rule keeps its history) no longer matches
        let rules_by_name: HashMap<&str, &(AlertRule, Expr, Option<Expr>)> = parsed
            .iter()
            .map(|entry| (entry.0.name.as_str(), entry))
            .collect();
        let flapping: std::collections::HashSet<uuid::Uuid> = devices
            .iter()
            .filter(|d| d.is_flapping)
            .map(|d| d.id)
            .collect();
        for alert in &open {
            if is_builtin_rule(&alert.rule_name) {
                // owned by the state machine and worker-health paths
                continue;
            }
            let device_id = match alert.device_id {
                Some(id) => id,
                None => continue,
            };
            if flapping.contains(&device_id) {
                // already closed by the suppression branch above
                continue;
            }
            match rules_by_name.get(alert.rule_name.as_str()) {
                Some((rule, _, _)) => {
                    let still_matching = matched_names
                        .get(&device_id)
                        .map(|names| names.contains(&alert.rule_name))
                        .unwrap_or(false);
                    if !still_matching && rule.auto_resolve {
                        store::resolve_alert(&self.pool, alert.id, now, None).await?;
                        stats.resolved += 1;
                    }
                }
                None => {
                    // the rule was deleted or disabled outright
                    store::resolve_alert(&self.pool, alert.id, now, Some("rule-removed")).await?;
                    stats.resolved += 1;
                }
            }
        }

        debug!(
            "alerts: tick done, created={} resolved={} suppressed={}",
            stats.created, stats.resolved, stats.suppressed
        );
        Ok(stats)
    }

    /// Window aggregates, keyed by device name.
    async fn fetch_aggregates(&self) -> Result<HashMap<String, Aggregates>, Error> {
        let mut out: HashMap<String, Aggregates> = HashMap::new();

        let queries: [(&str, fn(&mut Aggregates, f64)); 4] = [
            ("avg_over_time(device_ping_rtt_ms[15m])", |a, v| {
                a.avg_ping_ms = Some(v)
            }),
            ("avg_over_time(device_ping_loss_ratio[15m])", |a, v| {
                a.packet_loss = Some(v)
            }),
            (
                "max by (device) (rate(interface_if_in_errors[15m]))",
                |a, v| a.interface_in_error_rate = Some(v),
            ),
            (
                "max by (device) (rate(interface_if_out_discards[15m]))",
                |a, v| a.interface_out_discard_rate = Some(v),
            ),
        ];

        for (query, assign) in queries {
            for (labels, value) in self.reader.query_instant(query).await? {
                if let Some(device) = labels.get("device") {
                    assign(out.entry(device.clone()).or_default(), value);
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceType;
    use chrono::TimeZone;
    use sqlx::types::Json;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn device(ip: &str) -> Device {
        Device {
            id: Uuid::new_v4(),
            name: "sw1".into(),
            ip: ip.into(),
            hostname: None,
            vendor: Some("cisco".into()),
            device_type: DeviceType::Switch,
            model: None,
            location: None,
            description: None,
            enabled: true,
            role: None,
            tags: vec![],
            custom_fields: Json(Default::default()),
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
    fn parses_simple_comparison() {
        let expr = parse_expression("ping_unreachable_seconds >= 300").unwrap();
        assert_eq!(
            expr,
            Expr::Cmp {
                metric: MetricRef::PingUnreachableSeconds,
                op: CmpOp::Ge,
                value: 300.0
            }
        );
    }

    #[test]
    fn parses_window_predicate() {
        let expr = parse_expression("status_changes_in(5m) >= 3").unwrap();
        assert_eq!(
            expr,
            Expr::Cmp {
                metric: MetricRef::StatusChangesIn { window_seconds: 300 },
                op: CmpOp::Ge,
                value: 3.0
            }
        );
    }

    #[test]
    fn parses_compound_expression() {
        let expr =
            parse_expression("packet_loss > 0.5 AND (device_type = switch OR is_isp)").unwrap();
        match expr {
            Expr::And(left, right) => {
                assert!(matches!(*left, Expr::Cmp { .. }));
                assert!(matches!(*right, Expr::Or(_, _)));
            }
            other => panic!("unexpected parse {:?}", other),
        }
    }

    #[test]
    fn parses_ip_like_with_quotes_and_without() {
        assert_eq!(
            parse_expression("ip LIKE '192.168.%'").unwrap(),
            Expr::IpLike("192.168.%".into())
        );
        assert_eq!(
            parse_expression("ip LIKE 10.0.%").unwrap(),
            Expr::IpLike("10.0.%".into())
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_expression("").is_err());
        assert!(parse_expression("frobnicate > 3").is_err());
        assert!(parse_expression("ping_unreachable_seconds >=").is_err());
        assert!(parse_expression("avg_ping_ms > 10 extra").is_err());
        assert!(parse_expression("status_changes_in(5x) >= 2").is_err());
    }

    #[test]
    fn like_matching_semantics() {
        assert!(like_match("192.168.%", "192.168.1.5"));
        assert!(!like_match("192.168.%", "10.0.0.1"));
        assert!(like_match("10.0.0._", "10.0.0.9"));
        assert!(!like_match("10.0.0._", "10.0.0.99"));
        assert!(like_match("%", "anything"));
        assert!(like_match("10.%.5", "10.20.5"));
    }

    #[test]
    fn eval_unreachable_duration() {
        let mut d = device("10.0.0.1");
        let expr = parse_expression("ping_unreachable_seconds >= 300").unwrap();
        assert!(!eval(&expr, &d, &Aggregates::default(), now()));

        d.down_since = Some(now() - ChronoDuration::seconds(301));
        assert!(eval(&expr, &d, &Aggregates::default(), now()));

        d.down_since = Some(now() - ChronoDuration::seconds(299));
        assert!(!eval(&expr, &d, &Aggregates::default(), now()));
    }

    #[test]
    fn eval_status_changes_window() {
        let mut d = device("10.0.0.1");
        d.status_change_times = vec![
            now() - ChronoDuration::seconds(250),
            now() - ChronoDuration::seconds(100),
            now() - ChronoDuration::seconds(400), // outside 5m
        ];
        let expr = parse_expression("status_changes_in(5m) >= 2").unwrap();
        assert!(eval(&expr, &d, &Aggregates::default(), now()));
        let expr = parse_expression("status_changes_in(5m) >= 3").unwrap();
        assert!(!eval(&expr, &d, &Aggregates::default(), now()));
    }

    #[test]
    fn eval_aggregates_and_missing_data() {
        let d = device("10.0.0.1");
        let expr = parse_expression("packet_loss > 0.5").unwrap();
        // no observation: condition is not satisfied
        assert!(!eval(&expr, &d, &Aggregates::default(), now()));

        let aggs = Aggregates {
            packet_loss: Some(0.75),
            ..Default::default()
        };
        assert!(eval(&expr, &d, &aggs, now()));
    }

    #[test]
    fn eval_scope_predicates() {
        let d = device("192.168.1.5");
        let aggs = Aggregates::default();
        assert!(eval(
            &parse_expression("vendor = cisco").unwrap(),
            &d,
            &aggs,
            now()
        ));
        assert!(eval(
            &parse_expression("device_type = switch AND ip LIKE '192.168.%'").unwrap(),
            &d,
            &aggs,
            now()
        ));
        // last octet 5 makes this an ISP uplink by convention
        assert!(eval(&parse_expression("is_isp").unwrap(), &d, &aggs, now()));
    }

    #[test]
    fn highest_severity_wins_with_stable_ties() {
        let critical = Candidate {
            rule_id: Uuid::new_v4(),
            rule_name: "zz-outage".into(),
            severity: Severity::Critical,
            cooldown_seconds: 60,
        };
        let high = Candidate {
            rule_id: Uuid::new_v4(),
            rule_name: "aa-latency".into(),
            severity: Severity::High,
            cooldown_seconds: 60,
        };
        let winner = pick_highest(vec![high.clone(), critical.clone()]).unwrap();
        assert_eq!(winner.rule_name, "zz-outage");

        let tie_a = Candidate {
            rule_name: "a-rule".into(),
            ..critical.clone()
        };
        let tie_b = Candidate {
            rule_name: "b-rule".into(),
            ..critical
        };
        let winner = pick_highest(vec![tie_b, tie_a]).unwrap();
        assert_eq!(winner.rule_name, "a-rule");

        assert!(pick_highest(vec![]).is_none());
    }

    #[test]
    fn severity_escalation_caps_at_critical() {
        assert_eq!(escalate(Severity::Low), Severity::Medium);
        assert_eq!(escalate(Severity::High), Severity::Critical);
        assert_eq!(escalate(Severity::Critical), Severity::Critical);
    }

    #[test]
    fn builtin_rule_names() {
        assert!(is_builtin_rule(RULE_DEVICE_DOWN));
        assert!(is_builtin_rule(RULE_WORKER_MISSING));
        assert!(!is_builtin_rule("High packet loss"));
    }
}
