use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Error};
use log::{debug, trace};
use rand::random;
use surge_ping::{Client, Config, PingIdentifier, PingSequence, SurgeError};

use crate::config::IcmpSettings;
use crate::error::ErrorKind;

/// Reachability summary for one target over one probe burst.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub avg_rtt_ms: Option<f64>,
    pub loss_ratio: f64,
    /// Failure class of the last error, for the per-tick error metric.
    pub error_kind: Option<ErrorKind>,
}

/// Shared unprivileged ICMP socket; pingers are cheap per-target handles.
pub struct Prober {
    client: Client,
    settings: IcmpSettings,
}

impl Prober {
    pub fn new(settings: IcmpSettings) -> Result<Self, Error> {
        let client = Client::new(&Config::default()).context("could not open ICMP socket")?;
        Ok(Prober { client, settings })
    }

    /// Sends `count` echo requests with a per-packet timeout and a fixed
    /// inter-packet delay. Never returns an error: every failure mode is a
    /// reachability answer.
    pub async fn probe(&self, ip: IpAddr) -> ProbeResult {
        let mut pinger = self.client.pinger(ip, PingIdentifier(random())).await;
        pinger.timeout(self.settings.timeout);

        let payload = [0u8; 56];
        let mut rtts: Vec<Duration> = Vec::with_capacity(self.settings.count as usize);
        let mut last_error: Option<ErrorKind> = None;

        for seq in 0..self.settings.count {
            match pinger.ping(PingSequence(seq as u16), &payload).await {
                Ok((_packet, rtt)) => {
                    trace!("icmp({}): seq={} rtt={:?}", ip, seq, rtt);
                    rtts.push(rtt);
                }
                Err(SurgeError::Timeout { .. }) => {
                    trace!("icmp({}): seq={} timed out", ip, seq);
                    last_error = Some(ErrorKind::Timeout);
                }
                Err(error) => {
                    debug!("icmp({}): seq={} error: {}", ip, seq, error);
                    last_error = Some(ErrorKind::Network);
                }
            }
            if seq + 1 < self.settings.count {
                tokio::time::sleep(self.settings.interval).await;
            }
        }

        summarize(&rtts, self.settings.count, last_error)
    }
}

fn summarize(rtts: &[Duration], count: u32, error_kind: Option<ErrorKind>) -> ProbeResult {
    let received = rtts.len() as u32;
    let reachable = received > 0;
    let avg_rtt_ms = if reachable {
        let total_ms: f64 = rtts.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
        Some(total_ms / received as f64)
    } else {
        None
    };
    let loss_ratio = if count == 0 {
        0.0
    } else {
        (count - received.min(count)) as f64 / count as f64
    };
    ProbeResult {
        reachable,
        avg_rtt_ms,
        loss_ratio,
        error_kind: if reachable { None } else { error_kind },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_replies_received() {
        let rtts = vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(30),
        ];
        let result = summarize(&rtts, 3, None);
        assert!(result.reachable);
        assert_eq!(result.loss_ratio, 0.0);
        assert!((result.avg_rtt_ms.unwrap() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn total_loss_is_unreachable() {
        let result = summarize(&[], 3, Some(ErrorKind::Timeout));
        assert!(!result.reachable);
        assert_eq!(result.avg_rtt_ms, None);
        assert_eq!(result.loss_ratio, 1.0);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    }

    #[test]
    fn partial_loss_still_reachable() {
        let rtts = vec![Duration::from_millis(15)];
        let result = summarize(&rtts, 3, Some(ErrorKind::Timeout));
        assert!(result.reachable);
        assert!((result.loss_ratio - 2.0 / 3.0).abs() < 1e-9);
        // reachable targets do not report an error kind
        assert_eq!(result.error_kind, None);
    }
}
