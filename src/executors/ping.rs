use super::{new_result, CheckError, Checked, ErrorKind};
use crate::models::{Monitor, PingResult, ProbeStatus};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use surge_ping::{Client, Config, PingIdentifier, PingSequence, ICMP};
use tracing::debug;

const DEFAULT_PACKET_COUNT: u32 = 3;
const MIN_PACKET_TIMEOUT: Duration = Duration::from_millis(200);

/// ICMP echo probe: sends N packets and reports loss percentage and
/// min/avg/max round-trip times. `up` iff loss is below 100%.
pub struct PingProbe {
    host: String,
    count: u32,
    degraded_threshold: Option<f64>,
    client_v4: Option<Arc<Client>>,
    client_v6: Option<Arc<Client>>,
}

pub(super) fn validate(monitor: &Monitor) -> Result<(), String> {
    if monitor.target.as_deref().unwrap_or("").is_empty() {
        return Err("ping monitors require a host target".into());
    }
    if monitor.ping_count == Some(0) {
        return Err("pingCount must be at least 1".into());
    }
    Ok(())
}

/// Build an ICMP client, falling back to an unprivileged datagram socket
/// when raw sockets are unavailable. `None` when neither can be opened.
pub(super) fn make_client(kind: ICMP) -> Option<Arc<Client>> {
    let config = Config::builder().kind(kind).build();
    if let Ok(client) = Client::new(&config) {
        return Some(Arc::new(client));
    }
    debug!(?kind, "raw ICMP socket unavailable, trying unprivileged datagram socket");
    let config = Config::builder()
        .kind(kind)
        .sock_type_hint(socket2::Type::DGRAM)
        .build();
    Client::new(&config).ok().map(Arc::new)
}

/// Roll per-packet RTTs into a probe outcome.
fn summarize(
    count: u32,
    rtts: &[f64],
    degraded_threshold: Option<f64>,
    last_error: Option<String>,
) -> (ProbeStatus, f64, Option<CheckError>) {
    let received = rtts.len() as u32;
    let loss = (count - received) as f64 / count as f64 * 100.0;
    if received == 0 {
        let message = last_error.unwrap_or_else(|| "100% packet loss".to_string());
        return (
            ProbeStatus::Down,
            loss,
            Some(CheckError::new(ErrorKind::Connection, message)),
        );
    }
    match degraded_threshold {
        Some(threshold) if loss >= threshold => (ProbeStatus::Degraded, loss, None),
        _ => (ProbeStatus::Up, loss, None),
    }
}

impl PingProbe {
    pub fn new(
        monitor: &Monitor,
        client_v4: Option<Arc<Client>>,
        client_v6: Option<Arc<Client>>,
    ) -> Result<PingProbe, String> {
        validate(monitor)?;
        Ok(PingProbe {
            host: monitor.target.clone().unwrap_or_default(),
            count: monitor.ping_count.unwrap_or(DEFAULT_PACKET_COUNT),
            degraded_threshold: monitor.degraded_threshold,
            client_v4,
            client_v6,
        })
    }

    pub async fn check(&self, monitor: &Monitor) -> Result<Checked, CheckError> {
        let started = Instant::now();

        let ip = self.resolve().await?;
        let client = match ip {
            IpAddr::V4(_) => self.client_v4.as_ref(),
            IpAddr::V6(_) => self.client_v6.as_ref(),
        }
        .ok_or_else(|| {
            CheckError::new(
                ErrorKind::Connection,
                "no ICMP socket available (raw and unprivileged both failed)",
            )
        })?;

        let per_packet = (monitor.timeout / self.count.max(1)).max(MIN_PACKET_TIMEOUT);
        let mut pinger = client.pinger(ip, PingIdentifier(rand::random())).await;
        pinger.timeout(per_packet);

        let payload = [0u8; 32];
        let mut rtts: Vec<f64> = Vec::with_capacity(self.count as usize);
        let mut last_error = None;
        for seq in 0..self.count {
            match pinger.ping(PingSequence(seq as u16), &payload).await {
                Ok((_, rtt)) => rtts.push(rtt.as_secs_f64() * 1000.0),
                Err(err) => last_error = Some(err.to_string()),
            }
        }

        let (status, loss, error) =
            summarize(self.count, &rtts, self.degraded_threshold, last_error);
        let mut result = new_result(
            monitor,
            started,
            status,
            error.as_ref().map(|e| e.message.clone()),
        );
        let (min, avg, max) = rtt_stats(&rtts);
        if let Some(avg_ms) = avg {
            result.response_time_ms = avg_ms as u64;
        }
        result.ping_result = Some(PingResult {
            packets_sent: self.count,
            packet_loss_percent: loss,
            min_rtt_ms: min,
            avg_rtt_ms: avg,
            max_rtt_ms: max,
        });
        Ok(Checked {
            result,
            error: error.map(|e| e.kind),
        })
    }

    async fn resolve(&self) -> Result<IpAddr, CheckError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(ip);
        }
        let addrs = tokio::net::lookup_host((self.host.as_str(), 0))
            .await
            .map_err(|e| {
                CheckError::new(
                    ErrorKind::Dns,
                    format!("failed to resolve {:?}: {}", self.host, e),
                )
            })?
            .map(|a| a.ip())
            .collect::<Vec<_>>();
        // prefer a family we can actually ping
        addrs
            .iter()
            .find(|ip| match ip {
                IpAddr::V4(_) => self.client_v4.is_some(),
                IpAddr::V6(_) => self.client_v6.is_some(),
            })
            .copied()
            .or_else(|| addrs.first().copied())
            .ok_or_else(|| {
                CheckError::new(
                    ErrorKind::Dns,
                    format!("no addresses for {:?}", self.host),
                )
            })
    }
}

fn rtt_stats(rtts: &[f64]) -> (Option<f64>, Option<f64>, Option<f64>) {
    if rtts.is_empty() {
        return (None, None, None);
    }
    let min = rtts.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = rtts.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
    (Some(min), Some(avg), Some(max))
}
