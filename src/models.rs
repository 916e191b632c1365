use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

// ─── Monitor ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorKind {
    Http,
    Tcp,
    Dns,
    Ping,
}

impl MonitorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorKind::Http => "http",
            MonitorKind::Tcp => "tcp",
            MonitorKind::Dns => "dns",
            MonitorKind::Ping => "ping",
        }
    }
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully-resolved monitor definition. Produced by config validation —
/// defaults applied, durations parsed, header placeholders expanded.
#[derive(Debug, Clone, Serialize)]
pub struct Monitor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MonitorKind,
    pub group: String,
    pub enabled: bool,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    // http
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<u16>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    // tcp / ping / dns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    // dns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_response: Option<String>,

    // ping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_count: Option<u32>,
    /// Loss percentage above which a partially-lossy ping probe reports
    /// `degraded` instead of `up`. Absent means partial loss is still `up`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_threshold: Option<f64>,
}

/// Serialize std Durations as whole seconds, matching the config surface.
mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

// ─── Probe results ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Up,
    Down,
    Degraded,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Up => "up",
            ProbeStatus::Down => "down",
            ProbeStatus::Degraded => "degraded",
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, ProbeStatus::Up)
    }
}

/// The record produced by one probe of one monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub monitor: String,
    pub kind: MonitorKind,
    #[serde(default)]
    pub group: String,
    pub status: ProbeStatus,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_result: Option<HttpResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_result: Option<TcpResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_result: Option<DnsResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_result: Option<PingResult>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_bytes: Option<u64>,
    /// Not-after of the leaf certificate, HTTPS targets only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_not_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpResult {
    pub port: u16,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsResult {
    pub query_type: String,
    /// DNS response code: 0 NOERROR, 2 SERVFAIL, 3 NXDOMAIN.
    pub response_code: u8,
    pub answers: Vec<String>,
    pub response_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub packets_sent: u32,
    pub packet_loss_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_rtt_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_rtt_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rtt_ms: Option<f64>,
}

// ─── Aggregates ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Hour,
    Day,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Hour => "hour",
            PeriodType::Day => "day",
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pre-computed roll-up of raw results over one whole hour or day.
/// `(monitor, period_type, period_start)` is unique; re-aggregation upserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub monitor: String,
    pub period_type: PeriodType,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_checks: u64,
    pub up_checks: u64,
    pub down_checks: u64,
    pub uptime_percent: f64,
    pub avg_response_ms: f64,
    pub min_response_ms: u64,
    pub max_response_ms: u64,
}

impl AggregateRecord {
    /// Compute an aggregate from the raw results of one window.
    /// Returns `None` for an empty window — empty aggregates are not stored.
    pub fn from_results(
        monitor: &str,
        period_type: PeriodType,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        results: &[ProbeResult],
    ) -> Option<Self> {
        if results.is_empty() {
            return None;
        }
        let total = results.len() as u64;
        let up = results.iter().filter(|r| r.status.is_up()).count() as u64;
        let down = results
            .iter()
            .filter(|r| r.status == ProbeStatus::Down)
            .count() as u64;
        let sum: u64 = results.iter().map(|r| r.response_time_ms).sum();
        let min = results.iter().map(|r| r.response_time_ms).min().unwrap_or(0);
        let max = results.iter().map(|r| r.response_time_ms).max().unwrap_or(0);
        Some(AggregateRecord {
            monitor: monitor.to_string(),
            period_type,
            period_start,
            period_end,
            total_checks: total,
            up_checks: up,
            down_checks: down,
            uptime_percent: up as f64 / total as f64 * 100.0,
            avg_response_ms: sum as f64 / total as f64,
            min_response_ms: min,
            max_response_ms: max,
        })
    }
}

// ─── API views ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct UptimeStats {
    pub monitor: String,
    pub period: String,
    pub uptime_percent: f64,
    pub total_checks: u64,
    pub up_checks: u64,
    pub down_checks: u64,
}

#[derive(Debug, Serialize)]
pub struct MonitorWithLatest {
    #[serde(flatten)]
    pub monitor: Monitor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_result: Option<ProbeResult>,
}

#[derive(Debug, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub monitor_count: usize,
    pub up_count: usize,
    pub down_count: usize,
}
