mod dns;
mod http;
mod ping;
mod tcp;

pub use dns::DnsProbe;
pub use http::HttpProbe;
pub use ping::PingProbe;
pub use tcp::TcpProbe;

use crate::metrics::Metrics;
use crate::models::{Monitor, MonitorKind, ProbeResult, ProbeStatus};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

// ─── Error taxonomy ─────────────────────────────────────────────────────────

/// Probe error categories, carried as the `error_type` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Connection,
    Dns,
    Tls,
    Status,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Dns => "dns",
            ErrorKind::Tls => "ssl",
            ErrorKind::Status => "status",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Classify an error message by substring, in fixed priority order:
    /// tls → timeout → connection → dns → status → unknown.
    pub fn classify(message: &str) -> ErrorKind {
        let m = message.to_ascii_lowercase();
        if ["tls", "ssl", "certificate"].iter().any(|s| m.contains(s)) {
            ErrorKind::Tls
        } else if ["timeout", "timed out", "deadline"].iter().any(|s| m.contains(s)) {
            ErrorKind::Timeout
        } else if ["connection", "connect", "refused", "unreachable", "reset", "broken pipe"]
            .iter()
            .any(|s| m.contains(s))
        {
            ErrorKind::Connection
        } else if ["dns", "resolve", "lookup", "no records", "name or service not known"]
            .iter()
            .any(|s| m.contains(s))
        {
            ErrorKind::Dns
        } else if ["status", "expected"].iter().any(|s| m.contains(s)) {
            ErrorKind::Status
        } else {
            ErrorKind::Unknown
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed probe error. The string form ends up in `ProbeResult.error` and
/// operator logs; the kind feeds the `error_type` metric label.
#[derive(Debug, Clone)]
pub struct CheckError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CheckError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> CheckError {
        CheckError {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CheckError {}

/// Render an error with its source chain, so classification sees the root
/// cause (`error sending request: connection refused`).
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}

// ─── Execution context ──────────────────────────────────────────────────────

/// Shared clients handed to executors at construction. Built once at startup;
/// cheap to clone into jobs.
pub struct ProbeContext {
    pub http: reqwest::Client,
    pub pinger_v4: Option<Arc<surge_ping::Client>>,
    pub pinger_v6: Option<Arc<surge_ping::Client>>,
    /// HTTPS probes log a warning when the certificate expires within this
    /// many days.
    pub ssl_expiry_warning_days: u32,
}

impl ProbeContext {
    pub fn new() -> Result<ProbeContext, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("hallmonitor/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(ProbeContext {
            http,
            pinger_v4: ping::make_client(surge_ping::ICMP::V4),
            pinger_v6: ping::make_client(surge_ping::ICMP::V6),
            ssl_expiry_warning_days: 30,
        })
    }
}

// ─── Dispatch ───────────────────────────────────────────────────────────────

/// One monitor bound to its protocol prober. The worker pool applies the
/// timeout; probers return promptly when their future is dropped.
pub struct Executor {
    monitor: Arc<Monitor>,
    prober: Prober,
}

enum Prober {
    Http(HttpProbe),
    Tcp(TcpProbe),
    Dns(DnsProbe),
    Ping(PingProbe),
    #[cfg(test)]
    Panic,
}

/// A finished probe: the result record plus the typed error category that
/// produced it, when any.
pub(crate) struct Checked {
    pub result: ProbeResult,
    pub error: Option<ErrorKind>,
}

impl Executor {
    pub fn build(monitor: Arc<Monitor>, ctx: &ProbeContext) -> Result<Executor, String> {
        let prober = match monitor.kind {
            MonitorKind::Http => Prober::Http(HttpProbe::new(
                &monitor,
                ctx.http.clone(),
                ctx.ssl_expiry_warning_days,
            )?),
            MonitorKind::Tcp => Prober::Tcp(TcpProbe::new(&monitor)?),
            MonitorKind::Dns => Prober::Dns(DnsProbe::new(&monitor)?),
            MonitorKind::Ping => Prober::Ping(PingProbe::new(
                &monitor,
                ctx.pinger_v4.clone(),
                ctx.pinger_v6.clone(),
            )?),
        };
        Ok(Executor { monitor, prober })
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// An executor that panics on every check, for worker isolation tests.
    #[cfg(test)]
    pub(crate) fn panicking(monitor: Arc<Monitor>) -> Executor {
        Executor {
            monitor,
            prober: Prober::Panic,
        }
    }

    /// Run one probe. `Ok` carries a result even for a failing target (a
    /// down result is data, not a fault); `Err` means no result could be
    /// produced and the worker synthesizes one.
    pub async fn check(&self, metrics: &Metrics) -> Result<ProbeResult, CheckError> {
        let checked = match &self.prober {
            Prober::Http(p) => p.check(&self.monitor).await?,
            Prober::Tcp(p) => p.check(&self.monitor).await?,
            Prober::Dns(p) => p.check(&self.monitor).await?,
            Prober::Ping(p) => p.check(&self.monitor).await?,
            #[cfg(test)]
            Prober::Panic => panic!("injected probe failure"),
        };
        emit(metrics, &self.monitor, &checked.result, checked.error);
        Ok(checked.result)
    }
}

/// Validate a resolved monitor's endpoint format without opening sockets.
/// Called by config validation before a monitor is admitted.
pub fn validate_monitor(monitor: &Monitor) -> Result<(), String> {
    match monitor.kind {
        MonitorKind::Http => http::validate(monitor),
        MonitorKind::Tcp => tcp::validate(monitor),
        MonitorKind::Dns => dns::validate(monitor),
        MonitorKind::Ping => ping::validate(monitor),
    }
}

// ─── Shared result plumbing ─────────────────────────────────────────────────

/// Populate the common fields of a result record.
pub(crate) fn new_result(
    monitor: &Monitor,
    started: Instant,
    status: ProbeStatus,
    error: Option<String>,
) -> ProbeResult {
    ProbeResult {
        monitor: monitor.name.clone(),
        kind: monitor.kind,
        group: monitor.group.clone(),
        status,
        response_time_ms: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
        error,
        http_result: None,
        tcp_result: None,
        dns_result: None,
        ping_result: None,
        metadata: monitor.labels.clone(),
    }
}

/// Emit the per-probe telemetry: a per-kind latency observation, the
/// monitor-status gauge, and an error counter when the probe failed.
pub fn emit(metrics: &Metrics, monitor: &Monitor, result: &ProbeResult, error: Option<ErrorKind>) {
    let name = monitor.name.as_str();
    let group = monitor.group.as_str();
    let seconds = result.response_time_ms as f64 / 1000.0;

    match result.kind {
        MonitorKind::Http => {
            metrics
                .http_response_time
                .with_label_values(&[name, group])
                .observe(seconds);
        }
        MonitorKind::Tcp => {
            let port = result
                .tcp_result
                .as_ref()
                .map(|t| t.port.to_string())
                .unwrap_or_default();
            metrics
                .tcp_response_time
                .with_label_values(&[name, group, &port])
                .observe(seconds);
        }
        MonitorKind::Dns => {
            let query_type = result
                .dns_result
                .as_ref()
                .map(|d| d.query_type.clone())
                .unwrap_or_default();
            let server = monitor.target.clone().unwrap_or_default();
            metrics
                .dns_response_time
                .with_label_values(&[name, group, &query_type, &server])
                .observe(seconds);
            if let Some(dns) = &result.dns_result {
                metrics
                    .dns_response_code
                    .with_label_values(&[name, group, &query_type, &dns.response_code.to_string()])
                    .inc();
            }
        }
        MonitorKind::Ping => {
            metrics
                .ping_response_time
                .with_label_values(&[name, group])
                .observe(seconds);
        }
    }

    let up = if result.status == ProbeStatus::Down { 0 } else { 1 };
    metrics
        .monitor_up
        .with_label_values(&[name, monitor.kind.as_str(), group])
        .set(up);

    let error = error.or_else(|| result.error.as_deref().map(ErrorKind::classify));
    if let Some(kind) = error {
        metrics
            .check_errors
            .with_label_values(&[name, monitor.kind.as_str(), group, kind.as_str()])
            .inc();
    }
}

/// Synthesize a `down` result for an executor error that produced none, and
/// record its telemetry.
pub fn synthesize_failure(
    metrics: &Metrics,
    monitor: &Monitor,
    started: Instant,
    error: &CheckError,
) -> ProbeResult {
    let result = new_result(
        monitor,
        started,
        ProbeStatus::Down,
        Some(error.message.clone()),
    );
    emit(metrics, monitor, &result, Some(error.kind));
    result
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_priority_order() {
        assert_eq!(ErrorKind::classify("TLS handshake failed"), ErrorKind::Tls);
        assert_eq!(
            ErrorKind::classify("certificate has expired"),
            ErrorKind::Tls
        );
        // tls wins over connection even when both appear
        assert_eq!(
            ErrorKind::classify("connection closed during TLS handshake"),
            ErrorKind::Tls
        );
        assert_eq!(ErrorKind::classify("request timed out"), ErrorKind::Timeout);
        assert_eq!(
            ErrorKind::classify("connection refused"),
            ErrorKind::Connection
        );
        assert_eq!(
            ErrorKind::classify("failed to lookup address information"),
            ErrorKind::Dns
        );
        assert_eq!(
            ErrorKind::classify("expected 200, got 500"),
            ErrorKind::Status
        );
        assert_eq!(ErrorKind::classify("something odd"), ErrorKind::Unknown);
    }

    #[test]
    fn every_message_maps_to_exactly_one_category() {
        let samples = [
            "deadline exceeded",
            "certificate verify failed",
            "host unreachable",
            "no records found for A example.com",
            "Expected 204, got 200",
            "",
            "garbage",
        ];
        for s in samples {
            // classify is total: any string yields one of the six kinds
            let kind = ErrorKind::classify(s);
            assert!(matches!(
                kind,
                ErrorKind::Timeout
                    | ErrorKind::Connection
                    | ErrorKind::Dns
                    | ErrorKind::Tls
                    | ErrorKind::Status
                    | ErrorKind::Unknown
            ));
        }
    }
}
