use super::{new_result, CheckError, Checked, ErrorKind};
use crate::models::{DnsResult, Monitor, ProbeStatus};
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::{Name, TokioAsyncResolver};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

pub const SUPPORTED_RECORD_TYPES: &[&str] = &["A", "AAAA", "CNAME", "MX", "TXT", "NS"];

const DEFAULT_DNS_PORT: u16 = 53;

/// DNS probe: queries a specific server (`target`, `host[:port]`) for one
/// record of `query`. `up` requires at least one answer and, when
/// `expectedResponse` is set, that it appears in the answer set.
pub struct DnsProbe {
    server_host: String,
    server_port: u16,
    query: String,
    query_type: String,
    expected: Option<String>,
}

pub(super) fn validate(monitor: &Monitor) -> Result<(), String> {
    parse_target(monitor.target.as_deref().unwrap_or(""))?;
    let query = monitor.query.as_deref().unwrap_or("");
    Name::from_ascii(query).map_err(|e| format!("invalid query {:?}: {}", query, e))?;
    let qt = monitor.query_type.as_deref().unwrap_or("A");
    if !SUPPORTED_RECORD_TYPES.contains(&qt) {
        return Err(format!(
            "unsupported record type {:?} (supported: {})",
            qt,
            SUPPORTED_RECORD_TYPES.join(", ")
        ));
    }
    Ok(())
}

/// Split a DNS server target into host and port; the port defaults to 53.
pub fn parse_target(target: &str) -> Result<(String, u16), String> {
    if target.is_empty() {
        return Err("empty dns target".into());
    }
    // bare IPv6 address without brackets
    if target.parse::<IpAddr>().is_ok() {
        return Ok((target.to_string(), DEFAULT_DNS_PORT));
    }
    if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| format!("invalid target {:?}: unterminated '['", target))?;
        let port = match rest.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| format!("invalid target {:?}: bad port", target))?,
            None if rest.is_empty() => DEFAULT_DNS_PORT,
            None => return Err(format!("invalid target {:?}", target)),
        };
        return Ok((host.to_string(), port));
    }
    match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| format!("invalid target {:?}: bad port", target))?;
            if host.is_empty() {
                return Err(format!("invalid target {:?}: empty host", target));
            }
            Ok((host.to_string(), port))
        }
        None => Ok((target.to_string(), DEFAULT_DNS_PORT)),
    }
}

/// Map a resolver error onto a DNS response code: not-found → 3 (NXDOMAIN),
/// timeout or temporary failure → 2 (SERVFAIL), anything else → 2.
fn response_code_for(err: &ResolveError) -> u8 {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => 3,
        _ => 2,
    }
}

/// Case-insensitive answer comparison, tolerant of trailing dots on names.
fn answer_matches(expected: &str, answers: &[String]) -> bool {
    let expected = expected.to_lowercase();
    let expected = expected.trim_end_matches('.');
    answers
        .iter()
        .any(|a| a.to_lowercase().trim_end_matches('.') == expected)
}

impl DnsProbe {
    pub fn new(monitor: &Monitor) -> Result<DnsProbe, String> {
        let (server_host, server_port) = parse_target(monitor.target.as_deref().unwrap_or(""))?;
        let query_type = monitor
            .query_type
            .clone()
            .unwrap_or_else(|| "A".to_string());
        if !SUPPORTED_RECORD_TYPES.contains(&query_type.as_str()) {
            return Err(format!("unsupported record type {:?}", query_type));
        }
        Ok(DnsProbe {
            server_host,
            server_port,
            query: monitor.query.clone().unwrap_or_default(),
            query_type,
            expected: monitor.expected_response.clone(),
        })
    }

    pub async fn check(&self, monitor: &Monitor) -> Result<Checked, CheckError> {
        let started = Instant::now();

        let server = match self.server_addr().await {
            Ok(addr) => addr,
            Err(message) => {
                return Ok(self.finish(
                    monitor,
                    started,
                    2,
                    Vec::new(),
                    Some(CheckError::new(ErrorKind::Dns, message)),
                ));
            }
        };

        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(server, Protocol::Udp));
        let mut opts = ResolverOpts::default();
        opts.timeout = monitor.timeout;
        let resolver = TokioAsyncResolver::tokio(config, opts);

        match lookup(&resolver, &self.query, &self.query_type).await {
            Ok(answers) => {
                let error = if answers.is_empty() {
                    Some(CheckError::new(
                        ErrorKind::Dns,
                        format!("no {} records found for {}", self.query_type, self.query),
                    ))
                } else if let Some(expected) = &self.expected {
                    if answer_matches(expected, &answers) {
                        None
                    } else {
                        Some(CheckError::new(
                            ErrorKind::Status,
                            format!("expected {:?} in answers, got: {}", expected, answers.join(", ")),
                        ))
                    }
                } else {
                    None
                };
                Ok(self.finish(monitor, started, 0, answers, error))
            }
            Err(err) => {
                let code = response_code_for(&err);
                let kind = match err.kind() {
                    ResolveErrorKind::Timeout => ErrorKind::Timeout,
                    _ => ErrorKind::Dns,
                };
                Ok(self.finish(
                    monitor,
                    started,
                    code,
                    Vec::new(),
                    Some(CheckError::new(kind, err.to_string())),
                ))
            }
        }
    }

    async fn server_addr(&self) -> Result<SocketAddr, String> {
        if let Ok(ip) = self.server_host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.server_port));
        }
        let mut addrs =
            tokio::net::lookup_host((self.server_host.as_str(), self.server_port))
                .await
                .map_err(|e| format!("failed to resolve dns server {:?}: {}", self.server_host, e))?;
        addrs
            .next()
            .ok_or_else(|| format!("no addresses for dns server {:?}", self.server_host))
    }

    fn finish(
        &self,
        monitor: &Monitor,
        started: Instant,
        response_code: u8,
        answers: Vec<String>,
        error: Option<CheckError>,
    ) -> Checked {
        let status = if error.is_none() {
            ProbeStatus::Up
        } else {
            ProbeStatus::Down
        };
        let mut result = new_result(
            monitor,
            started,
            status,
            error.as_ref().map(|e| e.message.clone()),
        );
        result.dns_result = Some(DnsResult {
            query_type: self.query_type.clone(),
            response_code,
            response_bytes: answers.iter().map(|a| a.len() as u64).sum(),
            answers,
        });
        Checked {
            result,
            error: error.map(|e| e.kind),
        }
    }
}

async fn lookup(
    resolver: &TokioAsyncResolver,
    query: &str,
    record_type: &str,
) -> Result<Vec<String>, ResolveError> {
    match record_type {
        "A" => {
            let response = resolver.ipv4_lookup(query).await?;
            Ok(response.iter().map(|ip| ip.to_string()).collect())
        }
        "AAAA" => {
            let response = resolver.ipv6_lookup(query).await?;
            Ok(response.iter().map(|ip| ip.to_string()).collect())
        }
        "MX" => {
            let response = resolver.mx_lookup(query).await?;
            Ok(response
                .iter()
                .map(|mx| format!("{} {}", mx.preference(), mx.exchange()))
                .collect())
        }
        "TXT" => {
            let response = resolver.txt_lookup(query).await?;
            Ok(response.iter().map(|txt| txt.to_string()).collect())
        }
        "NS" => {
            let response = resolver.ns_lookup(query).await?;
            Ok(response.iter().map(|ns| ns.to_string()).collect())
        }
        // validated at admission; CNAME is the only remaining type
        _ => {
            let name = Name::from_ascii(query)?;
            let response = resolver.lookup(name, RecordType::CNAME).await?;
            Ok(response.iter().map(|r| r.to_string()).collect())
        }
    }
}
