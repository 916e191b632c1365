use super::{error_chain, new_result, CheckError, Checked, ErrorKind};
use crate::models::{Monitor, ProbeStatus, TcpResult};
use std::time::Instant;
use tokio::net::TcpStream;

/// TCP connect probe. Accepts `host:port`, `ipv4:port` and `[ipv6]:port`
/// targets; the connection is closed immediately on success.
pub struct TcpProbe {
    addr: String,
    port: u16,
}

pub(super) fn validate(monitor: &Monitor) -> Result<(), String> {
    parse_target(monitor.target.as_deref().unwrap_or("")).map(|_| ())
}

/// Split a TCP target into host and port, rejecting out-of-range ports.
pub fn parse_target(target: &str) -> Result<(String, u16), String> {
    let (host, port_str) = if let Some(rest) = target.strip_prefix('[') {
        // [ipv6]:port
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| format!("invalid target {:?}: unterminated '['", target))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| format!("invalid target {:?}: missing port", target))?;
        (host, port)
    } else {
        target
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid target {:?}: expected host:port", target))?
    };
    if host.is_empty() {
        return Err(format!("invalid target {:?}: empty host", target));
    }
    let port: u32 = port_str
        .parse()
        .map_err(|_| format!("invalid target {:?}: bad port {:?}", target, port_str))?;
    if port < 1 || port > 65535 {
        return Err(format!("invalid target {:?}: port out of range", target));
    }
    Ok((host.to_string(), port as u16))
}

impl TcpProbe {
    pub fn new(monitor: &Monitor) -> Result<TcpProbe, String> {
        let target = monitor.target.as_deref().unwrap_or("");
        let (host, port) = parse_target(target)?;
        let addr = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        Ok(TcpProbe { addr, port })
    }

    pub async fn check(&self, monitor: &Monitor) -> Result<Checked, CheckError> {
        let started = Instant::now();
        match TcpStream::connect(&self.addr).await {
            Ok(stream) => {
                drop(stream);
                let mut result = new_result(monitor, started, ProbeStatus::Up, None);
                result.tcp_result = Some(TcpResult {
                    port: self.port,
                    connected: true,
                });
                Ok(Checked {
                    result,
                    error: None,
                })
            }
            Err(err) => {
                let message = error_chain(&err);
                let kind = ErrorKind::classify(&message);
                let mut result =
                    new_result(monitor, started, ProbeStatus::Down, Some(message));
                result.tcp_result = Some(TcpResult {
                    port: self.port,
                    connected: false,
                });
                Ok(Checked {
                    result,
                    error: Some(kind),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::monitor;
    use super::*;
    use crate::models::MonitorKind;
    use tokio::net::TcpListener;

    #[test]
    fn parses_hostname_and_ip_targets() {
        assert_eq!(
            parse_target("example.com:443").unwrap(),
            ("example.com".into(), 443)
        );
        assert_eq!(
            parse_target("192.168.1.10:22").unwrap(),
            ("192.168.1.10".into(), 22)
        );
        assert_eq!(parse_target("[::1]:8080").unwrap(), ("::1".into(), 8080));
    }

    #[test]
    fn rejects_malformed_targets() {
        assert!(parse_target("example.com").is_err());
        assert!(parse_target(":443").is_err());
        assert!(parse_target("host:0").is_err());
        assert!(parse_target("host:65536").is_err());
        assert!(parse_target("host:http").is_err());
        assert!(parse_target("[::1").is_err());
        assert!(parse_target("[::1]8080").is_err());
    }

    #[tokio::test]
    async fn connect_to_bound_listener_reports_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut m = monitor(MonitorKind::Tcp, "local");
        m.target = Some(format!("127.0.0.1:{}", port));
        let probe = TcpProbe::new(&m).unwrap();

        let checked = probe.check(&m).await.unwrap();
        assert_eq!(checked.result.status, ProbeStatus::Up);
        let tcp = checked.result.tcp_result.unwrap();
        assert_eq!(tcp.port, port);
        assert!(tcp.connected);
    }

    #[tokio::test]
    async fn connect_to_closed_port_reports_down_as_connection_error() {
        // Bind then drop to find a port that is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut m = monitor(MonitorKind::Tcp, "closed");
        m.target = Some(format!("127.0.0.1:{}", port));
        let probe = TcpProbe::new(&m).unwrap();

        let checked = probe.check(&m).await.unwrap();
        assert_eq!(checked.result.status, ProbeStatus::Down);
        assert_eq!(checked.error, Some(ErrorKind::Connection));
        assert!(!checked.result.tcp_result.unwrap().connected);
    }
}
