use super::{error_chain, new_result, CheckError, Checked, ErrorKind};
use crate::models::{HttpResult, Monitor, ProbeStatus};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Ceiling for the certificate peek so a hung TLS endpoint cannot stretch
/// the probe to its full timeout twice.
const TLS_PEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP(S) probe: one request, result is `up` iff the response code matches
/// the expectation. HTTPS targets also record the leaf certificate expiry.
pub struct HttpProbe {
    url: reqwest::Url,
    method: Method,
    expected_status: u16,
    headers: HeaderMap,
    client: reqwest::Client,
    expiry_warning_days: u32,
}

pub(super) fn validate(monitor: &Monitor) -> Result<(), String> {
    let url = parse_url(monitor.url.as_deref().unwrap_or(""))?;
    if url.host_str().is_none() {
        return Err(format!("url {:?} has no host", url.as_str()));
    }
    parse_method(monitor.method.as_deref())?;
    build_headers(monitor).map(|_| ())
}

fn parse_url(raw: &str) -> Result<reqwest::Url, String> {
    let url = reqwest::Url::parse(raw).map_err(|e| format!("invalid url {:?}: {}", raw, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported url scheme {:?}", other)),
    }
}

fn parse_method(raw: Option<&str>) -> Result<Method, String> {
    match raw {
        None => Ok(Method::GET),
        Some(m) => Method::from_bytes(m.as_bytes()).map_err(|_| format!("invalid method {:?}", m)),
    }
}

fn build_headers(monitor: &Monitor) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    for (key, value) in &monitor.headers {
        let name = HeaderName::try_from(key.as_str())
            .map_err(|_| format!("invalid header name {:?}", key))?;
        let value = HeaderValue::try_from(value.as_str())
            .map_err(|_| format!("invalid value for header {:?}", key))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

impl HttpProbe {
    pub fn new(
        monitor: &Monitor,
        client: reqwest::Client,
        expiry_warning_days: u32,
    ) -> Result<HttpProbe, String> {
        Ok(HttpProbe {
            url: parse_url(monitor.url.as_deref().unwrap_or(""))?,
            method: parse_method(monitor.method.as_deref())?,
            expected_status: monitor.expected_status.unwrap_or(200),
            headers: build_headers(monitor)?,
            client,
            expiry_warning_days,
        })
    }

    pub async fn check(&self, monitor: &Monitor) -> Result<Checked, CheckError> {
        let started = Instant::now();
        let request = self
            .client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone())
            .timeout(monitor.timeout);

        match request.send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                let body_bytes = match response.bytes().await {
                    Ok(body) => Some(body.len() as u64),
                    Err(_) => None,
                };
                let tls_not_after = if self.url.scheme() == "https" {
                    let not_after = peek_tls_not_after(&self.url, monitor.timeout).await;
                    if let Some(not_after) = not_after {
                        let days_left = (not_after - Utc::now()).num_days();
                        if days_left < i64::from(self.expiry_warning_days) {
                            warn!(
                                monitor = %monitor.name,
                                days_left,
                                "certificate approaching expiry"
                            );
                        }
                    }
                    not_after
                } else {
                    None
                };

                let (status, error) = if code == self.expected_status {
                    (ProbeStatus::Up, None)
                } else {
                    (
                        ProbeStatus::Down,
                        Some(CheckError::new(
                            ErrorKind::Status,
                            format!("expected status {}, got {}", self.expected_status, code),
                        )),
                    )
                };

                let mut result = new_result(
                    monitor,
                    started,
                    status,
                    error.as_ref().map(|e| e.message.clone()),
                );
                result.http_result = Some(HttpResult {
                    status_code: Some(code),
                    body_bytes,
                    tls_not_after,
                });
                Ok(Checked {
                    result,
                    error: error.map(|e| e.kind),
                })
            }
            Err(err) => {
                let message = error_chain(&err);
                let kind = if err.is_timeout() {
                    ErrorKind::Timeout
                } else if err.is_connect() {
                    ErrorKind::Connection
                } else {
                    ErrorKind::classify(&message)
                };
                let mut result = new_result(monitor, started, ProbeStatus::Down, Some(message));
                result.http_result = Some(HttpResult {
                    status_code: None,
                    body_bytes: None,
                    tls_not_after: None,
                });
                Ok(Checked {
                    result,
                    error: Some(kind),
                })
            }
        }
    }
}

/// Open a short TLS session to read the leaf certificate's not-after.
/// Best-effort: any failure simply leaves the field unset.
async fn peek_tls_not_after(url: &reqwest::Url, timeout: Duration) -> Option<DateTime<Utc>> {
    let host = url.host_str()?.to_string();
    let port = url.port().unwrap_or(443);
    let deadline = timeout.min(TLS_PEEK_TIMEOUT);
    match tokio::time::timeout(deadline, tls_not_after(host.clone(), port)).await {
        Ok(Some(ts)) => Some(ts),
        Ok(None) => None,
        Err(_) => {
            debug!(host, "certificate peek timed out");
            None
        }
    }
}

async fn tls_not_after(host: String, port: u16) -> Option<DateTime<Utc>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let stream = TcpStream::connect((host.as_str(), port)).await.ok()?;
    let server_name = ServerName::try_from(host).ok()?;
    let tls = connector.connect(server_name, stream).await.ok()?;
    let (_, session) = tls.get_ref();
    let cert = session.peer_certificates()?.first()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    DateTime::<Utc>::from_timestamp(parsed.validity().not_after.timestamp(), 0)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::monitor;
    use super::*;
    use crate::models::MonitorKind;
    use httpmock::prelude::*;

    fn http_monitor(url: String) -> Monitor {
        let mut m = monitor(MonitorKind::Http, "web");
        m.url = Some(url);
        m.method = Some("GET".into());
        m.expected_status = Some(200);
        m
    }

    #[test]
    fn rejects_bad_urls_methods_and_headers() {
        let mut m = http_monitor("not a url".into());
        assert!(validate(&m).is_err());

        m.url = Some("ftp://example.com".into());
        assert!(validate(&m).is_err());

        m.url = Some("https://example.com".into());
        m.method = Some("G E T".into());
        assert!(validate(&m).is_err());

        m.method = Some("HEAD".into());
        m.headers.insert("bad name".into(), "x".into());
        assert!(validate(&m).is_err());
    }

    #[tokio::test]
    async fn matching_status_reports_up() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200).body("ok");
            })
            .await;

        let m = http_monitor(server.url("/health"));
        let probe = HttpProbe::new(&m, reqwest::Client::new(), 30).unwrap();
        let checked = probe.check(&m).await.unwrap();

        mock.assert_async().await;
        assert_eq!(checked.result.status, ProbeStatus::Up);
        let http = checked.result.http_result.unwrap();
        assert_eq!(http.status_code, Some(200));
        assert_eq!(http.body_bytes, Some(2));
    }

    #[tokio::test]
    async fn status_mismatch_reports_down_with_status_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(500);
            })
            .await;

        let m = http_monitor(server.url("/health"));
        let probe = HttpProbe::new(&m, reqwest::Client::new(), 30).unwrap();
        let checked = probe.check(&m).await.unwrap();

        assert_eq!(checked.result.status, ProbeStatus::Down);
        assert_eq!(checked.error, Some(ErrorKind::Status));
        assert!(checked
            .result
            .error
            .unwrap()
            .contains("expected status 200, got 500"));
    }

    #[tokio::test]
    async fn configured_headers_are_sent() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/auth")
                    .header("authorization", "Bearer tok");
                then.status(200);
            })
            .await;

        let mut m = http_monitor(server.url("/auth"));
        m.headers
            .insert("authorization".into(), "Bearer tok".into());
        let probe = HttpProbe::new(&m, reqwest::Client::new(), 30).unwrap();
        let checked = probe.check(&m).await.unwrap();

        mock.assert_async().await;
        assert_eq!(checked.result.status, ProbeStatus::Up);
    }
}
