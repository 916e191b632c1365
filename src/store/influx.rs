use super::{Capabilities, RetentionPolicy, StorageBackend, StoreError};
use crate::config::InfluxConfig;
use crate::models::{AggregateRecord, MonitorKind, PeriodType, ProbeResult, ProbeStatus};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;

/// InfluxDB v2 backend. Results are written as the `monitor_result`
/// measurement with tags `{monitor, type, status}` and fields
/// `{response_time_ms, status_code?, error_message?}`; reads go through the
/// Flux query API. Aggregation and metadata are left to Influx-native tasks,
/// so those operations report the unsupported sentinel, and retention rides
/// on the bucket's own policy.
pub struct InfluxStore {
    client: reqwest::Client,
    url: String,
    org: String,
    bucket: String,
    token: String,
}

fn backend_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn escape_tag(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_field_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn escape_flux_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// One line of InfluxDB line protocol for a result.
fn to_line(result: &ProbeResult) -> String {
    let mut fields = format!("response_time_ms={}i", result.response_time_ms);
    if let Some(code) = result.http_result.as_ref().and_then(|h| h.status_code) {
        fields.push_str(&format!(",status_code={}i", code));
    }
    if let Some(error) = &result.error {
        fields.push_str(&format!(",error_message=\"{}\"", escape_field_string(error)));
    }
    format!(
        "monitor_result,monitor={},type={},status={} {} {}",
        escape_tag(&result.monitor),
        result.kind.as_str(),
        result.status.as_str(),
        fields,
        result.timestamp.timestamp_nanos_opt().unwrap_or_default()
    )
}

/// Split one CSV line, honoring double-quoted fields with `""` escapes.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' => quoted = true,
            ',' if !quoted => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// Parse annotated CSV from the Flux API into rows keyed by column name.
fn parse_annotated_csv(body: &str) -> Vec<HashMap<String, String>> {
    let mut rows = Vec::new();
    let mut header: Option<Vec<String>> = None;
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            header = None;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        match &header {
            None => header = Some(split_csv_line(line)),
            Some(columns) => {
                let values = split_csv_line(line);
                rows.push(
                    columns
                        .iter()
                        .cloned()
                        .zip(values)
                        .collect::<HashMap<_, _>>(),
                );
            }
        }
    }
    rows
}

fn row_to_result(row: &HashMap<String, String>) -> Option<ProbeResult> {
    let timestamp = DateTime::parse_from_rfc3339(row.get("_time")?)
        .ok()?
        .with_timezone(&Utc);
    let kind = match row.get("type").map(String::as_str) {
        Some("http") => MonitorKind::Http,
        Some("tcp") => MonitorKind::Tcp,
        Some("dns") => MonitorKind::Dns,
        Some("ping") => MonitorKind::Ping,
        _ => MonitorKind::Http,
    };
    let status = match row.get("status").map(String::as_str) {
        Some("up") => ProbeStatus::Up,
        Some("degraded") => ProbeStatus::Degraded,
        _ => ProbeStatus::Down,
    };
    let response_time_ms = row
        .get("response_time_ms")
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0) as u64;
    let status_code = row
        .get("status_code")
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v as u16);
    let error = row
        .get("error_message")
        .filter(|v| !v.is_empty())
        .cloned();
    Some(ProbeResult {
        monitor: row.get("monitor")?.clone(),
        kind,
        group: String::new(),
        status,
        response_time_ms,
        timestamp,
        error,
        http_result: status_code.map(|code| crate::models::HttpResult {
            status_code: Some(code),
            body_bytes: None,
            tls_not_after: None,
        }),
        tcp_result: None,
        dns_result: None,
        ping_result: None,
        metadata: HashMap::new(),
    })
}

impl InfluxStore {
    pub fn new(config: &InfluxConfig) -> Result<InfluxStore, StoreError> {
        if config.url.is_empty() || config.bucket.is_empty() {
            return Err(StoreError::Backend(
                "influxdb backend requires `url` and `bucket`".into(),
            ));
        }
        Ok(InfluxStore {
            client: reqwest::Client::new(),
            url: config.url.trim_end_matches('/').to_string(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
        })
    }

    async fn query(&self, flux: String) -> Result<Vec<HashMap<String, String>>, StoreError> {
        let response = self
            .client
            .post(format!("{}/api/v2/query", self.url))
            .query(&[("org", self.org.as_str())])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "application/vnd.flux")
            .header("Accept", "application/csv")
            .body(flux)
            .send()
            .await
            .map_err(backend_err)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!(
                "influx query failed with {}: {}",
                status, body
            )));
        }
        let body = response.text().await.map_err(backend_err)?;
        Ok(parse_annotated_csv(&body))
    }

    async fn query_results(
        &self,
        monitor: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProbeResult>, StoreError> {
        let mut flux = format!(
            "from(bucket: \"{}\")\n\
             |> range(start: {}, stop: {})\n\
             |> filter(fn: (r) => r._measurement == \"monitor_result\" and r.monitor == \"{}\")\n\
             |> pivot(rowKey: [\"_time\"], columnKey: [\"_field\"], valueColumn: \"_value\")\n\
             |> sort(columns: [\"_time\"], desc: true)\n",
            escape_flux_string(&self.bucket),
            start.to_rfc3339_opts(SecondsFormat::Nanos, true),
            (end + chrono::Duration::nanoseconds(1)).to_rfc3339_opts(SecondsFormat::Nanos, true),
            escape_flux_string(monitor),
        );
        if limit > 0 {
            flux.push_str(&format!("|> limit(n: {})\n", limit));
        }
        let rows = self.query(flux).await?;
        Ok(rows
            .iter()
            .filter_map(row_to_result)
            .filter(|r| r.timestamp > start && r.timestamp <= end)
            .collect())
    }
}

#[async_trait]
impl StorageBackend for InfluxStore {
    fn name(&self) -> &'static str {
        "influxdb"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_aggregation: false,
            supports_retention: true,
            supports_raw_results: true,
            read_only: false,
        }
    }

    async fn store_result(&self, result: &ProbeResult) -> Result<(), StoreError> {
        let response = self
            .client
            .post(format!("{}/api/v2/write", self.url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .body(to_line(result))
            .send()
            .await
            .map_err(backend_err)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Backend(format!(
                "influx write failed with {}: {}",
                status, body
            )));
        }
        Ok(())
    }

    async fn latest_result(&self, monitor: &str) -> Result<Option<ProbeResult>, StoreError> {
        let now = Utc::now();
        let results = self
            .query_results(monitor, now - chrono::Duration::days(30), now, 1)
            .await?;
        Ok(results.into_iter().next())
    }

    async fn results_in_range(
        &self,
        monitor: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProbeResult>, StoreError> {
        self.query_results(monitor, start, end, limit).await
    }

    async fn store_aggregate(&self, _aggregate: &AggregateRecord) -> Result<(), StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn aggregates_in_range(
        &self,
        _monitor: &str,
        _period_type: PeriodType,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<AggregateRecord>, StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn monitor_names(&self) -> Result<Vec<String>, StoreError> {
        let flux = format!(
            "import \"influxdata/influxdb/schema\"\n\
             schema.tagValues(bucket: \"{}\", tag: \"monitor\")\n",
            escape_flux_string(&self.bucket)
        );
        let rows = self.query(flux).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("_value").cloned())
            .collect())
    }

    async fn set_metadata(&self, _key: &str, _value: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn get_metadata(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError::Unsupported)
    }

    async fn prune(&self, _policy: &RetentionPolicy, _now: DateTime<Utc>) -> Result<u64, StoreError> {
        // bucket retention policies handle expiry natively
        Ok(0)
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{result_at, ts};
    use super::*;

    #[test]
    fn line_protocol_escapes_tags_and_fields() {
        let mut r = result_at("my monitor,prod", ts(0), ProbeStatus::Down);
        r.error = Some("said \"no\"".into());
        let line = to_line(&r);
        assert!(line.starts_with("monitor_result,monitor=my\\ monitor\\,prod,type=tcp,status=down "));
        assert!(line.contains("response_time_ms=5i"));
        assert!(line.contains("error_message=\"said \\\"no\\\"\""));
    }

    #[test]
    fn annotated_csv_parses_into_rows() {
        let body = "\
#datatype,string,long,dateTime:RFC3339,string,string,string,double\n\
#group,false,false,false,true,true,true,false\n\
#default,_result,,,,,,\n\
,result,table,_time,monitor,type,status,response_time_ms\n\
,_result,0,2024-05-01T10:00:00Z,web,http,up,42\n\
,_result,0,2024-05-01T10:01:00Z,web,http,down,0\n";
        let rows = parse_annotated_csv(body);
        assert_eq!(rows.len(), 2);
        let first = row_to_result(&rows[0]).unwrap();
        assert_eq!(first.monitor, "web");
        assert_eq!(first.status, ProbeStatus::Up);
        assert_eq!(first.response_time_ms, 42);
        let second = row_to_result(&rows[1]).unwrap();
        assert_eq!(second.status, ProbeStatus::Down);
    }

    #[test]
    fn csv_quoting_is_honored() {
        assert_eq!(
            split_csv_line(r#"a,"b,c","say ""hi""",d"#),
            vec!["a", "b,c", "say \"hi\"", "d"]
        );
    }
}
