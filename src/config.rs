use crate::models::{Monitor, MonitorKind};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 7878;
pub const MAX_TIMEOUT: Duration = Duration::from_secs(300);
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ─── Top level ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
    pub monitoring: MonitoringConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_dashboard: bool,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            enable_dashboard: false,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub path: String,
    pub include_process_metrics: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: true,
            path: "/metrics".into(),
            include_process_metrics: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// `stdout` or a file path.
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            format: LogFormat::Text,
            output: "stdout".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringConfig {
    #[serde(
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub default_interval: Duration,
    #[serde(
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub default_timeout: Duration,
    #[serde(rename = "defaultSSLCertExpiryWarningDays")]
    pub default_ssl_cert_expiry_warning_days: u32,
    pub groups: Vec<GroupConfig>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            default_interval: Duration::from_secs(30),
            default_timeout: Duration::from_secs(10),
            default_ssl_cert_expiry_warning_days: 30,
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    pub name: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: MonitorKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(
        default,
        deserialize_with = "de_opt_duration",
        serialize_with = "ser_opt_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub interval: Option<Duration>,
    #[serde(
        default,
        deserialize_with = "de_opt_duration",
        serialize_with = "ser_opt_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,

    // http
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<u16>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    // tcp / dns / ping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    // dns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response: Option<String>,

    // ping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_threshold: Option<f64>,
}

fn default_true() -> bool {
    true
}

// ─── Storage ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub retention_days: RetentionDays,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sled: Option<SledConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub influxdb: Option<InfluxConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionDays(pub u32);

impl Default for RetentionDays {
    fn default() -> Self {
        RetentionDays(30)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    None,
    /// Embedded key-value store.
    #[serde(alias = "badger")]
    Sled,
    Postgres,
    Influxdb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SledConfig {
    pub path: String,
}

impl Default for SledConfig {
    fn default() -> Self {
        SledConfig {
            path: "./data/hallmonitor".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        PostgresConfig {
            host: "localhost".into(),
            port: 5432,
            user: "hallmonitor".into(),
            password: String::new(),
            database: "hallmonitor".into(),
        }
    }
}

impl PostgresConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.database
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

// ─── Loading & validation ───────────────────────────────────────────────────

impl Config {
    /// Load, expand `${VAR}` placeholders, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let expanded = expand_placeholders(&raw);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.resolve_monitors()?;
        Ok(config)
    }

    /// Resolve the configured monitors: apply defaults, enforce the
    /// validation rules, and check per-kind endpoint formats.
    pub fn resolve_monitors(&self) -> Result<Vec<Monitor>, ConfigError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        for group in &self.monitoring.groups {
            for mc in &group.monitors {
                if mc.name.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "group {:?} contains a monitor without a name",
                        group.name
                    )));
                }
                if !seen.insert(mc.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate monitor name {:?}",
                        mc.name
                    )));
                }
                out.push(self.resolve_monitor(&group.name, mc)?);
            }
        }
        Ok(out)
    }

    fn resolve_monitor(&self, group: &str, mc: &MonitorConfig) -> Result<Monitor, ConfigError> {
        let invalid =
            |msg: String| ConfigError::Invalid(format!("monitor {:?}: {}", mc.name, msg));

        let mut interval = mc.interval.unwrap_or(self.monitoring.default_interval);
        if interval.is_zero() {
            interval = self.monitoring.default_interval;
        }
        if interval < MIN_INTERVAL {
            return Err(invalid(format!(
                "interval {:?} is below the 1s minimum",
                interval
            )));
        }
        let mut timeout = mc.timeout.unwrap_or(self.monitoring.default_timeout);
        if timeout.is_zero() {
            timeout = self.monitoring.default_timeout;
        }
        if timeout > MAX_TIMEOUT {
            return Err(invalid(format!(
                "timeout {:?} exceeds the 5 minute maximum",
                timeout
            )));
        }

        match mc.kind {
            MonitorKind::Http => {
                if mc.url.as_deref().unwrap_or("").is_empty() {
                    return Err(invalid("http monitors require `url`".into()));
                }
            }
            MonitorKind::Tcp | MonitorKind::Ping => {
                if mc.target.as_deref().unwrap_or("").is_empty() {
                    return Err(invalid(format!(
                        "{} monitors require `target`",
                        mc.kind
                    )));
                }
            }
            MonitorKind::Dns => {
                if mc.target.as_deref().unwrap_or("").is_empty()
                    || mc.query.as_deref().unwrap_or("").is_empty()
                {
                    return Err(invalid("dns monitors require `target` and `query`".into()));
                }
            }
        }

        let monitor = Monitor {
            name: mc.name.clone(),
            kind: mc.kind,
            group: group.to_string(),
            enabled: mc.enabled,
            interval,
            timeout,
            labels: mc.labels.clone(),
            url: mc.url.clone(),
            method: mc
                .method
                .as_ref()
                .map(|m| m.to_ascii_uppercase())
                .or_else(|| matches!(mc.kind, MonitorKind::Http).then(|| "GET".to_string())),
            expected_status: mc
                .expected_status
                .or(matches!(mc.kind, MonitorKind::Http).then_some(200)),
            headers: mc.headers.clone(),
            target: mc.target.clone(),
            query: mc.query.clone(),
            query_type: mc
                .query_type
                .as_ref()
                .map(|t| t.to_ascii_uppercase())
                .or_else(|| matches!(mc.kind, MonitorKind::Dns).then(|| "A".to_string())),
            expected_response: mc.expected_response.clone(),
            ping_count: mc.ping_count,
            degraded_threshold: mc.degraded_threshold,
        };

        crate::executors::validate_monitor(&monitor).map_err(invalid)?;
        Ok(monitor)
    }

    /// Copy of the config safe to expose over the API: secrets redacted.
    pub fn sanitized(&self) -> Config {
        let mut c = self.clone();
        if let Some(pg) = c.storage.postgres.as_mut() {
            if !pg.password.is_empty() {
                pg.password = "***".into();
            }
        }
        if let Some(influx) = c.storage.influxdb.as_mut() {
            if !influx.token.is_empty() {
                influx.token = "***".into();
            }
        }
        for group in &mut c.monitoring.groups {
            for m in &mut group.monitors {
                for value in m.headers.values_mut() {
                    *value = "***".into();
                }
            }
        }
        c
    }
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Substitute `${VAR}` placeholders from the process environment.
/// Unset variables expand to the empty string, matching `os.ExpandEnv`.
pub fn expand_placeholders(raw: &str) -> String {
    PLACEHOLDER
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            std::env::var(name).unwrap_or_else(|_| {
                warn!(var = name, "config placeholder refers to an unset variable");
                String::new()
            })
        })
        .into_owned()
}

// ─── Duration fields ────────────────────────────────────────────────────────

/// Parse a duration given as bare seconds (`30`) or with a unit suffix
/// (`500ms`, `30s`, `5m`, `2h`).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("invalid duration {:?}", s))?;
    let (num, unit) = s.split_at(split);
    let value: u64 = num.parse().map_err(|_| format!("invalid duration {:?}", s))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        "d" => Ok(Duration::from_secs(value * 86_400)),
        _ => Err(format!("invalid duration unit {:?}", unit)),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            RawDuration::Seconds(n) => Ok(Duration::from_secs(n)),
            RawDuration::Text(s) => parse_duration(&s),
        }
    }
}

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    RawDuration::deserialize(d)?
        .into_duration()
        .map_err(serde::de::Error::custom)
}

fn de_opt_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    Option::<RawDuration>::deserialize(d)?
        .map(|raw| raw.into_duration())
        .transpose()
        .map_err(serde::de::Error::custom)
}

fn ser_duration<S: Serializer>(v: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(v.as_secs())
}

fn ser_opt_duration<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(d) => s.serialize_some(&d.as_secs()),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  port: 9100
metrics:
  enabled: true
monitoring:
  defaultInterval: 15s
  defaultTimeout: 5
  groups:
    - name: core
      monitors:
        - name: web
          type: http
          url: https://example.com/health
          expectedStatus: 204
        - name: db-port
          type: tcp
          target: db.internal:5432
          interval: 1m
storage:
  backend: none
"#;

    #[test]
    fn parses_sample_config_and_applies_defaults() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.monitoring.default_interval, Duration::from_secs(15));

        let monitors = config.resolve_monitors().unwrap();
        assert_eq!(monitors.len(), 2);
        let web = &monitors[0];
        assert_eq!(web.kind, MonitorKind::Http);
        assert_eq!(web.group, "core");
        assert_eq!(web.method.as_deref(), Some("GET"));
        assert_eq!(web.expected_status, Some(204));
        assert_eq!(web.interval, Duration::from_secs(15));
        assert_eq!(web.timeout, Duration::from_secs(5));
        let tcp = &monitors[1];
        assert_eq!(tcp.interval, Duration::from_secs(60));
    }

    #[test]
    fn duplicate_monitor_names_are_rejected() {
        let yaml = r#"
monitoring:
  groups:
    - name: a
      monitors:
        - { name: same, type: tcp, target: "x:80" }
    - name: b
      monitors:
        - { name: same, type: tcp, target: "y:80" }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.resolve_monitors().unwrap_err();
        assert!(err.to_string().contains("duplicate monitor name"));
    }

    #[test]
    fn http_monitor_without_url_is_rejected() {
        let yaml = r#"
monitoring:
  groups:
    - name: a
      monitors:
        - { name: web, type: http }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.resolve_monitors().unwrap_err();
        assert!(err.to_string().contains("require `url`"));
    }

    #[test]
    fn timeout_above_five_minutes_is_rejected() {
        let yaml = r#"
monitoring:
  groups:
    - name: a
      monitors:
        - { name: web, type: tcp, target: "x:80", timeout: 10m }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.resolve_monitors().is_err());
    }

    #[test]
    fn sub_second_interval_is_rejected() {
        let yaml = r#"
monitoring:
  groups:
    - name: a
      monitors:
        - { name: web, type: tcp, target: "x:80", interval: 500ms }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.resolve_monitors().is_err());
    }

    #[test]
    fn placeholders_expand_from_the_environment() {
        std::env::set_var("HM_TEST_TOKEN", "s3cret");
        let expanded = expand_placeholders("authorization: Bearer ${HM_TEST_TOKEN}");
        assert_eq!(expanded, "authorization: Bearer s3cret");
        let empty = expand_placeholders("x: ${HM_TEST_DOES_NOT_EXIST_XYZ}");
        assert_eq!(empty, "x: ");
    }

    #[test]
    fn parse_duration_accepts_units_and_bare_seconds() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10w").is_err());
    }

    #[test]
    fn sanitized_config_redacts_secrets() {
        let mut config = Config::default();
        config.storage.postgres = Some(PostgresConfig {
            password: "hunter2".into(),
            ..PostgresConfig::default()
        });
        config.storage.influxdb = Some(InfluxConfig {
            token: "tok".into(),
            ..InfluxConfig::default()
        });
        let clean = config.sanitized();
        assert_eq!(clean.storage.postgres.unwrap().password, "***");
        assert_eq!(clean.storage.influxdb.unwrap().token, "***");
    }
}
