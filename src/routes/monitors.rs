use super::{bad_request, not_found, parse_period, store_error, ApiError, AppState};
use crate::models::{MonitorWithLatest, PeriodType, ProbeResult, UptimeStats};
use chrono::{DateTime, Utc};
use rocket::serde::json::Json;
use rocket::{get, State};

const DEFAULT_HISTORY_PERIOD: &str = "24h";
const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

// ── Monitors ──

#[get("/monitors")]
pub async fn list_monitors(state: &State<AppState>) -> Json<Vec<MonitorWithLatest>> {
    let set = state.manager.current();
    let mut out = Vec::with_capacity(set.len());
    for monitor in set.iter() {
        let latest_result = state
            .store
            .latest_result(&monitor.name)
            .await
            .unwrap_or(None);
        out.push(MonitorWithLatest {
            monitor: (**monitor).clone(),
            latest_result,
        });
    }
    Json(out)
}

#[get("/monitors/<name>")]
pub async fn get_monitor(
    name: &str,
    state: &State<AppState>,
) -> Result<Json<MonitorWithLatest>, ApiError> {
    let set = state.manager.current();
    let monitor = set.get(name).ok_or_else(|| not_found("monitor"))?;
    let latest_result = state.store.latest_result(name).await.unwrap_or(None);
    Ok(Json(MonitorWithLatest {
        monitor: (**monitor).clone(),
        latest_result,
    }))
}

// ── History ──

#[derive(serde::Serialize)]
#[serde(untagged)]
pub enum History {
    Raw(Vec<ProbeResult>),
    Aggregated(Vec<crate::models::AggregateRecord>),
}

/// Raw results in a range. `start`/`end` are RFC 3339; `period` is a
/// shorthand window ending now (`6h`, `7d`), or `hour`/`day` to read the
/// pre-computed roll-ups instead.
#[get("/monitors/<name>/history?<start>&<end>&<limit>&<period>")]
pub async fn monitor_history(
    name: &str,
    start: Option<&str>,
    end: Option<&str>,
    limit: Option<usize>,
    period: Option<&str>,
    state: &State<AppState>,
) -> Result<Json<History>, ApiError> {
    let set = state.manager.current();
    if !set.contains(name) {
        return Err(not_found("monitor"));
    }
    let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
    let (start, end) = resolve_range(start, end, period)?;

    match period {
        Some(p @ ("hour" | "day")) => {
            let period_type = if p == "day" {
                PeriodType::Day
            } else {
                PeriodType::Hour
            };
            let backend = state.store.backend();
            let aggregates = backend
                .aggregates_in_range(name, period_type, start, end)
                .await
                .map_err(|e| store_error(backend.name(), e))?;
            Ok(Json(History::Aggregated(aggregates)))
        }
        _ => {
            let results = state
                .store
                .results_in_range(name, start, end, limit)
                .await
                .map_err(|e| store_error(state.store.backend().name(), e))?;
            Ok(Json(History::Raw(results)))
        }
    }
}

fn resolve_range(
    start: Option<&str>,
    end: Option<&str>,
    period: Option<&str>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    let end = match end {
        Some(raw) => parse_rfc3339(raw)?,
        None => Utc::now(),
    };
    let start = match (start, period) {
        (Some(raw), _) => parse_rfc3339(raw)?,
        // hour/day select the aggregate view; give them a generous window
        (None, Some("hour")) => end - chrono::Duration::days(7),
        (None, Some("day")) => end - chrono::Duration::days(90),
        (None, Some(period)) => end - parse_period(period)?,
        (None, None) => end - parse_period(DEFAULT_HISTORY_PERIOD)?,
    };
    if start >= end {
        return Err(bad_request("start must be before end"));
    }
    Ok((start, end))
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| bad_request(format!("invalid timestamp {:?}: {}", raw, e)))
}

// ── Uptime ──

#[get("/monitors/<name>/uptime?<period>")]
pub async fn monitor_uptime(
    name: &str,
    period: Option<&str>,
    state: &State<AppState>,
) -> Result<Json<UptimeStats>, ApiError> {
    let set = state.manager.current();
    if !set.contains(name) {
        return Err(not_found("monitor"));
    }
    let label = period.unwrap_or(DEFAULT_HISTORY_PERIOD);
    let window = parse_period(label)?;
    let stats = state
        .store
        .uptime(name, window, label)
        .await
        .map_err(|e| store_error(state.store.backend().name(), e))?;
    Ok(Json(stats))
}
