use super::AppState;
use crate::config::Config;
use crate::manager::MonitorSet;
use rocket::http::ContentType;
use rocket::serde::json::Json;
use rocket::{get, post, State};
use tracing::{error, info};

// ── Health ──

#[get("/health")]
pub fn health(state: &State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "hallmonitor",
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

#[get("/ready")]
pub fn ready(state: &State<AppState>) -> Json<serde_json::Value> {
    let backend = state.store.backend();
    Json(serde_json::json!({
        "status": "ready",
        "checks": {
            "storage": backend.name(),
            "monitors": state.manager.current().len(),
        }
    }))
}

// ── Metrics ──

/// Mounted at the configured metrics path (default `/metrics`).
#[get("/")]
pub fn metrics_endpoint(state: &State<AppState>) -> (ContentType, String) {
    (ContentType::Plain, state.metrics.render())
}

// ── Config ──

/// Sanitized view of the running configuration: secrets redacted.
#[get("/config")]
pub fn get_config(state: &State<AppState>) -> Json<Config> {
    Json(state.config.read().unwrap().sanitized())
}

// ── Reload ──

/// Re-read the config file, atomically replace the monitor set. In-flight
/// probes for removed monitors finish and their results are stored; the
/// scheduler re-seeds its timetable on the next tick.
#[post("/reload")]
pub fn reload(state: &State<AppState>) -> Json<serde_json::Value> {
    let loaded = Config::load(&state.config_path).and_then(|config| {
        let monitors = config.resolve_monitors()?;
        Ok((config, monitors))
    });
    match loaded {
        Ok((config, monitors)) => {
            let count = monitors.len();
            state.manager.replace(MonitorSet::new(monitors));
            *state.config.write().unwrap() = config;
            info!(monitors = count, "configuration reloaded");
            Json(serde_json::json!({
                "success": true,
                "message": format!("configuration reloaded, {} monitors active", count),
            }))
        }
        Err(err) => {
            error!(error = %err, "reload failed, keeping previous configuration");
            Json(serde_json::json!({
                "success": false,
                "message": err.to_string(),
            }))
        }
    }
}
