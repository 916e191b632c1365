// Route modules — each handles one domain of the API.

mod groups;
mod monitors;
mod system;

pub use groups::{get_group, list_groups};
pub use monitors::{get_monitor, list_monitors, monitor_history, monitor_uptime};
pub use system::{get_config, health, metrics_endpoint, ready, reload};

use crate::config::Config;
use crate::manager::MonitorManager;
use crate::metrics::Metrics;
use crate::store::{ResultStore, StoreError};
use chrono::Duration as ChronoDuration;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{catch, Request};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Shared state handed to every handler.
pub struct AppState {
    pub config: RwLock<Config>,
    pub config_path: PathBuf,
    pub manager: Arc<MonitorManager>,
    pub store: Arc<ResultStore>,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
}

pub(crate) type ApiError = (Status, Json<serde_json::Value>);

/// The one error envelope this API speaks, for handlers and catchers alike.
fn error_body(code: &str, message: impl Into<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": message.into(), "code": code}))
}

pub(crate) fn not_found(what: &str) -> ApiError {
    (
        Status::NotFound,
        error_body("NOT_FOUND", format!("{} not found", what)),
    )
}

pub(crate) fn bad_request(message: impl Into<String>) -> ApiError {
    (Status::BadRequest, error_body("BAD_REQUEST", message))
}

/// Read-path storage errors: the unsupported sentinel becomes 501 with the
/// missing capability named, everything else a 500.
pub(crate) fn store_error(backend: &str, err: StoreError) -> ApiError {
    if err.is_unsupported() {
        (
            Status::NotImplemented,
            error_body(
                "UNSUPPORTED_CAPABILITY",
                format!(
                    "the {} storage backend does not support this operation",
                    backend
                ),
            ),
        )
    } else {
        (
            Status::InternalServerError,
            error_body("STORAGE_ERROR", err.to_string()),
        )
    }
}

// ── Catchers ──
//
// This API takes no JSON request bodies, so the only fallbacks needed are
// unparseable requests, unknown routes and handler faults.

#[catch(400)]
pub fn unparseable_request(req: &Request) -> Json<serde_json::Value> {
    error_body(
        "BAD_REQUEST",
        format!(
            "could not parse the request to {}; check the query parameters",
            req.uri().path()
        ),
    )
}

#[catch(404)]
pub fn unknown_route(req: &Request) -> Json<serde_json::Value> {
    error_body(
        "NOT_FOUND",
        format!(
            "no route for {}; monitor and group queries live under /api/v1",
            req.uri().path()
        ),
    )
}

#[catch(500)]
pub fn handler_fault(_req: &Request) -> Json<serde_json::Value> {
    error_body("INTERNAL_ERROR", "internal error, see the server log")
}

/// Parse a query-string period such as `90m`, `24h` or `7d` into a window.
pub(crate) fn parse_period(period: &str) -> Result<ChronoDuration, ApiError> {
    let std = crate::config::parse_duration(period)
        .map_err(|e| bad_request(format!("invalid period: {}", e)))?;
    ChronoDuration::from_std(std).map_err(|_| bad_request("period out of range"))
}
