use super::{not_found, ApiError, AppState};
use crate::models::{GroupSummary, MonitorWithLatest, ProbeStatus};
use rocket::serde::json::Json;
use rocket::{get, State};

// ── Groups ──

#[get("/groups")]
pub async fn list_groups(state: &State<AppState>) -> Json<Vec<GroupSummary>> {
    let set = state.manager.current();
    let mut out = Vec::new();
    for group in set.groups() {
        let members = set.group_members(group);
        let mut up = 0;
        let mut down = 0;
        for monitor in &members {
            match state.store.latest_in_memory(&monitor.name).map(|r| r.status) {
                Some(ProbeStatus::Down) => down += 1,
                Some(_) => up += 1,
                None => {}
            }
        }
        out.push(GroupSummary {
            name: group.clone(),
            monitor_count: members.len(),
            up_count: up,
            down_count: down,
        });
    }
    Json(out)
}

#[derive(serde::Serialize)]
pub struct GroupDetail {
    pub name: String,
    pub monitors: Vec<MonitorWithLatest>,
}

#[get("/groups/<name>")]
pub async fn get_group(
    name: &str,
    state: &State<AppState>,
) -> Result<Json<GroupDetail>, ApiError> {
    let set = state.manager.current();
    if !set.groups().iter().any(|g| g == name) {
        return Err(not_found("group"));
    }
    let mut monitors = Vec::new();
    for monitor in set.group_members(name) {
        let latest_result = state
            .store
            .latest_result(&monitor.name)
            .await
            .unwrap_or(None);
        monitors.push(MonitorWithLatest {
            monitor: (**monitor).clone(),
            latest_result,
        });
    }
    Ok(Json(GroupDetail {
        name: name.to_string(),
        monitors,
    }))
}
