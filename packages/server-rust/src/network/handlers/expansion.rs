//! Expansion plan routes.

use axum::extract::{Path, State};
use axum::Json;

use super::{parse_flag, success, verify_auth, AppState};
use crate::error::CoordError;

/// PUT `/api/topom/expansion/add-plan/{xauth}/{plan}`. The plan segment is
/// the `src$dst$slots$speed$retention` record.
pub async fn add_plan(
    State(state): State<AppState>,
    Path((xauth, plan)): Path<(String, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.add_plan(&plan).await?;
    Ok(success())
}

/// GET `/api/topom/expansion/pull-plan/{xauth}`. One record per line.
pub async fn pull_plan(
    State(state): State<AppState>,
    Path(xauth): Path<String>,
) -> Result<Json<String>, CoordError> {
    verify_auth(&state, &xauth)?;
    Ok(Json(state.coordinator.pull_plan().await))
}

/// PUT `/api/topom/expansion/del-plan/{xauth}/{planid}`.
pub async fn del_plan(
    State(state): State<AppState>,
    Path((xauth, plan_id)): Path<(String, u64)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.del_plan(plan_id).await?;
    Ok(success())
}

/// PUT `/api/topom/expansion/sync/{xauth}/{planid}`.
pub async fn sync(
    State(state): State<AppState>,
    Path((xauth, plan_id)): Path<(String, u64)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.plan_sync(plan_id).await?;
    Ok(success())
}

/// PUT `/api/topom/expansion/backup/{xauth}/{planid}/{force}`.
pub async fn backup(
    State(state): State<AppState>,
    Path((xauth, plan_id, force)): Path<(String, u64, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    let force = parse_flag(&force)?;
    state.coordinator.plan_backup(plan_id, force).await?;
    Ok(success())
}

/// PUT `/api/topom/expansion/slots-migrate/{xauth}/{planid}`.
pub async fn slots_migrate(
    State(state): State<AppState>,
    Path((xauth, plan_id)): Path<(String, u64)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.plan_slots_migrate(plan_id).await?;
    Ok(success())
}

/// PUT `/api/topom/expansion/clean/{xauth}/{planid}`.
pub async fn clean(
    State(state): State<AppState>,
    Path((xauth, plan_id)): Path<(String, u64)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.plan_clean(plan_id).await?;
    Ok(success())
}

/// PUT `/api/topom/expansion/group-clean/{xauth}/{gid}`.
pub async fn group_clean(
    State(state): State<AppState>,
    Path((xauth, gid)): Path<(String, u32)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.plan_group_clean(gid).await?;
    Ok(success())
}
