//! Group and replication routes.

use axum::extract::{Path, State};
use axum::Json;

use super::{parse_flag, success, verify_auth, AppState};
use crate::error::CoordError;

/// PUT `/api/topom/group/create/{xauth}/{gid}`.
pub async fn create(
    State(state): State<AppState>,
    Path((xauth, gid)): Path<(String, u32)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.create_group(gid).await?;
    Ok(success())
}

/// PUT `/api/topom/group/remove/{xauth}/{gid}`.
pub async fn remove(
    State(state): State<AppState>,
    Path((xauth, gid)): Path<(String, u32)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.remove_group(gid).await?;
    Ok(success())
}

/// PUT `/api/topom/group/resync/{xauth}/{gid}`.
pub async fn resync(
    State(state): State<AppState>,
    Path((xauth, gid)): Path<(String, u32)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.resync_group(gid).await?;
    Ok(success())
}

/// PUT `/api/topom/group/resync-all/{xauth}`.
pub async fn resync_all(
    State(state): State<AppState>,
    Path(xauth): Path<String>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.resync_all_groups().await?;
    Ok(success())
}

/// PUT `/api/topom/group/add/{xauth}/{gid}/{addr}`.
pub async fn add_server(
    State(state): State<AppState>,
    Path((xauth, gid, addr)): Path<(String, u32, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.add_group_server(gid, &addr, None).await?;
    Ok(success())
}

/// PUT `/api/topom/group/add/{xauth}/{gid}/{addr}/{datacenter}`.
pub async fn add_server_dc(
    State(state): State<AppState>,
    Path((xauth, gid, addr, datacenter)): Path<(String, u32, String, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state
        .coordinator
        .add_group_server(gid, &addr, Some(datacenter))
        .await?;
    Ok(success())
}

/// PUT `/api/topom/group/del/{xauth}/{gid}/{addr}`.
pub async fn del_server(
    State(state): State<AppState>,
    Path((xauth, gid, addr)): Path<(String, u32, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.remove_group_server(gid, &addr).await?;
    Ok(success())
}

/// PUT `/api/topom/group/promote/{xauth}/{gid}/{addr}/{force}`.
pub async fn promote(
    State(state): State<AppState>,
    Path((xauth, gid, addr, force)): Path<(String, u32, String, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    let force = parse_flag(&force)?;
    state.coordinator.promote_server(gid, &addr, force).await?;
    Ok(success())
}

/// PUT `/api/topom/group/promote-commit/{xauth}/{gid}`.
pub async fn promote_commit(
    State(state): State<AppState>,
    Path((xauth, gid)): Path<(String, u32)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.promote_commit(gid).await?;
    Ok(success())
}

/// PUT `/api/topom/group/action/create/{xauth}/{addr}`.
pub async fn action_create(
    State(state): State<AppState>,
    Path((xauth, addr)): Path<(String, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.create_sync_action(&addr).await?;
    Ok(success())
}

/// PUT `/api/topom/group/action/remove/{xauth}/{addr}`.
pub async fn action_remove(
    State(state): State<AppState>,
    Path((xauth, addr)): Path<(String, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.remove_sync_action(&addr).await?;
    Ok(success())
}
