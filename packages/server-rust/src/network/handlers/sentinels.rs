//! Watchdog (sentinel) routes.

use axum::extract::{Path, State};
use axum::Json;

use super::{parse_flag, success, verify_auth, AppState};
use crate::error::CoordError;

/// PUT `/api/topom/sentinels/add/{xauth}/{addr}`.
pub async fn add(
    State(state): State<AppState>,
    Path((xauth, addr)): Path<(String, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.add_sentinel(&addr).await?;
    Ok(success())
}

/// PUT `/api/topom/sentinels/del/{xauth}/{addr}/{force}`.
pub async fn del(
    State(state): State<AppState>,
    Path((xauth, addr, force)): Path<(String, String, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    let force = parse_flag(&force)?;
    state.coordinator.del_sentinel(&addr, force).await?;
    Ok(success())
}

/// PUT `/api/topom/sentinels/resync-all/{xauth}`.
pub async fn resync_all(
    State(state): State<AppState>,
    Path(xauth): Path<String>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.resync_all().await?;
    Ok(success())
}

/// PUT `/api/topom/sentinels/remove-all/{xauth}`.
pub async fn remove_all(
    State(state): State<AppState>,
    Path(xauth): Path<String>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.remove_all().await?;
    Ok(success())
}

/// PUT `/api/topom/sentinels/remove-group/{xauth}/{gid}`.
pub async fn remove_group(
    State(state): State<AppState>,
    Path((xauth, gid)): Path<(String, u32)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.remove_group_monitoring(gid).await?;
    Ok(success())
}
