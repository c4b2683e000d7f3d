//! Proxy lifecycle routes.

use axum::extract::{Path, State};
use axum::Json;

use super::{parse_flag, success, verify_auth, AppState};
use crate::error::CoordError;

/// PUT `/api/topom/proxy/create/{xauth}/{addr}`.
pub async fn create(
    State(state): State<AppState>,
    Path((xauth, addr)): Path<(String, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.create_proxy(&addr).await?;
    Ok(success())
}

/// PUT `/api/topom/proxy/online/{xauth}/{addr}`.
pub async fn online(
    State(state): State<AppState>,
    Path((xauth, addr)): Path<(String, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.online_proxy(&addr).await?;
    Ok(success())
}

/// PUT `/api/topom/proxy/reinit/{xauth}/{token}`.
pub async fn reinit(
    State(state): State<AppState>,
    Path((xauth, token)): Path<(String, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.reinit_proxy(&token).await?;
    Ok(success())
}

/// PUT `/api/topom/proxy/remove/{xauth}/{token}/{force}`.
pub async fn remove(
    State(state): State<AppState>,
    Path((xauth, token, force)): Path<(String, String, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    let force = parse_flag(&force)?;
    state.coordinator.remove_proxy(&token, force).await?;
    Ok(success())
}
