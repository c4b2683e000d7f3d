//! Slot action and assignment routes.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_flag, success, verify_auth, AppState};
use crate::error::CoordError;

/// PUT `/api/topom/slots/action/create/{xauth}/{sid}/{gid}`.
pub async fn action_create(
    State(state): State<AppState>,
    Path((xauth, sid, gid)): Path<(String, usize, u32)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.create_slot_action(sid, gid).await?;
    Ok(success())
}

/// PUT `/api/topom/slots/action/create-some/{xauth}/{src}/{dst}/{num}`.
pub async fn action_create_some(
    State(state): State<AppState>,
    Path((xauth, src, dst, num)): Path<(String, u32, u32, usize)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.create_slot_actions_some(src, dst, num).await?;
    Ok(success())
}

/// PUT `/api/topom/slots/action/create-range/{xauth}/{beg}/{end}/{gid}`.
pub async fn action_create_range(
    State(state): State<AppState>,
    Path((xauth, beg, end, gid)): Path<(String, usize, usize, u32)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.create_slot_actions_range(beg, end, gid).await?;
    Ok(success())
}

/// PUT `/api/topom/slots/action/remove/{xauth}/{sid}`.
pub async fn action_remove(
    State(state): State<AppState>,
    Path((xauth, sid)): Path<(String, usize)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.remove_slot_action(sid).await?;
    Ok(success())
}

/// PUT `/api/topom/slots/action/remove-all/{xauth}`.
pub async fn action_remove_all(
    State(state): State<AppState>,
    Path(xauth): Path<String>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.remove_all_slot_actions().await?;
    Ok(success())
}

/// PUT `/api/topom/slots/action/interval/{xauth}/{value}`.
pub async fn action_interval(
    State(state): State<AppState>,
    Path((xauth, value)): Path<(String, u64)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.set_action_interval_secs(value);
    Ok(success())
}

/// PUT `/api/topom/slots/action/disabled/{xauth}/{value}`.
pub async fn action_disabled(
    State(state): State<AppState>,
    Path((xauth, value)): Path<(String, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.set_action_disabled(parse_flag(&value)?);
    Ok(success())
}

/// One entry of the `slots/assign` request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotAssignment {
    pub id: usize,
    pub group_id: u32,
}

/// PUT `/api/topom/slots/assign/{xauth}` with a JSON array body.
pub async fn assign(
    State(state): State<AppState>,
    Path(xauth): Path<String>,
    Json(entries): Json<Vec<SlotAssignment>>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    let assignments: Vec<(usize, u32)> = entries
        .iter()
        .map(|entry| (entry.id, entry.group_id))
        .collect();
    state.coordinator.assign_slots(&assignments).await?;
    Ok(success())
}

/// PUT `/api/topom/slots/assign/{xauth}/offline` with a JSON array of slot
/// ids.
pub async fn assign_offline(
    State(state): State<AppState>,
    Path(xauth): Path<String>,
    Json(sids): Json<Vec<usize>>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.assign_slots_offline(&sids).await?;
    Ok(success())
}

/// PUT `/api/topom/slots/rebalance/{xauth}/{confirm}`.
///
/// `confirm=0` answers with the planned moves and changes nothing;
/// `confirm=1` applies the plan and answers `"Success"`.
pub async fn rebalance(
    State(state): State<AppState>,
    Path((xauth, confirm)): Path<(String, String)>,
) -> Result<Json<Value>, CoordError> {
    verify_auth(&state, &xauth)?;
    let confirm = parse_flag(&confirm)?;
    let moves = state.coordinator.rebalance(confirm).await?;
    if confirm {
        Ok(Json(json!("Success")))
    } else {
        Ok(Json(json!(moves)))
    }
}
