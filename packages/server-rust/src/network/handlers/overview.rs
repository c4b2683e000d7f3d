//! Coordinator-level routes: overview, model, stats, slots, ping, reload,
//! loglevel, and the shutdown RPC.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use shardhelm_core::SlotView;

use super::{success, verify_auth, AppState};
use crate::coordinator::StatsPayload;
use crate::error::CoordError;

/// GET `/topom`. Everything a dashboard needs in one unauthenticated call.
/// The config view deliberately leaves out the xauth token.
pub async fn overview(State(state): State<AppState>) -> Json<Value> {
    let config = state.coordinator.config();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "model": state.coordinator.model(),
        "config": {
            "cluster": config.cluster,
            "adminAddr": config.admin_addr,
            "migrationParallel": config.migration_parallel,
            "probeTimeoutMs": config.probe_timeout.as_millis() as u64,
            "pollIntervalMs": config.poll_interval.as_millis() as u64,
            "engineIntervalMs": config.engine_interval.as_millis() as u64,
            "migrateWatchTimeoutSecs": config.migrate_watch_timeout.as_secs(),
        },
        "stats": state.coordinator.stats().await,
    }))
}

/// GET `/topom/model` and `/api/topom/model`.
pub async fn model(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.coordinator.model()))
}

/// GET `/topom/stats`.
pub async fn stats(State(state): State<AppState>) -> Json<StatsPayload> {
    Json(state.coordinator.stats().await)
}

/// GET `/topom/slots`. The proxy-facing view of all 1024 slots.
pub async fn slots(State(state): State<AppState>) -> Json<Vec<SlotView>> {
    Json(state.coordinator.cached().topology.slot_views())
}

/// GET `/api/topom/xping/{xauth}`. Auth check and nothing else.
pub async fn xping(
    State(state): State<AppState>,
    Path(xauth): Path<String>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    Ok(success())
}

/// GET `/api/topom/stats/{xauth}`.
pub async fn stats_auth(
    State(state): State<AppState>,
    Path(xauth): Path<String>,
) -> Result<Json<StatsPayload>, CoordError> {
    verify_auth(&state, &xauth)?;
    Ok(Json(state.coordinator.stats().await))
}

/// GET `/api/topom/slots/{xauth}`.
pub async fn slots_auth(
    State(state): State<AppState>,
    Path(xauth): Path<String>,
) -> Result<Json<Vec<SlotView>>, CoordError> {
    verify_auth(&state, &xauth)?;
    Ok(Json(state.coordinator.cached().topology.slot_views()))
}

/// PUT `/api/topom/reload/{xauth}`. Force a fresh read of the persisted
/// topology into the cache.
pub async fn reload(
    State(state): State<AppState>,
    Path(xauth): Path<String>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.coordinator.refresh().await?;
    Ok(success())
}

/// PUT `/api/topom/shutdown/{xauth}`. Starts the drain; the response goes
/// out before the listener closes.
pub async fn shutdown(
    State(state): State<AppState>,
    Path(xauth): Path<String>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state.shutdown.trigger_shutdown();
    Ok(success())
}

/// PUT `/api/topom/loglevel/{xauth}/{value}`. Swaps the tracing filter at
/// runtime; the value is any `EnvFilter` directive.
pub async fn loglevel(
    State(state): State<AppState>,
    Path((xauth, value)): Path<(String, String)>,
) -> Result<Json<&'static str>, CoordError> {
    verify_auth(&state, &xauth)?;
    state
        .loglevel
        .set(&value)
        .map_err(|err| CoordError::validation(format!("invalid log level {value:?}: {err}")))?;
    Ok(success())
}
