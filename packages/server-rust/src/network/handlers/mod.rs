//! Admin API handlers.
//!
//! Defines `AppState` (the shared state carried through axum extractors),
//! the xauth check every authenticated route goes through, and the JSON
//! rendering of coordinator errors. The route-to-handler wiring lives in
//! [`super::module`].

pub mod expansion;
pub mod groups;
pub mod health;
pub mod overview;
pub mod proxies;
pub mod sentinels;
pub mod slots;

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use shardhelm_core::auth;

use crate::coordinator::Coordinator;
use crate::error::CoordError;
use crate::telemetry::LogLevelHandle;

use super::{NetworkConfig, ShutdownController};

/// Shared state passed to every handler via `State` extraction. All fields
/// are `Arc`-backed so cloning per request is cheap.
#[derive(Clone)]
pub struct AppState {
    /// The coordinator behind the whole admin surface.
    pub coordinator: Arc<Coordinator>,
    /// Shutdown controller driving `/healthz` and the shutdown RPC.
    pub shutdown: Arc<ShutdownController>,
    /// Network configuration the endpoint was started with.
    pub config: Arc<NetworkConfig>,
    /// Runtime handle for the loglevel RPC.
    pub loglevel: LogLevelHandle,
    /// Process start time, used for uptime reporting.
    pub start_time: Instant,
}

/// Check the xauth path segment against the coordinator's derived token.
///
/// # Errors
///
/// Returns a validation error (rendered as 400) when the token does not
/// match.
pub fn verify_auth(state: &AppState, presented: &str) -> Result<(), CoordError> {
    if auth::verify_xauth(state.coordinator.xauth(), presented) {
        Ok(())
    } else {
        Err(CoordError::validation("invalid xauth token"))
    }
}

/// The body every successful mutating RPC returns.
#[must_use]
pub fn success() -> Json<&'static str> {
    Json("Success")
}

/// Parse a `{0|1}` path flag.
///
/// # Errors
///
/// Anything but `"0"` or `"1"` is a validation error.
pub fn parse_flag(value: &str) -> Result<bool, CoordError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(CoordError::validation(format!(
            "flag must be 0 or 1, got {other:?}"
        ))),
    }
}

impl IntoResponse for CoordError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        if let Some(conflict) = self.conflict() {
            body["conflict"] = serde_json::to_value(conflict).unwrap_or(Value::Null);
        }
        (self.status(), Json(body)).into_response()
    }
}

/// Router fallback, so unknown paths answer in the same JSON shape as our
/// own errors.
pub async fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "validation", "message": "no such route"})),
    )
}
