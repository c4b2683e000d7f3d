//! Health, liveness, and readiness probes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Detailed health as JSON. Always 200; the `state` field says whether the
/// endpoint is actually serving, so monitors can tell "up but draining"
/// apart from "down".
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "cluster": state.coordinator.config().cluster,
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe. Always 200 while the process answers at all; anything
/// stricter here would turn a drain into a restart loop.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe. 200 only in the `Ready` state, 503 during startup and
/// drain so load balancers stop routing new calls here.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;
    use crate::coordinator::testkit;

    #[tokio::test]
    async fn health_reports_state_and_counts() {
        let (state, _backend) = testutil::state_with(testkit::topology(&[])).await;
        state.shutdown.set_ready();
        let _guard = state.shutdown.in_flight_guard();

        let body = health_handler(State(state)).await.0;
        assert_eq!(body["state"], "ready");
        assert_eq!(body["cluster"], "demo-test");
        assert_eq!(body["in_flight"], 1);
        assert!(body["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_reports_draining_after_trigger() {
        let (state, _backend) = testutil::state_with(testkit::topology(&[])).await;
        state.shutdown.set_ready();
        state.shutdown.trigger_shutdown();

        let body = health_handler(State(state)).await.0;
        assert_eq!(body["state"], "draining");
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_tracks_the_lifecycle() {
        let (state, _backend) = testutil::state_with(testkit::topology(&[])).await;
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.shutdown.set_ready();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);

        state.shutdown.trigger_shutdown();
        assert_eq!(
            readiness_handler(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
