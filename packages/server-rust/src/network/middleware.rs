//! Tower middleware stack for the admin API.
//!
//! Layer ordering follows the outer-to-inner convention: the first layer
//! listed sees the request first on the way in and the response last on the
//! way out.

use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::map_response_body::MapResponseBodyLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;

/// Request bodies are small JSON arrays (slot assignments at most); anything
/// past this is a bug or abuse.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Re-boxes the body-limit wrapper into `axum::body::Body`. The timeout and
/// CORS layers need a `Default` response body to synthesize their
/// short-circuit responses, and the limit wrapper does not provide one.
type ReboxLimitedBody =
    fn(tower_http::limit::ResponseBody<axum::body::Body>) -> axum::body::Body;

/// The composed layer type produced by [`build_http_layers`].
///
/// Spelled out so the builder keeps a nameable return type. Each layer wraps
/// the next in a `Stack`, outermost first.
type HttpLayers = tower::layer::util::Stack<
    RequestBodyLimitLayer,
    tower::layer::util::Stack<
        MapResponseBodyLayer<ReboxLimitedBody>,
        tower::layer::util::Stack<
            PropagateRequestIdLayer,
            tower::layer::util::Stack<
                TimeoutLayer,
                tower::layer::util::Stack<
                    CorsLayer,
                    tower::layer::util::Stack<
                        CompressionLayer,
                        tower::layer::util::Stack<
                            TraceLayer<
                                tower_http::classify::SharedClassifier<
                                    tower_http::classify::ServerErrorsAsFailures,
                                >,
                            >,
                            tower::layer::util::Stack<
                                SetRequestIdLayer<MakeRequestUuid>,
                                tower::layer::util::Identity,
                            >,
                        >,
                    >,
                >,
            >,
        >,
    >,
>;

/// Build the transport middleware applied to every admin route.
///
/// Ordering, outermost to innermost: assign a UUID `X-Request-Id`, trace the
/// request, compress the response, apply CORS, enforce the request timeout as
/// a 408, echo the request id back on the response, and cap the body size.
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let x_request_id = HeaderName::from_static("x-request-id");

    let cors = build_cors_layer(&config.cors_origins);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .layer(MapResponseBodyLayer::new(
            axum::body::Body::new as ReboxLimitedBody,
        ))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .into_inner()
}

/// CORS from the configured origin list. A wildcard `"*"` anywhere in the
/// list allows any origin; otherwise each entry is parsed into an allowlist.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|origin| origin.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    // The admin surface is GET for reads and PUT/POST for mutations.
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::PUT, Method::POST])
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn layers_build_from_defaults() {
        let config = NetworkConfig::default();
        let _layers = build_http_layers(&config);
    }

    #[test]
    fn cors_accepts_wildcard_and_explicit_origins() {
        let _any = build_cors_layer(&["*".to_string()]);
        let _list = build_cors_layer(&[
            "http://localhost:3000".to_string(),
            "https://dash.example.com".to_string(),
        ]);
    }

    #[test]
    fn layers_build_with_custom_timeout() {
        let config = NetworkConfig {
            request_timeout: Duration::from_secs(5),
            ..NetworkConfig::default()
        };
        let _layers = build_http_layers(&config);
    }
}
