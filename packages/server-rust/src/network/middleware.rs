//! HTTP middleware stack for the gateway.
//!
//! The first layer listed is the outermost: it sees the request first and
//! the response last.

use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;

/// Header carrying the per-request id; also used as the call trace id when
/// the client sends no `trace` header.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

type HttpLayers = Stack<
    PropagateRequestIdLayer,
    Stack<
        TimeoutLayer,
        Stack<
            CorsLayer,
            Stack<
                CompressionLayer,
                Stack<
                    TraceLayer<SharedClassifier<ServerErrorsAsFailures>>,
                    Stack<
                        RequestBodyLimitLayer,
                        Stack<SetRequestIdLayer<MakeRequestUuid>, Identity>,
                    >,
                >,
            >,
        >,
    >,
>;

/// Builds the transport-level layers applied to every route.
///
/// 1. `SetRequestId` -- assigns a UUID `x-request-id` when absent
/// 2. `RequestBodyLimit` -- 413 above `max_body_bytes`
/// 3. `Tracing` -- one span per HTTP exchange
/// 4. `Compression` -- gzip responses
/// 5. `CORS` -- configured origins, GET and POST only
/// 6. `Timeout` -- 408 once `request_timeout` elapses
/// 7. `PropagateRequestId` -- echoes `x-request-id` on the response
///
/// The body limit wraps the response body in a type without `Default`,
/// which `CorsLayer` and `TimeoutLayer` require, so it must sit outside
/// both.
///
/// Call-level concerns (load shedding, deadlines, call metrics) live in the
/// call pipeline, not here.
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(build_cors_layer(&config.cors_origins))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(request_id))
        .into_inner()
}

/// `*` anywhere in the list allows any origin; unparsable origins are
/// dropped.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| o.parse().ok()))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::post;
    use axum::Router;
    use tower::ServiceExt;

    use super::*;

    fn echo_router(config: &NetworkConfig) -> Router {
        Router::new()
            .route("/echo", post(|body: String| async move { body }))
            .layer(build_http_layers(config))
    }

    #[tokio::test]
    async fn response_carries_request_id() {
        let rsp = echo_router(&NetworkConfig::default())
            .oneshot(Request::post("/echo").body(Body::from("hi")).unwrap())
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        assert!(rsp.headers().contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn client_request_id_is_echoed() {
        let rsp = echo_router(&NetworkConfig::default())
            .oneshot(
                Request::post("/echo")
                    .header(REQUEST_ID_HEADER, "req-42")
                    .body(Body::from("hi"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.headers()[REQUEST_ID_HEADER], "req-42");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let config = NetworkConfig {
            max_body_bytes: 8,
            ..NetworkConfig::default()
        };
        let rsp = echo_router(&config)
            .oneshot(Request::post("/echo").body(Body::from("0123456789abcdef")).unwrap())
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn declared_oversized_body_is_rejected_with_cors_configured() {
        let config = NetworkConfig {
            max_body_bytes: 8,
            cors_origins: vec!["http://localhost:3000".to_string()],
            ..NetworkConfig::default()
        };
        let rsp = echo_router(&config)
            .oneshot(
                Request::post("/echo")
                    .header("content-length", "16")
                    .header("origin", "http://localhost:3000")
                    .body(Body::from("0123456789abcdef"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn preflight_passes_through_the_body_limit() {
        let config = NetworkConfig {
            max_body_bytes: 8,
            cors_origins: vec!["http://localhost:3000".to_string()],
            ..NetworkConfig::default()
        };
        let rsp = echo_router(&config)
            .oneshot(
                Request::options("/echo")
                    .header("origin", "http://localhost:3000")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(rsp.headers()["access-control-allow-origin"], "http://localhost:3000");
    }

    #[test]
    fn cors_accepts_specific_origins() {
        let config = NetworkConfig {
            cors_origins: vec!["http://localhost:3000".to_string(), "not a url\n".to_string()],
            request_timeout: Duration::from_secs(5),
            ..NetworkConfig::default()
        };
        let _layers = build_http_layers(&config);
    }
}
