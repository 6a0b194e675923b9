//! Call endpoints.
//!
//! `POST /api/{app}/{method}` is the client surface: the body is the JSON
//! param and the answer is always HTTP 200 with a `{code, msg, data}`
//! object. `POST /rpc` is the peer surface: a JSON [`Request`] envelope in,
//! a JSON [`Response`] envelope out.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::USER_AGENT;
use axum::http::HeaderMap;
use axum::Json;
use meshcall_core::code::{INVALID_ARGUMENT, RESOURCE_EXHAUSTED};
use meshcall_core::{CallContext, FinalResponse, Request, Response};
use tower::ServiceExt;
use tracing::debug;

use super::AppState;
use crate::network::middleware::REQUEST_ID_HEADER;
use crate::service::Call;

/// Message returned while the gateway drains.
pub const DRAINING_MSG: &str = "server shutting down";

/// Builds the call context from request headers.
///
/// Metadata keys travel as plain headers (`trace`, `user`, `from`,
/// `timeout-ms`, ...). The request id stands in for a missing trace and
/// the standard `User-Agent` header for a missing `ua`.
#[must_use]
pub fn context_from_headers(headers: &HeaderMap) -> CallContext {
    let mut ctx = CallContext::from_metadata(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );
    if ctx.trace_id.is_empty() {
        if let Some(id) = headers.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
            ctx.trace_id = id.to_string();
        }
    }
    if ctx.user_agent.is_empty() {
        if let Some(ua) = headers.get(USER_AGENT).and_then(|v| v.to_str().ok()) {
            ctx.user_agent = ua.to_string();
        }
    }
    ctx
}

async fn run(state: &AppState, ctx: CallContext, request: Request) -> Response {
    let Some(_guard) = state.shutdown.admit() else {
        debug!(event = "gateway", app = %request.app(), "rejecting call while not ready");
        return Response::empty(RESOURCE_EXHAUSTED, DRAINING_MSG);
    };
    match state.pipeline.clone().oneshot(Call::new(ctx, request)).await {
        Ok(rsp) => rsp,
        Err(never) => match never {},
    }
}

/// `POST /api/{app}/{method}`
pub async fn api_handler(
    State(state): State<AppState>,
    Path((app, method)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<FinalResponse> {
    let ctx = context_from_headers(&headers);
    let rsp = run(&state, ctx, Request::new(app, method, body)).await;
    Json(FinalResponse::from(rsp))
}

/// `POST /rpc`
pub async fn rpc_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Response> {
    let request: Request = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(event = "gateway", error = %e, "malformed peer envelope");
            return Json(Response::bad_request(INVALID_ARGUMENT));
        }
    };
    let ctx = context_from_headers(&headers);
    Json(run(&state, ctx, request).await)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use axum::http::HeaderValue;
    use meshcall_core::code::UNIMPLEMENTED;

    use super::*;
    use crate::network::{NetworkConfig, ShutdownController};
    use crate::service::config::DispatchConfig;
    use crate::service::{build_call_pipeline, DispatcherBuilder, InstrumentMode};

    fn ready_state() -> AppState {
        let mut builder = DispatcherBuilder::new(InstrumentMode::Dev);
        builder.with_builtin();
        let dispatcher = Arc::new(builder.build());
        let state = AppState {
            pipeline: build_call_pipeline(dispatcher.clone(), &DispatchConfig::default()),
            dispatcher,
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(NetworkConfig::default()),
            start_time: Instant::now(),
        };
        state.shutdown.set_ready();
        state
    }

    #[test]
    fn headers_become_context() {
        let mut headers = HeaderMap::new();
        headers.insert("trace", HeaderValue::from_static("t-1"));
        headers.insert("user", HeaderValue::from_static("alice"));
        headers.insert("timeout-ms", HeaderValue::from_static("1500"));
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8"));
        headers.insert("x-tenant", HeaderValue::from_static("acme"));

        let ctx = context_from_headers(&headers);
        assert_eq!(ctx.trace_id, "t-1");
        assert_eq!(ctx.user, "alice");
        assert_eq!(ctx.user_agent, "curl/8");
        assert_eq!(ctx.extra.get("x-tenant").map(String::as_str), Some("acme"));
        assert!(ctx.remaining().unwrap() <= Duration::from_millis(1500));
    }

    #[test]
    fn request_id_stands_in_for_trace() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-9"));
        assert_eq!(context_from_headers(&headers).trace_id, "req-9");
    }

    #[tokio::test]
    async fn api_call_reaches_builtin() {
        let Json(rsp) = api_handler(
            State(ready_state()),
            Path(("sys".to_string(), "methods".to_string())),
            HeaderMap::new(),
            Bytes::new(),
        )
        .await;
        assert_eq!(rsp.code, 0);
        let listing: serde_json::Value = serde_json::from_slice(rsp.data()).unwrap();
        assert_eq!(listing["sys"], serde_json::json!(["heartbeat", "methods"]));
    }

    #[tokio::test]
    async fn api_unknown_app_is_unimplemented() {
        let Json(rsp) = api_handler(
            State(ready_state()),
            Path(("billing".to_string(), "charge".to_string())),
            HeaderMap::new(),
            Bytes::from_static(b"{}"),
        )
        .await;
        assert_eq!(rsp.code, UNIMPLEMENTED);
        assert_eq!(rsp.msg, "app [billing] not implemented");
    }

    #[tokio::test]
    async fn api_unknown_method_is_unimplemented() {
        let Json(rsp) = api_handler(
            State(ready_state()),
            Path(("sys".to_string(), "reboot".to_string())),
            HeaderMap::new(),
            Bytes::new(),
        )
        .await;
        assert_eq!(rsp.code, UNIMPLEMENTED);
        assert_eq!(rsp.msg, "method [reboot] not implemented");
    }

    #[tokio::test]
    async fn draining_gateway_rejects_calls() {
        let state = ready_state();
        state.shutdown.trigger_shutdown();
        let Json(rsp) = api_handler(
            State(state),
            Path(("sys".to_string(), "heartbeat".to_string())),
            HeaderMap::new(),
            Bytes::new(),
        )
        .await;
        assert_eq!(rsp.code, RESOURCE_EXHAUSTED);
        assert_eq!(rsp.msg, DRAINING_MSG);
    }

    #[tokio::test]
    async fn rpc_round_trip_and_malformed_envelope() {
        let state = ready_state();
        let body = serde_json::to_vec(&Request::new("sys", "heartbeat", "")).unwrap();
        let Json(rsp) =
            rpc_handler(State(state.clone()), HeaderMap::new(), Bytes::from(body)).await;
        assert!(rsp.is_ok());
        let beat: serde_json::Value = rsp.decode().unwrap();
        assert!(beat["tick"].as_u64().unwrap() > 0);

        let Json(rsp) =
            rpc_handler(State(state), HeaderMap::new(), Bytes::from_static(b"not json")).await;
        assert_eq!(rsp.code(), INVALID_ARGUMENT);
    }
}
