//! HTTP router and handlers

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error};

use super::source::MetricsSource;
use crate::mtls::{AuthorizationGate, ClientIdentity, PolicyDecision};
use crate::telemetry;

/// Content type of the Prometheus text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Fixed body of every 403; the reason is only logged.
pub const FORBIDDEN_BODY: &str = "Forbidden";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Identity allow-list
    pub gate: Arc<AuthorizationGate>,
    /// Payload provider
    pub source: Arc<dyn MetricsSource>,
}

/// Create the router.
///
/// The authorization layer wraps every route *and* the fallback, so a request
/// that is not allow-listed gets 403 before method or path routing happen.
pub fn create_router(metrics_path: &str, state: AppState) -> Router {
    Router::new()
        .route(metrics_path, get(metrics_handler))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.gate),
            authorization_middleware,
        ))
        .layer(middleware::from_fn(request_metrics_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET <metrics_path>
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.source.gather().await {
        Ok(body) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Metrics source failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, FORBIDDEN_BODY).into_response()
}

/// Check the connection's [`ClientIdentity`] against the allow-list.
///
/// A request without an identity extension never came through the mTLS
/// listener and is denied.
pub async fn authorization_middleware(
    State(gate): State<Arc<AuthorizationGate>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(identity) = request.extensions().get::<ClientIdentity>() else {
        debug!(path = %request.uri().path(), "Request without client identity");
        telemetry::record_authorization(PolicyDecision::Deny.as_str());
        return forbidden();
    };

    match gate.check(identity, request.uri().path(), request.method()) {
        Ok(()) => {
            telemetry::record_authorization(PolicyDecision::Allow.as_str());
            next.run(request).await
        }
        Err(_) => {
            telemetry::record_authorization(PolicyDecision::Deny.as_str());
            forbidden()
        }
    }
}

async fn request_metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let started = Instant::now();
    let response = next.run(request).await;
    telemetry::record_http_request(method.as_str(), response.status().as_u16(), started.elapsed());
    response
}
