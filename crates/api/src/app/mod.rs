//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: wiring from configuration
//! - `flow.rs`: the membership check as a request flow
//! - `handoff.rs`: server-side handover of restored requests
//! - `routes/`: HTTP handlers
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod flow;
pub mod handoff;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    let session_state = middleware::SessionState {
        secure: services.secure_cookies,
    };
    let proxy_auth = middleware::ProxyAuthState {
        token: services.proxy_token.as_deref().map(Arc::from),
    };

    // Every membership route runs inside a session.
    let membership = routes::router(proxy_auth).layer(
        ServiceBuilder::new()
            .layer(Extension(services))
            .layer(axum::middleware::from_fn_with_state(
                session_state,
                middleware::session_middleware,
            )),
    );

    Router::new()
        .route("/healthz", get(routes::system::health))
        .merge(membership)
}
