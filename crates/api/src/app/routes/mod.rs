use axum::{
    routing::{get, post},
    Router,
};

use memberguard_callback::callback_path;

use crate::middleware::{proxy_auth_middleware, ProxyAuthState};

pub mod gate;
pub mod system;

/// Router for the membership check endpoints.
///
/// `/process` and `/resume` are called by the hosting proxy only; the
/// callback and the key set are reached by browsers and the registrar.
pub fn router(proxy_auth: ProxyAuthState) -> Router {
    let from_proxy = Router::new()
        .route("/process", post(gate::process))
        .route("/resume", post(gate::resume))
        .route_layer(axum::middleware::from_fn_with_state(proxy_auth, proxy_auth_middleware));

    Router::new()
        .route(&callback_path(), get(gate::callback))
        .route("/perunensuremember/jwks", get(gate::jwks))
        .merge(from_proxy)
}
