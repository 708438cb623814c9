use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, response::Response, Json};
use tracing::warn;

use crate::app::dto::{ContinueResponse, RequestData, ResumeRequest};
use crate::app::errors::{flow_error_to_response, redirect};
use crate::app::flow::FlowOutcome;
use crate::app::services::AppServices;
use crate::context::SessionContext;

pub async fn process(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(session): Extension<SessionContext>,
    Json(data): Json<RequestData>,
) -> Response {
    let result = services.flow.process(session.session_id(), data).await;
    respond(&services, result)
}

/// The registrar sends the browser back here once registration is done.
///
/// Answers with a redirect only; restored request data goes to the proxy
/// through `/resume`.
pub async fn callback(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(session): Extension<SessionContext>,
) -> Response {
    if session.is_new() {
        warn!(session = %session.session_id(), "registration callback arrived without a session cookie");
    }
    let result = services.flow.resume(session.session_id()).await;
    respond(&services, result)
}

/// The proxy redeems a handoff ticket for the restored request.
pub async fn resume(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<ResumeRequest>,
) -> Response {
    match services.flow.redeem(&body.ticket) {
        Ok(data) => Json(ContinueResponse::new(data)).into_response(),
        Err(e) => flow_error_to_response(e, &services.flow.settings().unauthorized_url),
    }
}

pub async fn jwks(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(services.jwks.clone())
}

fn respond(services: &AppServices, result: Result<FlowOutcome, crate::app::flow::FlowError>) -> Response {
    match result {
        Ok(FlowOutcome::Continue(data)) => Json(ContinueResponse::new(data)).into_response(),
        Ok(FlowOutcome::Redirect(location)) => redirect(&location),
        Err(e) => flow_error_to_response(e, &services.flow.settings().unauthorized_url),
    }
}
