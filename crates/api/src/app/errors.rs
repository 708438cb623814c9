use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, warn};
use url::Url;

use memberguard_auth::GateError;
use memberguard_callback::CallbackError;

use crate::app::flow::FlowError;
use crate::app::handoff::HandoffError;

/// Map a failed membership check to an HTTP response.
///
/// A registration result that could not be fetched sends the user to the
/// unauthorized page; the pending request stays parked for a retry.
pub fn flow_error_to_response(err: FlowError, unauthorized_url: &Url) -> Response {
    match err {
        FlowError::MissingPrerequisite(_) => {
            error!(error = %err, "membership check misconfigured");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "missing_prerequisite", err.to_string())
        }
        FlowError::Gate(GateError::Configuration(msg)) => {
            error!(error = %msg, "membership check misconfigured");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "configuration_error", msg)
        }
        FlowError::Gate(GateError::Upstream(e)) => {
            warn!(error = %e, "membership directory failed");
            json_error(StatusCode::BAD_GATEWAY, "upstream_unavailable", e.to_string())
        }
        FlowError::Callback(CallbackError::StateLost { .. }) => {
            json_error(StatusCode::BAD_REQUEST, "state_lost", err.to_string())
        }
        FlowError::Callback(CallbackError::StateExpired { .. }) => {
            json_error(StatusCode::BAD_REQUEST, "state_expired", err.to_string())
        }
        FlowError::Callback(CallbackError::Fetch(_)) => redirect(unauthorized_url),
        FlowError::Callback(e) => {
            error!(error = %e, "registration round trip failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "callback_error", e.to_string())
        }
        FlowError::Handoff(HandoffError::Unknown) => {
            json_error(StatusCode::BAD_REQUEST, "handoff_unknown", err.to_string())
        }
        FlowError::Handoff(HandoffError::Expired) => {
            json_error(StatusCode::BAD_REQUEST, "handoff_expired", err.to_string())
        }
        FlowError::Handoff(e) => {
            error!(error = %e, "handoff failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
        }
        FlowError::Lifecycle(e) => {
            error!(error = %e, "request lifecycle violated");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
        }
    }
}

/// `302 Found` to `location`.
pub fn redirect(location: &Url) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.as_str().to_string())]).into_response()
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use memberguard_auth::OracleError;
    use memberguard_callback::FetchError;

    fn unauthorized() -> Url {
        Url::parse("https://proxy.example.org/unauthorized").unwrap()
    }

    #[test]
    fn status_codes_follow_the_error_kind() {
        let cases = [
            (FlowError::MissingPrerequisite("perun.user"), StatusCode::INTERNAL_SERVER_ERROR),
            (
                FlowError::Gate(GateError::Configuration("VO 'x' not found".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                FlowError::Gate(GateError::Upstream(OracleError::Unavailable("down".into()))),
                StatusCode::BAD_GATEWAY,
            ),
            (
                FlowError::Callback(CallbackError::StateLost { caller: "c".into() }),
                StatusCode::BAD_REQUEST,
            ),
            (
                FlowError::Callback(CallbackError::StateExpired { caller: "c".into() }),
                StatusCode::BAD_REQUEST,
            ),
            (FlowError::Callback(CallbackError::NonceCollision), StatusCode::INTERNAL_SERVER_ERROR),
            (FlowError::Handoff(HandoffError::Unknown), StatusCode::BAD_REQUEST),
            (FlowError::Handoff(HandoffError::Expired), StatusCode::BAD_REQUEST),
            (FlowError::Handoff(HandoffError::Poisoned), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(flow_error_to_response(err, &unauthorized()).status(), status);
        }
    }

    #[test]
    fn failed_fetch_redirects_to_the_unauthorized_page() {
        let response = flow_error_to_response(
            FlowError::Callback(CallbackError::Fetch(FetchError::Status(503))),
            &unauthorized(),
        );
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://proxy.example.org/unauthorized"
        );
    }
}
