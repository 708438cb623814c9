use std::sync::Arc;

use axum::{
    extract::State,
    http::{
        header::{AUTHORIZATION, COOKIE, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    middleware::Next,
    response::Response,
};
use tracing::warn;

use memberguard_callback::constant_time_eq;
use memberguard_core::SessionId;

use crate::app::errors::json_error;
use crate::context::SessionContext;

pub const SESSION_COOKIE: &str = "memberguard_session";

#[derive(Debug, Clone, Copy)]
pub struct SessionState {
    /// Mark the cookie `Secure` (public URL is https).
    pub secure: bool,
}

/// Attach a [`SessionContext`], minting a session (and cookie) when none came in.
pub async fn session_middleware(
    State(state): State<SessionState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let existing = extract_session(req.headers());
    let session_id = existing.unwrap_or_default();
    req.extensions_mut()
        .insert(SessionContext::new(session_id, existing.is_none()));

    let mut response = next.run(req).await;

    if existing.is_none() {
        if let Ok(value) = HeaderValue::from_str(&session_cookie(session_id, state.secure)) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

#[derive(Debug, Clone, Default)]
pub struct ProxyAuthState {
    /// Expected bearer token; `None` leaves the proxy routes open.
    pub token: Option<Arc<str>>,
}

/// Require the proxy's bearer token on routes only the proxy may call.
pub async fn proxy_auth_middleware(
    State(state): State<ProxyAuthState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(expected) = &state.token {
        let presented = extract_bearer(req.headers()).unwrap_or_default();
        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            warn!(path = %req.uri().path(), "rejected proxy call without a valid token");
            return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid proxy token");
        }
    }
    next.run(req).await
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let token = headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?
        .trim();
    (!token.is_empty()).then_some(token)
}

fn extract_session(headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .and_then(|(_, value)| value.trim().parse().ok())
}

fn session_cookie(session_id: SessionId, secure: bool) -> String {
    // Lax: the registrar sends the browser back with a top-level GET.
    let mut cookie = format!("{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Lax");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_is_read_among_other_cookies() {
        let session = SessionId::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("theme=dark; {SESSION_COOKIE}={session}; lang=cs")).unwrap(),
        );
        assert_eq!(extract_session(&headers), Some(session));
    }

    #[test]
    fn malformed_session_cookie_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("memberguard_session=not-a-uuid"));
        assert_eq!(extract_session(&headers), None);
        assert_eq!(extract_session(&HeaderMap::new()), None);
    }

    #[test]
    fn bearer_token_is_read_from_authorization() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic cHJveHk6c2VjcmV0"));
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer s3cret "));
        assert_eq!(extract_bearer(&headers), Some("s3cret"));
    }

    #[test]
    fn cookie_attributes() {
        let session = SessionId::new();
        let plain = session_cookie(session, false);
        assert!(plain.starts_with(&format!("{SESSION_COOKIE}={session};")));
        assert!(plain.contains("HttpOnly") && plain.contains("SameSite=Lax"));
        assert!(!plain.contains("Secure"));
        assert!(session_cookie(session, true).ends_with("; Secure"));
    }
}
