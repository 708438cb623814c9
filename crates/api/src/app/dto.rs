//! Request/response bodies exchanged with the hosting proxy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use memberguard_core::PerunUser;

/// The authentication request as the proxy hands it over.
///
/// Only the fields the membership check reads are typed; everything else is
/// carried through untouched in `extra`, so a parked request comes back with
/// exactly what went in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    /// Set by the user-resolution step that runs before the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<PerunUser>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_info: Option<AuthInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// Identity provider the user authenticated at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of `POST /resume`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResumeRequest {
    pub ticket: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContinueResponse {
    pub action: &'static str,
    pub data: RequestData,
}

impl ContinueResponse {
    pub fn new(data: RequestData) -> Self {
        Self {
            action: "continue",
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let body = json!({
            "user": {"id": 42, "name": "Jane"},
            "attributes": {"eduPersonPrincipalName": ["jane@idp.example.org"]},
            "auth_info": {"issuer": "https://idp.example.org", "timestamp": "2026-01-01T00:00:00Z"},
            "state": {"target": "/dashboard"}
        });

        let data: RequestData = serde_json::from_value(body.clone()).unwrap();
        assert_eq!(data.user.as_ref().map(|u| u.name.as_str()), Some("Jane"));
        assert_eq!(
            data.auth_info.as_ref().and_then(|a| a.issuer.as_deref()),
            Some("https://idp.example.org")
        );
        assert_eq!(serde_json::to_value(&data).unwrap(), body);
    }

    #[test]
    fn user_is_optional() {
        let data: RequestData = serde_json::from_value(json!({"attributes": {}})).unwrap();
        assert!(data.user.is_none());
        assert!(data.extra.is_empty());
    }
}
