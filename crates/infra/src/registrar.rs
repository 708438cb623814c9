//! HTTP client fetching registration outcomes from the registrar.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use memberguard_callback::{FetchError, RegistrationResult, RegistrationResultClient};

#[derive(Debug, Clone)]
pub struct HttpResultClient {
    http: reqwest::Client,
}

impl HttpResultClient {
    /// Every fetch is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl RegistrationResultClient for HttpResultClient {
    async fn fetch(&self, url: Url) -> Result<RegistrationResult, FetchError> {
        debug!(host = url.host_str().unwrap_or_default(), "fetching registration result");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response
            .json::<RegistrationResult>()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn registrar(Path(token): Path<String>) -> Response {
        match token.as_str() {
            "slow" => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::OK.into_response()
            }
            "broken" => (StatusCode::OK, "not json").into_response(),
            "missing" => StatusCode::NOT_FOUND.into_response(),
            other => Json(json!({"result": "okay", "nonce": other})).into_response(),
        }
    }

    async fn spawn_registrar() -> Url {
        let app = Router::new().route("/result/:token", get(registrar));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/result/")).unwrap()
    }

    #[tokio::test]
    async fn fetches_and_classifies_outcomes() {
        let base = spawn_registrar().await;
        let client = HttpResultClient::new(Duration::from_millis(500)).unwrap();

        let ok = client.fetch(base.join("abc").unwrap()).await.unwrap();
        assert_eq!(ok, RegistrationResult::okay("abc"));

        let missing = client.fetch(base.join("missing").unwrap()).await.unwrap_err();
        assert_eq!(missing, FetchError::Status(404));

        let broken = client.fetch(base.join("broken").unwrap()).await.unwrap_err();
        assert!(matches!(broken, FetchError::Malformed(_)));

        let slow = client.fetch(base.join("slow").unwrap()).await.unwrap_err();
        assert!(matches!(slow, FetchError::Transport(_)));
    }
}
