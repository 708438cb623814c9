//! Service wiring: configuration in, a ready [`AppServices`] out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use memberguard_auth::{GatePolicy, MembershipGate, OracleError};
use memberguard_callback::{
    FetchError, InMemoryStateStore, Keystore, SecureCallback, SigningError,
};
use memberguard_infra::{
    config::MemberguardConfig, HttpResultClient, PerunRpcOracle, SyncQueue, SyncQueueConfig,
};

use crate::app::flow::{callback_url, FlowSettings, MembershipFlow};
use crate::app::handoff::HandoffStore;

/// Everything the HTTP handlers need.
pub struct AppServices {
    pub flow: MembershipFlow,
    /// Public signing keys, served to the registrar.
    pub jwks: serde_json::Value,
    /// Mark the session cookie `Secure`.
    pub secure_cookies: bool,
    /// Bearer token the proxy presents on `/process` and `/resume`.
    pub proxy_token: Option<String>,
}

impl AppServices {
    pub fn new(flow: MembershipFlow, jwks: serde_json::Value) -> Self {
        let secure_cookies = flow.settings().callback_url.scheme() == "https";
        Self {
            flow,
            jwks,
            secure_cookies,
            proxy_token: None,
        }
    }

    pub fn with_proxy_token(mut self, token: Option<String>) -> Self {
        self.proxy_token = token;
        self
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("signing setup failed: {0}")]
    Signing(#[from] SigningError),

    #[error("membership directory client: {0}")]
    Directory(#[from] OracleError),

    #[error("registration result client: {0}")]
    ResultClient(#[from] FetchError),

    #[error("invalid public base url: {0}")]
    PublicUrl(#[from] url::ParseError),
}

impl FlowSettings {
    pub fn from_config(config: &MemberguardConfig) -> Result<Self, url::ParseError> {
        Ok(Self {
            register_url: config.gate.register_url.clone(),
            callback_parameter_name: config.gate.callback_parameter_name.clone(),
            callback_url: callback_url(&config.http.public_base_url)?,
            unauthorized_url: config.gate.unauthorized_redirect_url.clone(),
            resume_url: config.gate.resume_url.clone(),
            identifier_attributes: config.sync.identifier_attributes.clone(),
        })
    }
}

/// Wire the production services: Perun RPC directory, HTTP registrar client,
/// in-memory pending state.
///
/// Spawns background tasks, so it must run inside a tokio runtime.
pub fn build_services(config: &MemberguardConfig) -> Result<AppServices, ServiceError> {
    let keystore = Keystore::from_file(&config.signing.keystore)?;
    let signer = keystore.signer(&config.signing.key_id, config.signing.token_alg)?;

    let oracle = Arc::new(PerunRpcOracle::new(&config.perun)?);
    let results = Arc::new(HttpResultClient::new(config.gate.result_fetch_timeout)?);
    let store = Arc::new(InMemoryStateStore::new());
    let handoffs = Arc::new(HandoffStore::new(config.gate.handoff_ttl));
    spawn_janitor(store.clone(), config.gate.state_ttl, handoffs.clone());

    let callback = SecureCallback::new(
        signer,
        store,
        results,
        config.gate.registration_result_url.clone(),
        config.gate.state_ttl,
    );
    let gate = MembershipGate::new(
        oracle.clone(),
        GatePolicy::new(config.gate.vo_short_name.clone(), config.gate.group_name.clone()),
    );
    let sync = config
        .sync
        .enabled
        .then(|| Arc::new(SyncQueue::spawn(oracle, SyncQueueConfig::from(&config.sync))));

    info!(
        vo = %config.gate.vo_short_name,
        group = ?config.gate.group_name,
        key_id = %config.signing.key_id,
        sync = config.sync.enabled,
        proxy_auth = config.http.proxy_token.is_some(),
        "membership check ready"
    );

    let flow = MembershipFlow::new(gate, callback, FlowSettings::from_config(config)?, handoffs, sync);
    Ok(AppServices::new(flow, keystore.public_jwks()).with_proxy_token(config.http.proxy_token.clone()))
}

/// Periodically drop pending registrations nobody came back for and
/// handoff tickets the proxy never redeemed.
pub fn spawn_janitor(
    store: Arc<InMemoryStateStore>,
    state_ttl: Duration,
    handoffs: Arc<HandoffStore>,
) -> JoinHandle<()> {
    let period = state_ttl.clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        loop {
            tick.tick().await;
            let now = Utc::now();
            match store.purge_expired(state_ttl, now) {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "dropped expired pending registrations"),
                Err(e) => warn!(error = %e, "could not purge pending registrations"),
            }
            match handoffs.purge_expired(now) {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "dropped unredeemed handoff tickets"),
                Err(e) => warn!(error = %e, "could not purge handoff tickets"),
            }
        }
    })
}
