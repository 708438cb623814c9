//! Secure redirect to an external registrar and verified resume afterwards.
//!
//! `initiate` generates a nonce, signs it together with the registration
//! parameters, parks the caller's request snapshot and returns the redirect.
//! `resume` picks the snapshot back up, asks the registrar (with a freshly
//! signed request carrying the same nonce) how the registration went and
//! hands the snapshot back for re-evaluation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use memberguard_core::SessionId;

use crate::keystore::{SignedRequest, SigningError, TokenSigner};
use crate::nonce::Nonce;
use crate::state::{PendingCallbackState, StateError, StateStore};

/// Path prefix owned by the membership check.
pub const CALLBACK_PREFIX: &str = "perunensuremember";
/// Endpoint under [`CALLBACK_PREFIX`] the registrar sends the browser back to.
pub const CALLBACK_ENDPOINT: &str = "/process";

/// How many times `initiate` regenerates a nonce that collides with the pending one.
const MAX_NONCE_ATTEMPTS: usize = 4;

/// Absolute path of the callback endpoint, e.g. `/perunensuremember/process`.
pub fn callback_path() -> String {
    format!("/{CALLBACK_PREFIX}{CALLBACK_ENDPOINT}")
}

/// Route pattern the hosting proxy matches (relative, anchored).
pub fn callback_pattern() -> String {
    format!("^{CALLBACK_PREFIX}{CALLBACK_ENDPOINT}$")
}

/// Registrar's answer to "how did the registration go".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub result: String,
    pub nonce: String,
}

impl RegistrationResult {
    pub const OKAY: &'static str = "okay";

    pub fn okay(nonce: impl Into<String>) -> Self {
        Self {
            result: Self::OKAY.to_string(),
            nonce: nonce.into(),
        }
    }

    pub fn is_okay(&self) -> bool {
        self.result == Self::OKAY
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("registration result request failed: {0}")]
    Transport(String),

    #[error("registrar answered with HTTP {0}")]
    Status(u16),

    #[error("malformed registration result: {0}")]
    Malformed(String),
}

/// Fetches registration outcomes from the registrar.
#[async_trait]
pub trait RegistrationResultClient: Send + Sync {
    async fn fetch(&self, url: Url) -> Result<RegistrationResult, FetchError>;
}

#[async_trait]
impl<C> RegistrationResultClient for Arc<C>
where
    C: RegistrationResultClient + ?Sized,
{
    async fn fetch(&self, url: Url) -> Result<RegistrationResult, FetchError> {
        (**self).fetch(url).await
    }
}

/// Where to send the user and what to sign into the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationTarget {
    pub url: Url,
    pub vo: String,
    pub group: Option<String>,
    /// Extra signed parameters (e.g. the callback URL under its configured name).
    pub params: BTreeMap<String, String>,
}

impl RegistrationTarget {
    pub fn new(url: Url, vo: impl Into<String>, group: Option<String>) -> Self {
        Self {
            url,
            vo: vo.into(),
            group,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    fn signed_params(&self) -> BTreeMap<String, String> {
        let mut params = self.params.clone();
        params.insert("vo".to_string(), self.vo.clone());
        if let Some(group) = &self.group {
            params.insert("group".to_string(), group.clone());
        }
        params
    }
}

/// "Send an HTTP redirect to `location`."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectInstruction {
    pub location: Url,
}

#[derive(Debug, Clone)]
pub struct Initiated {
    pub redirect: RedirectInstruction,
    pub nonce: Nonce,
}

/// Whether the registrar confirmed the registration this callback belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Confirmed,
    /// Not confirmed (result other than "okay" or nonce mismatch). Processing
    /// still resumes; membership is simply re-evaluated.
    Unverified(String),
}

impl RegistrationOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, RegistrationOutcome::Confirmed)
    }
}

#[derive(Debug, Clone)]
pub struct Resumed<T> {
    pub snapshot: T,
    pub outcome: RegistrationOutcome,
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("no pending registration for '{caller}' in this session")]
    StateLost { caller: String },

    #[error("pending registration for '{caller}' has expired")]
    StateExpired { caller: String },

    #[error(transparent)]
    State(#[from] StateError),

    /// Outcome could not be fetched; the pending state is kept for a retry.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("request snapshot could not be (de)serialized: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("could not generate a nonce distinct from the pending one")]
    NonceCollision,
}

/// The secure callback protocol, bound to one signing key and state store.
pub struct SecureCallback {
    signer: TokenSigner,
    store: Arc<dyn StateStore>,
    results: Arc<dyn RegistrationResultClient>,
    result_url: Url,
    state_ttl: Duration,
}

impl SecureCallback {
    pub fn new(
        signer: TokenSigner,
        store: Arc<dyn StateStore>,
        results: Arc<dyn RegistrationResultClient>,
        result_url: Url,
        state_ttl: Duration,
    ) -> Self {
        Self {
            signer,
            store,
            results,
            result_url,
            state_ttl,
        }
    }

    pub fn state_ttl(&self) -> Duration {
        self.state_ttl
    }

    /// Park `snapshot` under `(session, caller)` and build the signed redirect.
    ///
    /// Nothing is returned until the state has been written, so a redirect
    /// always has a stored nonce behind it.
    pub fn initiate<T: Serialize>(
        &self,
        session: SessionId,
        caller: &str,
        target: &RegistrationTarget,
        snapshot: &T,
    ) -> Result<Initiated, CallbackError> {
        let pending_nonce = self.store.load(session, caller)?.map(|state| state.nonce);
        let nonce = fresh_nonce(pending_nonce.as_ref())?;

        let now = Utc::now();
        let claims = SignedRequest {
            nonce: nonce.as_str().to_string(),
            time: now.timestamp().to_string(),
            params: target.signed_params(),
        };
        let token = self.signer.sign(&claims)?;

        let state = PendingCallbackState {
            caller: caller.to_string(),
            nonce: nonce.clone(),
            snapshot: serde_json::to_value(snapshot)?,
            created_at: now,
        };
        if self.store.save(session, state)?.is_some() {
            debug!(%session, caller, "replaced earlier pending registration");
        }

        let mut location = append_segment(&target.url, &token)?;
        {
            let mut query = location.query_pairs_mut();
            query.append_pair("vo", &target.vo);
            if let Some(group) = &target.group {
                query.append_pair("group", group);
            }
        }

        info!(%session, caller, vo = %target.vo, group = ?target.group, "redirecting to registration");
        Ok(Initiated {
            redirect: RedirectInstruction { location },
            nonce,
        })
    }

    /// Recover the parked snapshot for `(session, caller)` and check the outcome.
    ///
    /// An unverified outcome is not an error: the snapshot comes back with
    /// [`RegistrationOutcome::Unverified`] and the caller re-evaluates.
    pub async fn resume<T: DeserializeOwned>(
        &self,
        session: SessionId,
        caller: &str,
    ) -> Result<Resumed<T>, CallbackError> {
        let pending = self
            .store
            .load(session, caller)?
            .ok_or_else(|| CallbackError::StateLost {
                caller: caller.to_string(),
            })?;

        let now = Utc::now();
        if pending.is_expired(self.state_ttl, now) {
            self.store.clear(session, caller, &pending.nonce)?;
            warn!(%session, caller, created_at = %pending.created_at, "pending registration expired");
            return Err(CallbackError::StateExpired {
                caller: caller.to_string(),
            });
        }

        let claims = SignedRequest {
            nonce: pending.nonce.as_str().to_string(),
            time: now.timestamp().to_string(),
            params: BTreeMap::new(),
        };
        let token = self.signer.sign(&claims)?;
        let url = append_segment(&self.result_url, &token)?;

        // The store is not locked here; the fetch may take up to its timeout.
        let result = match self.results.fetch(url).await {
            Ok(result) => result,
            Err(e) => {
                warn!(%session, caller, error = %e, "could not fetch registration result");
                return Err(e.into());
            }
        };

        let outcome = if !result.is_okay() {
            RegistrationOutcome::Unverified(format!("registrar reported '{}'", result.result))
        } else if !pending.nonce.matches(&result.nonce) {
            RegistrationOutcome::Unverified("nonce mismatch".to_string())
        } else {
            RegistrationOutcome::Confirmed
        };

        match &outcome {
            RegistrationOutcome::Confirmed => info!(%session, caller, "registration confirmed"),
            RegistrationOutcome::Unverified(reason) => {
                warn!(%session, caller, reason = %reason, "Registration was unsuccessful.")
            }
        }

        if !self.store.clear(session, caller, &pending.nonce)? {
            debug!(%session, caller, "pending registration was replaced during resume");
        }

        Ok(Resumed {
            snapshot: serde_json::from_value(pending.snapshot)?,
            outcome,
        })
    }
}

fn fresh_nonce(pending: Option<&Nonce>) -> Result<Nonce, CallbackError> {
    for _ in 0..MAX_NONCE_ATTEMPTS {
        let nonce = Nonce::generate();
        if pending != Some(&nonce) {
            return Ok(nonce);
        }
    }
    Err(CallbackError::NonceCollision)
}

fn append_segment(base: &Url, segment: &str) -> Result<Url, CallbackError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| CallbackError::InvalidUrl(format!("{base} cannot have path segments")))?
        .pop_if_empty()
        .push(segment);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use jsonwebtoken::Algorithm;
    use serde_json::json;

    use crate::keystore::tests::HMAC_KEYSTORE;
    use crate::keystore::{Keystore, TokenVerifier};
    use crate::state::InMemoryStateStore;

    const CALLER: &str = "ensure_member";

    #[derive(Clone, Copy)]
    enum Registrar {
        Echo,
        TamperNonce,
        NotOkay,
        Down,
    }

    /// Registrar double: verifies the signed request and answers per its mode.
    struct FakeRegistrar {
        verifier: TokenVerifier,
        mode: Registrar,
        seen: Mutex<Vec<Url>>,
    }

    #[async_trait]
    impl RegistrationResultClient for FakeRegistrar {
        async fn fetch(&self, url: Url) -> Result<RegistrationResult, FetchError> {
            self.seen.lock().unwrap().push(url.clone());
            let token = url.path_segments().and_then(|mut s| s.next_back()).unwrap_or_default();
            let claims: SignedRequest = self
                .verifier
                .verify(token)
                .map_err(|e| FetchError::Malformed(e.to_string()))?;

            match self.mode {
                Registrar::Echo => Ok(RegistrationResult::okay(claims.nonce)),
                Registrar::TamperNonce => {
                    let mut nonce = claims.nonce;
                    let last = nonce.pop().unwrap();
                    nonce.push(if last == 'z' { 'a' } else { 'z' });
                    Ok(RegistrationResult::okay(nonce))
                }
                Registrar::NotOkay => Ok(RegistrationResult {
                    result: "denied".to_string(),
                    nonce: claims.nonce,
                }),
                Registrar::Down => Err(FetchError::Transport("connection refused".into())),
            }
        }
    }

    struct Harness {
        protocol: SecureCallback,
        store: Arc<InMemoryStateStore>,
        registrar: Arc<FakeRegistrar>,
        keystore: Keystore,
    }

    fn harness(mode: Registrar) -> Harness {
        let keystore = Keystore::from_json(HMAC_KEYSTORE).unwrap();
        let store = Arc::new(InMemoryStateStore::new());
        let registrar = Arc::new(FakeRegistrar {
            verifier: keystore.verifier(),
            mode,
            seen: Mutex::new(Vec::new()),
        });
        let protocol = SecureCallback::new(
            keystore.signer("hmac1", Algorithm::HS256).unwrap(),
            store.clone(),
            registrar.clone(),
            Url::parse("https://registrar.example.org/registrar/result/").unwrap(),
            Duration::from_secs(1800),
        );
        Harness {
            protocol,
            store,
            registrar,
            keystore,
        }
    }

    fn target() -> RegistrationTarget {
        RegistrationTarget::new(
            Url::parse("https://registrar.example.org/registrar/").unwrap(),
            "einfra",
            Some("members".to_string()),
        )
        .with_param("targetnew", "https://proxy.example.org/perunensuremember/process")
    }

    fn snapshot() -> serde_json::Value {
        json!({"user": {"id": 42, "name": "Jane Doe"}, "requester": "https://sp.example.org"})
    }

    #[test]
    fn callback_route_is_under_component_prefix() {
        assert_eq!(callback_path(), "/perunensuremember/process");
        assert_eq!(callback_pattern(), "^perunensuremember/process$");
    }

    #[tokio::test]
    async fn initiate_then_resume_with_echoed_nonce_is_confirmed() {
        let h = harness(Registrar::Echo);
        let session = SessionId::new();

        let initiated = h.protocol.initiate(session, CALLER, &target(), &snapshot()).unwrap();
        let resumed: Resumed<serde_json::Value> = h.protocol.resume(session, CALLER).await.unwrap();

        assert_eq!(resumed.outcome, RegistrationOutcome::Confirmed);
        assert_eq!(resumed.snapshot, snapshot());
        assert!(h.store.is_empty());

        let fetched = h.registrar.seen.lock().unwrap()[0].clone();
        assert!(fetched.as_str().starts_with("https://registrar.example.org/registrar/result/"));
        let claims: SignedRequest = h
            .keystore
            .verifier()
            .verify(fetched.path_segments().unwrap().next_back().unwrap())
            .unwrap();
        assert!(initiated.nonce.matches(&claims.nonce));
    }

    #[test]
    fn redirect_carries_signed_token_and_query() {
        let h = harness(Registrar::Echo);
        let initiated = h
            .protocol
            .initiate(SessionId::new(), CALLER, &target(), &snapshot())
            .unwrap();

        let location = initiated.redirect.location;
        let segments: Vec<&str> = location.path_segments().unwrap().collect();
        assert_eq!(segments[0], "registrar");
        assert_eq!(segments.len(), 2);

        let claims: SignedRequest = h.keystore.verifier().verify(segments[1]).unwrap();
        assert!(initiated.nonce.matches(&claims.nonce));
        assert_eq!(claims.params["vo"], "einfra");
        assert_eq!(claims.params["group"], "members");
        assert_eq!(
            claims.params["targetnew"],
            "https://proxy.example.org/perunensuremember/process"
        );
        assert!(claims.time.parse::<i64>().is_ok());

        let query: Vec<(String, String)> = location.query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![
                ("vo".to_string(), "einfra".to_string()),
                ("group".to_string(), "members".to_string()),
            ]
        );
    }

    #[test]
    fn state_is_written_before_redirect_is_returned() {
        let h = harness(Registrar::Echo);
        let session = SessionId::new();
        let initiated = h.protocol.initiate(session, CALLER, &target(), &snapshot()).unwrap();

        let pending = h.store.load(session, CALLER).unwrap().unwrap();
        assert_eq!(pending.nonce, initiated.nonce);
        assert_eq!(pending.snapshot, snapshot());
    }

    #[test]
    fn reinitiating_replaces_pending_nonce() {
        let h = harness(Registrar::Echo);
        let session = SessionId::new();
        let first = h.protocol.initiate(session, CALLER, &target(), &snapshot()).unwrap();
        let second = h.protocol.initiate(session, CALLER, &target(), &snapshot()).unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.store.load(session, CALLER).unwrap().unwrap().nonce, second.nonce);
    }

    #[tokio::test]
    async fn tampered_nonce_is_never_confirmed() {
        let h = harness(Registrar::TamperNonce);
        let session = SessionId::new();
        h.protocol.initiate(session, CALLER, &target(), &snapshot()).unwrap();

        let resumed: Resumed<serde_json::Value> = h.protocol.resume(session, CALLER).await.unwrap();
        assert_eq!(resumed.outcome, RegistrationOutcome::Unverified("nonce mismatch".into()));
        assert_eq!(resumed.snapshot, snapshot());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn non_okay_result_resumes_softly() {
        let h = harness(Registrar::NotOkay);
        let session = SessionId::new();
        h.protocol.initiate(session, CALLER, &target(), &snapshot()).unwrap();

        let resumed: Resumed<serde_json::Value> = h.protocol.resume(session, CALLER).await.unwrap();
        assert!(!resumed.outcome.is_confirmed());
        assert_eq!(resumed.snapshot, snapshot());
    }

    #[tokio::test]
    async fn fetch_failure_is_recoverable_and_keeps_state() {
        let h = harness(Registrar::Down);
        let session = SessionId::new();
        h.protocol.initiate(session, CALLER, &target(), &snapshot()).unwrap();

        let err = h
            .protocol
            .resume::<serde_json::Value>(session, CALLER)
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::Fetch(FetchError::Transport(_))));
        assert!(h.store.load(session, CALLER).unwrap().is_some());
    }

    #[tokio::test]
    async fn resume_without_pending_state_is_state_lost() {
        let h = harness(Registrar::Echo);
        let err = h
            .protocol
            .resume::<serde_json::Value>(SessionId::new(), CALLER)
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::StateLost { caller } if caller == CALLER));
        assert!(h.registrar.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_state_is_dropped_without_fetching() {
        let h = harness(Registrar::Echo);
        let session = SessionId::new();
        h.store
            .save(
                session,
                PendingCallbackState {
                    caller: CALLER.to_string(),
                    nonce: Nonce::generate(),
                    snapshot: snapshot(),
                    created_at: Utc::now() - chrono::Duration::hours(1),
                },
            )
            .unwrap();

        let err = h
            .protocol
            .resume::<serde_json::Value>(session, CALLER)
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::StateExpired { .. }));
        assert!(h.store.is_empty());
        assert!(h.registrar.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn fresh_nonce_avoids_pending_one() {
        let pending = Nonce::generate();
        let nonce = fresh_nonce(Some(&pending)).unwrap();
        assert_ne!(nonce, pending);
        assert!(fresh_nonce(None).is_ok());
    }
}
