//! Pending callback state, scoped to `(session, caller)`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use memberguard_core::SessionId;

use crate::nonce::Nonce;

/// What a caller left behind before redirecting the user away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCallbackState {
    /// Identity of the component that issued the redirect.
    pub caller: String,
    pub nonce: Nonce,
    /// The original request, serialized.
    pub snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl PendingCallbackState {
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.created_at) > ttl
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The store's internal lock was poisoned by a panicking writer.
    #[error("state store lock poisoned")]
    Poisoned,

    #[error("state store backend error: {0}")]
    Backend(String),
}

/// Session-scoped store for pending callbacks.
///
/// One writer per `(session, caller)` key at a time is assumed; a session
/// has at most one outstanding registration per caller.
pub trait StateStore: Send + Sync {
    /// Store `state`, replacing (and returning) any earlier pending state for the same caller.
    fn save(
        &self,
        session: SessionId,
        state: PendingCallbackState,
    ) -> Result<Option<PendingCallbackState>, StateError>;

    fn load(&self, session: SessionId, caller: &str) -> Result<Option<PendingCallbackState>, StateError>;

    /// Remove the pending state, but only if it still carries `nonce`.
    ///
    /// Returns whether something was removed.
    fn clear(&self, session: SessionId, caller: &str, nonce: &Nonce) -> Result<bool, StateError>;
}

impl<S> StateStore for Arc<S>
where
    S: StateStore + ?Sized,
{
    fn save(
        &self,
        session: SessionId,
        state: PendingCallbackState,
    ) -> Result<Option<PendingCallbackState>, StateError> {
        (**self).save(session, state)
    }

    fn load(&self, session: SessionId, caller: &str) -> Result<Option<PendingCallbackState>, StateError> {
        (**self).load(session, caller)
    }

    fn clear(&self, session: SessionId, caller: &str, nonce: &Nonce) -> Result<bool, StateError> {
        (**self).clear(session, caller, nonce)
    }
}

/// In-memory state store for tests/dev and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    inner: RwLock<HashMap<(SessionId, String), PendingCallbackState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry older than `ttl`. Returns how many were dropped.
    pub fn purge_expired(&self, ttl: Duration, now: DateTime<Utc>) -> Result<usize, StateError> {
        let mut map = self.inner.write().map_err(|_| StateError::Poisoned)?;
        let before = map.len();
        map.retain(|_, state| !state.is_expired(ttl, now));
        Ok(before - map.len())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for InMemoryStateStore {
    fn save(
        &self,
        session: SessionId,
        state: PendingCallbackState,
    ) -> Result<Option<PendingCallbackState>, StateError> {
        let mut map = self.inner.write().map_err(|_| StateError::Poisoned)?;
        Ok(map.insert((session, state.caller.clone()), state))
    }

    fn load(&self, session: SessionId, caller: &str) -> Result<Option<PendingCallbackState>, StateError> {
        let map = self.inner.read().map_err(|_| StateError::Poisoned)?;
        Ok(map.get(&(session, caller.to_string())).cloned())
    }

    fn clear(&self, session: SessionId, caller: &str, nonce: &Nonce) -> Result<bool, StateError> {
        let mut map = self.inner.write().map_err(|_| StateError::Poisoned)?;
        let key = (session, caller.to_string());
        match map.get(&key) {
            Some(state) if state.nonce == *nonce => {
                map.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
