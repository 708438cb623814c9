//! Server-side handover of a request restored after registration.
//!
//! The browser only ever carries an opaque, single-use ticket back to the
//! proxy; the proxy redeems it over its own channel for the request data.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use memberguard_callback::Nonce;
use memberguard_core::SessionId;

use crate::app::dto::RequestData;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("unknown or already redeemed handoff ticket")]
    Unknown,

    #[error("handoff ticket expired")]
    Expired,

    #[error("handoff store lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct Parked {
    session: SessionId,
    data: RequestData,
}

/// Requests waiting for the proxy to pick them up, keyed by ticket.
///
/// Tickets are nonces, so their age is read off their timestamp prefix.
#[derive(Debug)]
pub struct HandoffStore {
    ttl: Duration,
    tickets: RwLock<HashMap<String, Parked>>,
}

impl HandoffStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tickets: RwLock::default(),
        }
    }

    /// Park `data` and return the ticket that redeems it.
    pub fn park(&self, session: SessionId, data: RequestData) -> Result<Nonce, HandoffError> {
        let ticket = Nonce::generate();
        let mut tickets = self.tickets.write().map_err(|_| HandoffError::Poisoned)?;
        tickets.insert(ticket.as_str().to_string(), Parked { session, data });
        Ok(ticket)
    }

    /// Take the request parked under `ticket`. A ticket redeems once.
    pub fn redeem(&self, ticket: &str, now: DateTime<Utc>) -> Result<(SessionId, RequestData), HandoffError> {
        let parked = self
            .tickets
            .write()
            .map_err(|_| HandoffError::Poisoned)?
            .remove(ticket)
            .ok_or(HandoffError::Unknown)?;
        if self.is_expired(ticket, now) {
            return Err(HandoffError::Expired);
        }
        Ok((parked.session, parked.data))
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, HandoffError> {
        let mut tickets = self.tickets.write().map_err(|_| HandoffError::Poisoned)?;
        let before = tickets.len();
        tickets.retain(|ticket, _| !self.is_expired(ticket, now));
        Ok(before - tickets.len())
    }

    pub fn len(&self) -> usize {
        self.tickets.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, ticket: &str, now: DateTime<Utc>) -> bool {
        let Some(issued_at) = Nonce::parse(ticket).and_then(|n| n.issued_at()) else {
            return true;
        };
        let age = now.timestamp().saturating_sub(issued_at);
        age < 0 || age.unsigned_abs() > self.ttl.as_secs()
    }
}
