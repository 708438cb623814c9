//! One-time nonces binding an outbound registration request to its callback.

use chrono::Utc;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Number of random lowercase letters after the timestamp prefix.
///
/// 54 letters give ~253 bits of entropy.
pub const NONCE_RANDOM_LEN: usize = 54;

/// A nonce: the issuing Unix timestamp followed by random lowercase letters.
///
/// Equality is constant-time in the nonce contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(String);

impl Nonce {
    /// Generate a fresh nonce from the OS CSPRNG.
    pub fn generate() -> Self {
        Self::generate_at(Utc::now().timestamp())
    }

    pub fn generate_at(unix_timestamp: i64) -> Self {
        let mut rng = OsRng;
        let mut value = unix_timestamp.to_string();
        value.reserve(NONCE_RANDOM_LEN);
        for _ in 0..NONCE_RANDOM_LEN {
            value.push(char::from(rng.gen_range(b'a'..=b'z')));
        }
        Self(value)
    }

    /// Wrap a nonce received from elsewhere. Empty strings are not nonces.
    pub fn parse(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.is_empty() { None } else { Some(Self(value)) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unix timestamp the nonce was issued at, if it carries one.
    pub fn issued_at(&self) -> Option<i64> {
        let digits = self.0.len() - self.0.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        self.0[..digits].parse().ok()
    }

    /// Timing-attack resistant comparison against an untrusted candidate.
    pub fn matches(&self, candidate: &str) -> bool {
        constant_time_eq(self.0.as_bytes(), candidate.as_bytes())
    }
}

impl PartialEq for Nonce {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other.as_str())
    }
}

impl Eq for Nonce {}

impl core::fmt::Display for Nonce {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compare two byte strings without short-circuiting on the first difference.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn nonce_is_timestamp_then_lowercase_letters() {
        let nonce = Nonce::generate_at(1_700_000_000);
        let (prefix, suffix) = nonce.as_str().split_at(10);

        assert_eq!(prefix, "1700000000");
        assert_eq!(suffix.len(), NONCE_RANDOM_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
        assert_eq!(nonce.issued_at(), Some(1_700_000_000));
    }

    #[test]
    fn ten_thousand_nonces_never_collide() {
        let nonces: HashSet<String> = (0..10_000)
            .map(|_| Nonce::generate().as_str().to_string())
            .collect();
        assert_eq!(nonces.len(), 10_000);
    }

    #[test]
    fn single_flipped_character_does_not_match() {
        let nonce = Nonce::generate();
        let mut tampered = nonce.as_str().to_string();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'z' { 'a' } else { 'z' });

        assert!(!nonce.matches(&tampered));
        assert!(nonce.matches(nonce.as_str()));
    }

    #[test]
    fn prefix_of_nonce_does_not_match() {
        let nonce = Nonce::generate();
        let prefix = &nonce.as_str()[..nonce.as_str().len() - 1];
        assert!(!nonce.matches(prefix));
        assert!(!nonce.matches(""));
    }

    #[test]
    fn empty_nonce_is_refused() {
        assert!(Nonce::parse("").is_none());
        assert!(Nonce::parse("1700000000abc").is_some());
    }
}
