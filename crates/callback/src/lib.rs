//! `memberguard-callback`: secure redirect/callback round trip to an external registrar.
//!
//! - [`nonce`]: one-time nonces with constant-time comparison
//! - [`keystore`]: JWK keystore, token signing and verification
//! - [`state`]: session-scoped pending callback state
//! - [`protocol`]: `initiate` / `resume`

pub mod keystore;
pub mod nonce;
pub mod protocol;
pub mod state;

pub use keystore::{Keystore, SignedRequest, SigningConfig, SigningError, TokenSigner, TokenVerifier};
pub use nonce::{constant_time_eq, Nonce, NONCE_RANDOM_LEN};
pub use protocol::{
    callback_path, callback_pattern, CallbackError, FetchError, Initiated, RedirectInstruction,
    RegistrationOutcome, RegistrationResult, RegistrationResultClient, RegistrationTarget, Resumed,
    SecureCallback, CALLBACK_ENDPOINT, CALLBACK_PREFIX,
};
pub use state::{InMemoryStateStore, PendingCallbackState, StateError, StateStore};
