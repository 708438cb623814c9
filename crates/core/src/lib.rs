//! `memberguard-core`: shared building blocks for membership enforcement.
//!
//! This crate contains **pure** model types (no IO, no transport concerns).

pub mod error;
pub mod id;
pub mod membership;

pub use error::DomainError;
pub use id::{GroupId, MemberId, SessionId, UserExtSourceId, UserId, VoId};
pub use membership::{Group, MembershipStatus, PerunUser, UserExtSource, Vo};
