//! Membership model: who the user is and where they stand in a VO.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{GroupId, UserExtSourceId, UserId, VoId};

/// A user's standing in a virtual organization at lookup time.
///
/// `None` means the user has no membership record at all. The directory
/// distinguishes more states than the policy needs; anything that is neither
/// valid nor expired collapses into `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MembershipStatus {
    None,
    Valid,
    Expired,
    Invalid,
}

impl MembershipStatus {
    pub const ALL: [MembershipStatus; 4] = [
        MembershipStatus::None,
        MembershipStatus::Valid,
        MembershipStatus::Expired,
        MembershipStatus::Invalid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::None => "NONE",
            MembershipStatus::Valid => "VALID",
            MembershipStatus::Expired => "EXPIRED",
            MembershipStatus::Invalid => "INVALID",
        }
    }
}

impl core::fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MembershipStatus {
    type Err = DomainError;

    /// Parse a directory member status.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(MembershipStatus::None),
            "VALID" => Ok(MembershipStatus::Valid),
            "EXPIRED" => Ok(MembershipStatus::Expired),
            "INVALID" | "DISABLED" | "SUSPENDED" => Ok(MembershipStatus::Invalid),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// A user as resolved by the identity step that runs before the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerunUser {
    pub id: UserId,
    #[serde(default)]
    pub name: String,
}

impl PerunUser {
    pub fn new(id: UserId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A virtual organization (the top-level membership domain).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vo {
    pub id: VoId,
    pub short_name: String,
    #[serde(default)]
    pub name: String,
}

impl Vo {
    pub fn new(id: VoId, short_name: impl Into<String>) -> Self {
        let short_name = short_name.into();
        Self {
            id,
            name: short_name.clone(),
            short_name,
        }
    }
}

/// A named group inside a virtual organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub vo_id: VoId,
    pub name: String,
}

impl Group {
    pub fn new(id: GroupId, vo_id: VoId, name: impl Into<String>) -> Self {
        Self {
            id,
            vo_id,
            name: name.into(),
        }
    }
}

/// A user's identity at one external source, e.g. `login@idp` at an IdP entity id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserExtSource {
    pub id: UserExtSourceId,
    pub ext_source_name: String,
    pub login: String,
}
