use async_trait::async_trait;
use thiserror::Error;

use memberguard_core::{MembershipStatus, PerunUser, Vo};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// The directory has no such object (VO, group, member, form).
    #[error("not found: {0}")]
    NotFound(String),

    /// The directory could not be reached or answered with an error.
    #[error("membership directory unavailable: {0}")]
    Unavailable(String),

    /// The directory answered with something we could not interpret.
    #[error("unexpected directory response: {0}")]
    InvalidResponse(String),
}

/// A user's standing in the organization and, if one is enforced, the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberStanding {
    pub status: MembershipStatus,
    /// `true` when no group is enforced.
    pub in_group: bool,
}

impl OracleError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, OracleError::NotFound(_))
    }
}

/// Narrow view of the external membership directory.
///
/// Implementations perform network IO; callers treat every method as a
/// suspension point and must not act on partial results of a failed call.
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    /// Resolve an organization by its short name.
    async fn resolve_vo(&self, short_name: &str) -> Result<Vo, OracleError>;

    /// The user's standing in `vo`; `MembershipStatus::None` when they are not a member.
    async fn member_status(&self, user: &PerunUser, vo: &Vo) -> Result<MembershipStatus, OracleError>;

    /// Whether the user is currently an effective member of `group_name` in `vo`.
    async fn is_group_member(
        &self,
        user: &PerunUser,
        vo: &Vo,
        group_name: &str,
    ) -> Result<bool, OracleError>;

    /// Status and group membership together.
    ///
    /// Directories that derive both from one member record override this to
    /// fetch the record once.
    async fn member_standing(
        &self,
        user: &PerunUser,
        vo: &Vo,
        group_name: Option<&str>,
    ) -> Result<MemberStanding, OracleError> {
        let in_group = match group_name {
            None => true,
            Some(group) => self.is_group_member(user, vo, group).await?,
        };
        let status = self.member_status(user, vo).await?;
        Ok(MemberStanding { status, in_group })
    }

    async fn vo_has_registration_form(&self, vo: &Vo) -> Result<bool, OracleError>;

    /// Whether `group_name` in `vo` has its own registration form.
    ///
    /// Fails with `NotFound` when the group itself does not exist.
    async fn group_has_registration_form(
        &self,
        vo: &Vo,
        group_name: &str,
    ) -> Result<bool, OracleError>;
}

#[async_trait]
impl<O> MembershipOracle for std::sync::Arc<O>
where
    O: MembershipOracle + ?Sized,
{
    async fn resolve_vo(&self, short_name: &str) -> Result<Vo, OracleError> {
        (**self).resolve_vo(short_name).await
    }

    async fn member_status(&self, user: &PerunUser, vo: &Vo) -> Result<MembershipStatus, OracleError> {
        (**self).member_status(user, vo).await
    }

    async fn is_group_member(
        &self,
        user: &PerunUser,
        vo: &Vo,
        group_name: &str,
    ) -> Result<bool, OracleError> {
        (**self).is_group_member(user, vo, group_name).await
    }

    async fn member_standing(
        &self,
        user: &PerunUser,
        vo: &Vo,
        group_name: Option<&str>,
    ) -> Result<MemberStanding, OracleError> {
        (**self).member_standing(user, vo, group_name).await
    }

    async fn vo_has_registration_form(&self, vo: &Vo) -> Result<bool, OracleError> {
        (**self).vo_has_registration_form(vo).await
    }

    async fn group_has_registration_form(
        &self,
        vo: &Vo,
        group_name: &str,
    ) -> Result<bool, OracleError> {
        (**self).group_has_registration_form(vo, group_name).await
    }
}
