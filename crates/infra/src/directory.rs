//! In-memory membership directory for tests/dev.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use memberguard_auth::{MembershipOracle, OracleError};
use memberguard_core::{
    Group, GroupId, MembershipStatus, PerunUser, UserExtSource, UserExtSourceId, UserId, Vo, VoId,
};

use crate::jobs::DirectorySink;

#[derive(Debug, Default)]
struct Directory {
    vos: HashMap<String, Vo>,
    statuses: HashMap<(VoId, UserId), MembershipStatus>,
    groups: HashMap<(VoId, String), Group>,
    group_members: HashSet<(GroupId, UserId)>,
    vo_forms: HashSet<VoId>,
    group_forms: HashSet<GroupId>,
    ext_sources: Vec<UserExtSource>,
    last_access: HashMap<UserExtSourceId, DateTime<Utc>>,
    /// When set, every read fails as if the directory were down.
    unavailable: bool,
}

/// Membership directory held in memory.
///
/// Mutators take `&self` so a shared instance can be reshaped while a
/// service is running (e.g. to simulate a completed registration).
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    inner: RwLock<Directory>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn write<R>(&self, f: impl FnOnce(&mut Directory) -> R) -> Result<R, OracleError> {
        let mut dir = self
            .inner
            .write()
            .map_err(|_| OracleError::Unavailable("directory lock poisoned".into()))?;
        Ok(f(&mut dir))
    }

    fn read<R>(&self, f: impl FnOnce(&Directory) -> Result<R, OracleError>) -> Result<R, OracleError> {
        let dir = self
            .inner
            .read()
            .map_err(|_| OracleError::Unavailable("directory lock poisoned".into()))?;
        if dir.unavailable {
            return Err(OracleError::Unavailable("directory offline".into()));
        }
        f(&dir)
    }

    pub fn add_vo(&self, vo: Vo) -> Result<(), OracleError> {
        self.write(|d| {
            d.vos.insert(vo.short_name.clone(), vo);
        })
    }

    pub fn set_status(&self, vo: VoId, user: UserId, status: MembershipStatus) -> Result<(), OracleError> {
        self.write(|d| {
            d.statuses.insert((vo, user), status);
        })
    }

    pub fn add_group(&self, group: Group) -> Result<(), OracleError> {
        self.write(|d| {
            d.groups.insert((group.vo_id, group.name.clone()), group);
        })
    }

    pub fn add_group_member(&self, group: GroupId, user: UserId) -> Result<(), OracleError> {
        self.write(|d| {
            d.group_members.insert((group, user));
        })
    }

    pub fn set_vo_form(&self, vo: VoId, has_form: bool) -> Result<(), OracleError> {
        self.write(|d| toggle(&mut d.vo_forms, vo, has_form))
    }

    pub fn set_group_form(&self, group: GroupId, has_form: bool) -> Result<(), OracleError> {
        self.write(|d| toggle(&mut d.group_forms, group, has_form))
    }

    pub fn add_user_ext_source(&self, ues: UserExtSource) -> Result<(), OracleError> {
        self.write(|d| d.ext_sources.push(ues))
    }

    pub fn set_unavailable(&self, unavailable: bool) -> Result<(), OracleError> {
        self.write(|d| d.unavailable = unavailable)
    }

    /// When the identity was last recorded as used, if ever.
    pub fn last_access(&self, ues: UserExtSourceId) -> Option<DateTime<Utc>> {
        self.inner.read().ok()?.last_access.get(&ues).copied()
    }
}

fn toggle<T: Eq + std::hash::Hash>(set: &mut HashSet<T>, value: T, present: bool) {
    if present {
        set.insert(value);
    } else {
        set.remove(&value);
    }
}

#[async_trait]
impl MembershipOracle for InMemoryDirectory {
    async fn resolve_vo(&self, short_name: &str) -> Result<Vo, OracleError> {
        self.read(|d| {
            d.vos
                .get(short_name)
                .cloned()
                .ok_or_else(|| OracleError::NotFound(format!("VO '{short_name}'")))
        })
    }

    async fn member_status(&self, user: &PerunUser, vo: &Vo) -> Result<MembershipStatus, OracleError> {
        self.read(|d| {
            Ok(d.statuses
                .get(&(vo.id, user.id))
                .copied()
                .unwrap_or(MembershipStatus::None))
        })
    }

    async fn is_group_member(
        &self,
        user: &PerunUser,
        vo: &Vo,
        group_name: &str,
    ) -> Result<bool, OracleError> {
        self.read(|d| {
            Ok(d.groups
                .get(&(vo.id, group_name.to_string()))
                .is_some_and(|g| d.group_members.contains(&(g.id, user.id))))
        })
    }

    async fn vo_has_registration_form(&self, vo: &Vo) -> Result<bool, OracleError> {
        self.read(|d| Ok(d.vo_forms.contains(&vo.id)))
    }

    async fn group_has_registration_form(
        &self,
        vo: &Vo,
        group_name: &str,
    ) -> Result<bool, OracleError> {
        self.read(|d| {
            let group = d
                .groups
                .get(&(vo.id, group_name.to_string()))
                .ok_or_else(|| OracleError::NotFound(format!("group '{group_name}'")))?;
            Ok(d.group_forms.contains(&group.id))
        })
    }
}

#[async_trait]
impl DirectorySink for InMemoryDirectory {
    async fn find_user_ext_source(
        &self,
        ext_source_name: &str,
        login: &str,
    ) -> Result<Option<UserExtSource>, OracleError> {
        self.read(|d| {
            Ok(d.ext_sources
                .iter()
                .find(|u| u.ext_source_name == ext_source_name && u.login == login)
                .cloned())
        })
    }

    async fn update_user_ext_source_last_access(&self, ues: &UserExtSource) -> Result<(), OracleError> {
        self.write(|d| {
            d.last_access.insert(ues.id, Utc::now());
        })
    }
}
