//! Perun JSON-RPC adapter.
//!
//! Calls are `POST {rpc_url}/json/{manager}/{method}` with a JSON object of
//! named parameters. Failures come back as `{"name": ..., "message": ...}`;
//! exception names ending in `NotExistsException` mean "no such object".

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};
use url::Url;

use memberguard_auth::{MemberStanding, MembershipOracle, OracleError};
use memberguard_core::{
    Group, MemberId, MembershipStatus, PerunUser, UserExtSource, UserExtSourceId, Vo,
};

use crate::config::PerunConfig;
use crate::jobs::DirectorySink;

const NOT_EXISTS_SUFFIX: &str = "NotExistsException";

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcMember {
    id: MemberId,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcUserExtSource {
    id: UserExtSourceId,
    login: String,
    ext_source: RpcExtSource,
}

#[derive(Debug, Deserialize)]
struct RpcExtSource {
    name: String,
}

/// Low-level Perun RPC client.
#[derive(Debug, Clone)]
pub struct PerunRpcClient {
    http: reqwest::Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
}

impl PerunRpcClient {
    pub fn new(config: &PerunConfig) -> Result<Self, OracleError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OracleError::Unavailable(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            base: config.rpc_url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn endpoint(&self, manager: &str, method: &str) -> Result<Url, OracleError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| OracleError::InvalidResponse(format!("rpc url {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(["json", manager, method]);
        Ok(url)
    }

    async fn send(&self, manager: &str, method: &str, params: Value) -> Result<reqwest::Response, OracleError> {
        let url = self.endpoint(manager, method)?;
        trace!(%url, %params, "perun rpc call");

        let mut request = self.http.post(url).json(&params);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(format!("{manager}/{method}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(rpc_error(manager, method, status, &body))
    }

    /// Call a method and decode its JSON result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        manager: &str,
        method: &str,
        params: Value,
    ) -> Result<T, OracleError> {
        self.send(manager, method, params)
            .await?
            .json::<T>()
            .await
            .map_err(|e| OracleError::InvalidResponse(format!("{manager}/{method}: {e}")))
    }

    /// Call a method whose result is ignored.
    pub async fn call_void(&self, manager: &str, method: &str, params: Value) -> Result<(), OracleError> {
        self.send(manager, method, params).await.map(|_| ())
    }
}

fn rpc_error(manager: &str, method: &str, status: StatusCode, body: &str) -> OracleError {
    match serde_json::from_str::<RpcErrorBody>(body) {
        Ok(err) if err.name.ends_with(NOT_EXISTS_SUFFIX) => OracleError::NotFound(if err.message.is_empty() {
            err.name
        } else {
            err.message
        }),
        Ok(err) if !err.name.is_empty() => {
            OracleError::Unavailable(format!("{manager}/{method}: {} ({})", err.name, err.message))
        }
        _ => OracleError::Unavailable(format!("{manager}/{method}: HTTP {status}")),
    }
}

/// Membership oracle and directory sink backed by Perun RPC.
#[derive(Debug, Clone)]
pub struct PerunRpcOracle {
    rpc: PerunRpcClient,
}

impl PerunRpcOracle {
    pub fn new(config: &PerunConfig) -> Result<Self, OracleError> {
        Ok(Self {
            rpc: PerunRpcClient::new(config)?,
        })
    }

    async fn member(&self, user: &PerunUser, vo: &Vo) -> Result<Option<RpcMember>, OracleError> {
        let member = self
            .rpc
            .call::<RpcMember>(
                "membersManager",
                "getMemberByUser",
                json!({ "vo": vo.id, "user": user.id }),
            )
            .await;
        not_found_as_none(member)
    }

    async fn member_in_group(&self, member: &RpcMember, group_name: &str) -> Result<bool, OracleError> {
        let groups: Vec<Group> = self
            .rpc
            .call("groupsManager", "getMemberGroups", json!({ "member": member.id }))
            .await?;
        debug!(member_id = %member.id, groups = groups.len(), "fetched member groups");
        Ok(groups.iter().any(|g| g.name == group_name))
    }

    async fn has_application_form(&self, params: Value) -> Result<bool, OracleError> {
        let form = self
            .rpc
            .call::<Value>("registrarManager", "getApplicationForm", params)
            .await;
        Ok(not_found_as_none(form)?.is_some())
    }
}

fn status_of(member: &RpcMember) -> Result<MembershipStatus, OracleError> {
    member
        .status
        .parse()
        .map_err(|e| OracleError::InvalidResponse(format!("member {}: {e}", member.id)))
}

fn not_found_as_none<T>(result: Result<T, OracleError>) -> Result<Option<T>, OracleError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(OracleError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl MembershipOracle for PerunRpcOracle {
    async fn resolve_vo(&self, short_name: &str) -> Result<Vo, OracleError> {
        self.rpc
            .call("vosManager", "getVoByShortName", json!({ "shortName": short_name }))
            .await
    }

    async fn member_status(&self, user: &PerunUser, vo: &Vo) -> Result<MembershipStatus, OracleError> {
        match self.member(user, vo).await? {
            Some(member) => status_of(&member),
            None => Ok(MembershipStatus::None),
        }
    }

    async fn is_group_member(
        &self,
        user: &PerunUser,
        vo: &Vo,
        group_name: &str,
    ) -> Result<bool, OracleError> {
        match self.member(user, vo).await? {
            Some(member) => self.member_in_group(&member, group_name).await,
            None => Ok(false),
        }
    }

    async fn member_standing(
        &self,
        user: &PerunUser,
        vo: &Vo,
        group_name: Option<&str>,
    ) -> Result<MemberStanding, OracleError> {
        let Some(member) = self.member(user, vo).await? else {
            return Ok(MemberStanding {
                status: MembershipStatus::None,
                in_group: group_name.is_none(),
            });
        };
        let in_group = match group_name {
            None => true,
            Some(group) => self.member_in_group(&member, group).await?,
        };
        Ok(MemberStanding {
            status: status_of(&member)?,
            in_group,
        })
    }

    async fn vo_has_registration_form(&self, vo: &Vo) -> Result<bool, OracleError> {
        self.has_application_form(json!({ "vo": vo.id })).await
    }

    async fn group_has_registration_form(
        &self,
        vo: &Vo,
        group_name: &str,
    ) -> Result<bool, OracleError> {
        let group: Group = self
            .rpc
            .call("groupsManager", "getGroupByName", json!({ "vo": vo.id, "name": group_name }))
            .await?;
        self.has_application_form(json!({ "group": group.id })).await
    }
}

#[async_trait]
impl DirectorySink for PerunRpcOracle {
    async fn find_user_ext_source(
        &self,
        ext_source_name: &str,
        login: &str,
    ) -> Result<Option<UserExtSource>, OracleError> {
        let ues = self
            .rpc
            .call::<RpcUserExtSource>(
                "usersManager",
                "getUserExtSourceByExtLoginAndExtSourceName",
                json!({ "extSourceName": ext_source_name, "extSourceLogin": login }),
            )
            .await;
        Ok(not_found_as_none(ues)?.map(|ues| UserExtSource {
            id: ues.id,
            ext_source_name: ues.ext_source.name,
            login: ues.login,
        }))
    }

    async fn update_user_ext_source_last_access(&self, ues: &UserExtSource) -> Result<(), OracleError> {
        self.rpc
            .call_void(
                "usersManager",
                "updateUserExtSourceLastAccess",
                json!({ "userExtSource": ues.id }),
            )
            .await
    }
}
