//! Membership gate: gathers directory facts and runs the policy.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use memberguard_core::{MembershipStatus, PerunUser, Vo};

use crate::decision::{explain_decision, Decision, DecisionExplanation, DecisionInput, RegistrationScope};
use crate::oracle::{MemberStanding, MembershipOracle, OracleError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    /// Misconfiguration (e.g. the configured VO does not exist). Not retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The membership directory failed mid-evaluation; no decision was made.
    #[error("upstream error: {0}")]
    Upstream(#[from] OracleError),
}

/// What the gate enforces: one organization, optionally one group inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatePolicy {
    pub vo_short_name: String,
    pub group_name: Option<String>,
}

impl GatePolicy {
    pub fn new(vo_short_name: impl Into<String>, group_name: Option<String>) -> Self {
        Self {
            vo_short_name: vo_short_name.into(),
            group_name: group_name.filter(|g| !g.trim().is_empty()),
        }
    }
}

/// Result of evaluating one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub vo: Vo,
    pub explanation: DecisionExplanation,
}

impl Evaluation {
    pub fn decision(&self) -> Decision {
        self.explanation.decision
    }
}

/// Evaluates users against a [`GatePolicy`] using a membership directory.
///
/// Stateless apart from its immutable configuration; safe to share across
/// concurrent requests.
pub struct MembershipGate {
    oracle: Arc<dyn MembershipOracle>,
    policy: GatePolicy,
}

impl MembershipGate {
    pub fn new(oracle: Arc<dyn MembershipOracle>, policy: GatePolicy) -> Self {
        Self { oracle, policy }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Group name to register into for a given scope (`None` for the organization).
    pub fn registration_group(&self, scope: RegistrationScope) -> Option<&str> {
        match scope {
            RegistrationScope::Organization => None,
            RegistrationScope::Group => self.policy.group_name.as_deref(),
        }
    }

    /// Gather membership facts for `user` and decide.
    ///
    /// Every directory call completes before the policy runs, so a failure
    /// part-way through never yields a decision.
    pub async fn evaluate(&self, user: &PerunUser) -> Result<Evaluation, GateError> {
        let vo = self.resolve_vo().await?;

        let MemberStanding { status, in_group } = self
            .oracle
            .member_standing(user, &vo, self.policy.group_name.as_deref())
            .await?;

        let input = if status == MembershipStatus::Valid && in_group {
            DecisionInput::new(status, in_group, false, false)
        } else {
            let vo_has_form = self.oracle.vo_has_registration_form(&vo).await?;
            let group_has_form = self.group_has_form(&vo).await?;
            DecisionInput::new(status, in_group, vo_has_form, group_has_form)
        };

        let explanation = explain_decision(&input);
        debug!(
            user_id = %user.id,
            vo = %vo.short_name,
            group = ?self.policy.group_name,
            status = %status,
            in_group,
            vo_has_form = input.vo_has_form,
            group_has_form = input.group_has_form,
            decision = ?explanation.decision,
            rule = ?explanation.matched_rule,
            reason = explanation.reason,
            "membership evaluated"
        );

        Ok(Evaluation { vo, explanation })
    }

    async fn resolve_vo(&self) -> Result<Vo, GateError> {
        match self.oracle.resolve_vo(&self.policy.vo_short_name).await {
            Ok(vo) => Ok(vo),
            Err(OracleError::NotFound(_)) => Err(GateError::Configuration(format!(
                "VO with short name '{}' not found",
                self.policy.vo_short_name
            ))),
            Err(e) => Err(GateError::Upstream(e)),
        }
    }

    async fn group_has_form(&self, vo: &Vo) -> Result<bool, GateError> {
        let Some(group) = self.policy.group_name.as_deref() else {
            return Ok(false);
        };

        match self.oracle.group_has_registration_form(vo, group).await {
            Ok(has_form) => Ok(has_form),
            Err(e) if e.is_not_found() => {
                warn!(vo = %vo.short_name, group, "configured group not found; treating as without form");
                Ok(false)
            }
            Err(e) => Err(GateError::Upstream(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use memberguard_core::{UserId, VoId};

    /// Scripted directory that records which lookups were made.
    #[derive(Default)]
    struct ScriptedOracle {
        vo_missing: bool,
        vo_unavailable: bool,
        status: Option<MembershipStatus>,
        in_group: bool,
        vo_form: bool,
        group_form: Option<bool>,
        calls: Mutex<HashMap<&'static str, usize>>,
    }

    impl ScriptedOracle {
        fn record(&self, call: &'static str) {
            *self.calls.lock().unwrap().entry(call).or_default() += 1;
        }

        fn count(&self, call: &'static str) -> usize {
            self.calls.lock().unwrap().get(call).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl MembershipOracle for ScriptedOracle {
        async fn resolve_vo(&self, short_name: &str) -> Result<Vo, OracleError> {
            self.record("resolve_vo");
            if self.vo_unavailable {
                return Err(OracleError::Unavailable("connection refused".into()));
            }
            if self.vo_missing {
                return Err(OracleError::NotFound(short_name.to_string()));
            }
            Ok(Vo::new(VoId::new(1), short_name))
        }

        async fn member_status(&self, _user: &PerunUser, _vo: &Vo) -> Result<MembershipStatus, OracleError> {
            self.record("member_status");
            self.status
                .ok_or_else(|| OracleError::Unavailable("status lookup failed".into()))
        }

        async fn is_group_member(&self, _user: &PerunUser, _vo: &Vo, _group: &str) -> Result<bool, OracleError> {
            self.record("is_group_member");
            Ok(self.in_group)
        }

        async fn vo_has_registration_form(&self, _vo: &Vo) -> Result<bool, OracleError> {
            self.record("vo_form");
            Ok(self.vo_form)
        }

        async fn group_has_registration_form(&self, _vo: &Vo, group: &str) -> Result<bool, OracleError> {
            self.record("group_form");
            self.group_form
                .ok_or_else(|| OracleError::NotFound(group.to_string()))
        }
    }

    fn user() -> PerunUser {
        PerunUser::new(UserId::new(1), "Joe Doe")
    }

    fn gate(oracle: Arc<ScriptedOracle>, group: Option<&str>) -> MembershipGate {
        MembershipGate::new(oracle, GatePolicy::new("test_vo", group.map(str::to_string)))
    }

    #[tokio::test]
    async fn valid_member_in_group_skips_form_lookups() {
        let oracle = Arc::new(ScriptedOracle {
            status: Some(MembershipStatus::Valid),
            in_group: true,
            ..Default::default()
        });
        let evaluation = gate(oracle.clone(), Some("test_group")).evaluate(&user()).await.unwrap();

        assert_eq!(evaluation.decision(), Decision::Allow);
        assert_eq!(oracle.count("vo_form"), 0);
        assert_eq!(oracle.count("group_form"), 0);
    }

    #[tokio::test]
    async fn no_group_configured_means_no_group_constraint() {
        let oracle = Arc::new(ScriptedOracle {
            status: Some(MembershipStatus::Valid),
            in_group: false,
            ..Default::default()
        });
        let evaluation = gate(oracle.clone(), None).evaluate(&user()).await.unwrap();

        assert_eq!(evaluation.decision(), Decision::Allow);
        assert_eq!(oracle.count("is_group_member"), 0);
    }

    #[tokio::test]
    async fn expired_member_outside_group_is_sent_to_group_registration() {
        let oracle = Arc::new(ScriptedOracle {
            status: Some(MembershipStatus::Expired),
            in_group: false,
            vo_form: true,
            group_form: Some(true),
            ..Default::default()
        });
        let gate = gate(oracle, Some("test_group"));
        let evaluation = gate.evaluate(&user()).await.unwrap();

        assert_eq!(evaluation.decision(), Decision::Register(RegistrationScope::Group));
        assert_eq!(gate.registration_group(RegistrationScope::Group), Some("test_group"));
    }

    #[tokio::test]
    async fn missing_group_counts_as_group_without_form() {
        let oracle = Arc::new(ScriptedOracle {
            status: Some(MembershipStatus::None),
            in_group: false,
            vo_form: true,
            group_form: None,
            ..Default::default()
        });
        let evaluation = gate(oracle, Some("ghost")).evaluate(&user()).await.unwrap();

        assert_eq!(evaluation.decision(), Decision::Reject);
        assert!(!evaluation.explanation.input.group_has_form);
    }

    #[tokio::test]
    async fn unknown_vo_is_a_configuration_error() {
        let oracle = Arc::new(ScriptedOracle {
            vo_missing: true,
            ..Default::default()
        });
        let err = gate(oracle.clone(), None).evaluate(&user()).await.unwrap_err();

        assert!(matches!(err, GateError::Configuration(msg) if msg.contains("test_vo")));
        assert_eq!(oracle.count("member_status"), 0);
    }

    #[tokio::test]
    async fn directory_outage_aborts_without_decision() {
        let oracle = Arc::new(ScriptedOracle {
            vo_unavailable: true,
            ..Default::default()
        });
        let err = gate(oracle, None).evaluate(&user()).await.unwrap_err();
        assert!(matches!(err, GateError::Upstream(OracleError::Unavailable(_))));

        let oracle = Arc::new(ScriptedOracle::default());
        let err = gate(oracle, None).evaluate(&user()).await.unwrap_err();
        assert!(matches!(err, GateError::Upstream(_)));
    }

    #[test]
    fn blank_group_name_is_no_group() {
        let policy = GatePolicy::new("vo", Some("  ".to_string()));
        assert_eq!(policy.group_name, None);
    }
}
