use serde::Serialize;

use memberguard_core::MembershipStatus;

/// Facts the policy decides on.
///
/// `in_group` is `true` when no group constraint is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DecisionInput {
    pub status: MembershipStatus,
    pub in_group: bool,
    pub vo_has_form: bool,
    pub group_has_form: bool,
}

impl DecisionInput {
    pub fn new(
        status: MembershipStatus,
        in_group: bool,
        vo_has_form: bool,
        group_has_form: bool,
    ) -> Self {
        Self {
            status,
            in_group,
            vo_has_form,
            group_has_form,
        }
    }
}

/// Where a registration should take the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationScope {
    /// Register into the organization itself.
    Organization,
    /// Register into the configured group.
    Group,
}

/// Outcome of the membership policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "scope")]
pub enum Decision {
    Allow,
    Register(RegistrationScope),
    Reject,
}

/// One row of the policy table. `None` matches any value.
#[derive(Debug, Clone, Copy)]
struct PolicyRule {
    status: Option<MembershipStatus>,
    in_group: Option<bool>,
    vo_has_form: Option<bool>,
    group_has_form: Option<bool>,
    decision: Decision,
    reason: &'static str,
}

impl PolicyRule {
    fn matches(&self, input: &DecisionInput) -> bool {
        fn field<T: PartialEq>(want: Option<T>, have: T) -> bool {
            want.is_none_or(|w| w == have)
        }

        field(self.status, input.status)
            && field(self.in_group, input.in_group)
            && field(self.vo_has_form, input.vo_has_form)
            && field(self.group_has_form, input.group_has_form)
    }
}

// Order is part of the contract: the first matching row wins and row 1 must
// stay first. Anything unmatched falls through to REJECT.
const POLICY: [PolicyRule; 6] = [
    PolicyRule {
        status: Some(MembershipStatus::Valid),
        in_group: Some(true),
        vo_has_form: None,
        group_has_form: None,
        decision: Decision::Allow,
        reason: "user is a valid member and satisfies the group constraint",
    },
    PolicyRule {
        status: Some(MembershipStatus::Valid),
        in_group: Some(false),
        vo_has_form: None,
        group_has_form: Some(true),
        decision: Decision::Register(RegistrationScope::Group),
        reason: "user is a valid member but not in the group, which has a registration form",
    },
    PolicyRule {
        status: Some(MembershipStatus::None),
        in_group: Some(true),
        vo_has_form: Some(true),
        group_has_form: Some(false),
        decision: Decision::Register(RegistrationScope::Organization),
        reason: "user is not a member of the organization, which has a registration form",
    },
    PolicyRule {
        status: Some(MembershipStatus::None),
        in_group: Some(false),
        vo_has_form: Some(true),
        group_has_form: Some(true),
        decision: Decision::Register(RegistrationScope::Group),
        reason: "user is neither an organization nor a group member; both have registration forms",
    },
    PolicyRule {
        status: Some(MembershipStatus::Expired),
        in_group: Some(true),
        vo_has_form: Some(true),
        group_has_form: None,
        decision: Decision::Register(RegistrationScope::Organization),
        reason: "membership expired and the organization has a registration form",
    },
    PolicyRule {
        status: Some(MembershipStatus::Expired),
        in_group: Some(false),
        vo_has_form: Some(true),
        group_has_form: Some(true),
        decision: Decision::Register(RegistrationScope::Group),
        reason: "membership expired, user is not in the group; both have registration forms",
    },
];

const REJECT_REASON: &str = "user is not valid in the organization or group and cannot be sent to registration";

/// Decide what happens to a user given their membership facts.
///
/// - No IO
/// - No panics
/// - Deterministic (pure table lookup)
pub fn decide(input: &DecisionInput) -> Decision {
    POLICY
        .iter()
        .find(|rule| rule.matches(input))
        .map_or(Decision::Reject, |rule| rule.decision)
}

/// Audit view of a policy decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionExplanation {
    pub input: DecisionInput,
    pub decision: Decision,
    /// 1-based row of the policy table that matched; `None` for the fallback REJECT.
    pub matched_rule: Option<usize>,
    pub reason: &'static str,
}

/// Explain which policy row produced the decision for `input`.
///
/// Always agrees with [`decide`].
pub fn explain_decision(input: &DecisionInput) -> DecisionExplanation {
    match POLICY.iter().position(|rule| rule.matches(input)) {
        Some(idx) => DecisionExplanation {
            input: *input,
            decision: POLICY[idx].decision,
            matched_rule: Some(idx + 1),
            reason: POLICY[idx].reason,
        },
        None => DecisionExplanation {
            input: *input,
            decision: Decision::Reject,
            matched_rule: None,
            reason: REJECT_REASON,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use memberguard_core::MembershipStatus::{Expired, Invalid, None as NoMember, Valid};

    fn input(status: MembershipStatus, in_group: bool, vo: bool, group: bool) -> DecisionInput {
        DecisionInput::new(status, in_group, vo, group)
    }

    #[test]
    fn scenario_a_valid_member_in_group_is_allowed() {
        assert_eq!(decide(&input(Valid, true, false, false)), Decision::Allow);
    }

    #[test]
    fn scenario_b_valid_member_outside_group_registers_into_group() {
        assert_eq!(
            decide(&input(Valid, false, false, true)),
            Decision::Register(RegistrationScope::Group)
        );
    }

    #[test]
    fn scenario_c_non_member_registers_into_organization() {
        assert_eq!(
            decide(&input(NoMember, true, true, false)),
            Decision::Register(RegistrationScope::Organization)
        );
    }

    #[test]
    fn scenario_d_expired_member_outside_group_registers_into_group() {
        assert_eq!(
            decide(&input(Expired, false, true, true)),
            Decision::Register(RegistrationScope::Group)
        );
    }

    #[test]
    fn scenario_e_invalid_member_without_forms_is_rejected() {
        assert_eq!(decide(&input(Invalid, false, false, false)), Decision::Reject);
    }

    #[test]
    fn non_member_in_group_with_group_form_is_rejected() {
        // Row 3 requires the group to have no form of its own.
        assert_eq!(decide(&input(NoMember, true, true, true)), Decision::Reject);
    }

    #[test]
    fn valid_member_outside_group_without_group_form_is_rejected() {
        assert_eq!(decide(&input(Valid, false, true, false)), Decision::Reject);
    }

    #[test]
    fn expired_member_in_group_ignores_group_form() {
        for group_form in [true, false] {
            assert_eq!(
                decide(&input(Expired, true, true, group_form)),
                Decision::Register(RegistrationScope::Organization)
            );
        }
    }

    #[test]
    fn invalid_member_is_never_sent_to_registration() {
        for in_group in [true, false] {
            for vo in [true, false] {
                for group in [true, false] {
                    assert_eq!(decide(&input(Invalid, in_group, vo, group)), Decision::Reject);
                }
            }
        }
    }

    #[test]
    fn explanation_names_the_matching_row() {
        let explanation = explain_decision(&input(Expired, true, true, false));
        assert_eq!(explanation.matched_rule, Some(5));
        assert_eq!(explanation.decision, Decision::Register(RegistrationScope::Organization));

        let fallback = explain_decision(&input(Invalid, true, true, true));
        assert_eq!(fallback.matched_rule, None);
        assert_eq!(fallback.decision, Decision::Reject);
    }

    #[test]
    fn decision_serializes_with_action_tag() {
        let json = serde_json::to_value(Decision::Register(RegistrationScope::Group)).unwrap();
        assert_eq!(json, serde_json::json!({"action": "register", "scope": "group"}));
    }

    fn any_status() -> impl Strategy<Value = MembershipStatus> {
        prop::sample::select(MembershipStatus::ALL.to_vec())
    }

    fn any_input() -> impl Strategy<Value = DecisionInput> {
        (any_status(), any::<bool>(), any::<bool>(), any::<bool>())
            .prop_map(|(s, g, v, f)| DecisionInput::new(s, g, v, f))
    }

    proptest! {
        #[test]
        fn valid_in_group_always_allows(vo in any::<bool>(), group in any::<bool>()) {
            prop_assert_eq!(decide(&input(Valid, true, vo, group)), Decision::Allow);
        }

        #[test]
        fn none_or_invalid_without_vo_form_rejects(
            status in prop::sample::select(vec![NoMember, Invalid]),
            in_group in any::<bool>(),
            group in any::<bool>(),
        ) {
            prop_assert_eq!(decide(&input(status, in_group, false, group)), Decision::Reject);
        }

        #[test]
        fn decide_is_pure(i in any_input()) {
            prop_assert_eq!(decide(&i), decide(&i));
        }

        #[test]
        fn explanation_agrees_with_decide(i in any_input()) {
            prop_assert_eq!(explain_decision(&i).decision, decide(&i));
        }

        #[test]
        fn group_registration_only_for_users_outside_group(i in any_input()) {
            if decide(&i) == Decision::Register(RegistrationScope::Group) {
                prop_assert!(!i.in_group);
                prop_assert!(i.group_has_form);
            }
        }
    }
}
