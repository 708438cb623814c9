//! The membership check as a request flow: evaluate, then continue, reject
//! or park the request for registration and pick it up again on callback.
//!
//! A request restored on callback is never handed to the browser. It is
//! parked under a single-use ticket and the browser is sent to the proxy's
//! resume URL, from where the proxy redeems the ticket server-side.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use memberguard_auth::{Decision, GateError, LifecycleError, MembershipGate, PhaseEvent, RequestPhase};
use memberguard_callback::{
    CallbackError, RegistrationOutcome, RegistrationTarget, SecureCallback, CALLBACK_ENDPOINT, CALLBACK_PREFIX,
};
use memberguard_core::{PerunUser, SessionId};
use memberguard_infra::{SyncQueue, SyncTask};

use crate::app::dto::RequestData;
use crate::app::handoff::{HandoffError, HandoffStore};

/// Identity under which pending registrations are parked in the session.
pub const FLOW_CALLER: &str = "perunensuremember";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("missing mandatory field '{0}' in request data; the user must be resolved before the membership check")]
    MissingPrerequisite(&'static str),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

/// What the proxy should do with the request.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    /// Pass the (possibly restored) request on to the next step.
    Continue(RequestData),
    /// Send the browser elsewhere.
    Redirect(Url),
}

/// Static settings of the flow.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub register_url: Url,
    pub callback_parameter_name: String,
    /// Where the registrar sends the browser back to.
    pub callback_url: Url,
    pub unauthorized_url: Url,
    /// Proxy endpoint the browser is sent to with a handoff ticket.
    pub resume_url: Url,
    pub identifier_attributes: Vec<String>,
}

/// Query parameter carrying the handoff ticket on the resume URL.
pub const TICKET_PARAM: &str = "ticket";

/// `{public_base_url}/perunensuremember/process`.
pub fn callback_url(public_base_url: &Url) -> Result<Url, url::ParseError> {
    let mut url = public_base_url.clone();
    url.path_segments_mut()
        .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
        .pop_if_empty()
        .push(CALLBACK_PREFIX)
        .push(CALLBACK_ENDPOINT.trim_start_matches('/'));
    Ok(url)
}

pub struct MembershipFlow {
    gate: MembershipGate,
    callback: SecureCallback,
    settings: FlowSettings,
    handoffs: Arc<HandoffStore>,
    sync: Option<Arc<SyncQueue>>,
}

impl MembershipFlow {
    pub fn new(
        gate: MembershipGate,
        callback: SecureCallback,
        settings: FlowSettings,
        handoffs: Arc<HandoffStore>,
        sync: Option<Arc<SyncQueue>>,
    ) -> Self {
        Self {
            gate,
            callback,
            settings,
            handoffs,
            sync,
        }
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    /// Run the membership check for an incoming request.
    pub async fn process(&self, session: SessionId, data: RequestData) -> Result<FlowOutcome, FlowError> {
        let user = data
            .user
            .clone()
            .ok_or(FlowError::MissingPrerequisite("perun.user"))?;

        let evaluation = self.gate.evaluate(&user).await?;
        let decision = evaluation.decision();
        let phase = RequestPhase::Evaluating.transition(PhaseEvent::Decided(decision))?;
        debug!(%session, user_id = %user.id, ?phase, "membership check decided");

        match decision {
            Decision::Allow => {
                info!(%session, user_id = %user.id, vo = %evaluation.vo.short_name, "user is a valid member");
                self.schedule_sync(&user, &data);
                Ok(FlowOutcome::Continue(data))
            }
            Decision::Reject => {
                info!(
                    %session,
                    user_id = %user.id,
                    reason = evaluation.explanation.reason,
                    "user cannot become a member; redirecting to the unauthorized page"
                );
                Ok(FlowOutcome::Redirect(self.settings.unauthorized_url.clone()))
            }
            Decision::Register(scope) => {
                let target = RegistrationTarget::new(
                    self.settings.register_url.clone(),
                    evaluation.vo.short_name.clone(),
                    self.gate.registration_group(scope).map(str::to_string),
                )
                .with_param(
                    self.settings.callback_parameter_name.clone(),
                    self.settings.callback_url.as_str(),
                );
                let initiated = self.callback.initiate(session, FLOW_CALLER, &target, &data)?;
                Ok(FlowOutcome::Redirect(initiated.redirect.location))
            }
        }
    }

    /// Pick up a parked request after the registrar sent the browser back and
    /// run the check again from the top.
    pub async fn resume(&self, session: SessionId) -> Result<FlowOutcome, FlowError> {
        let resumed = self.callback.resume::<RequestData>(session, FLOW_CALLER).await?;
        let phase = RequestPhase::AwaitingRegistration
            .transition(PhaseEvent::CallbackReceived)?
            .transition(PhaseEvent::Reevaluate)?;

        match &resumed.outcome {
            RegistrationOutcome::Confirmed => debug!(%session, ?phase, "re-evaluating after registration"),
            // Not trusted, but the membership lookup decides, not the registrar's word.
            RegistrationOutcome::Unverified(reason) => {
                debug!(%session, ?phase, reason = %reason, "re-evaluating after unverified registration")
            }
        }

        match self.process(session, resumed.snapshot).await? {
            FlowOutcome::Continue(data) => {
                let ticket = self.handoffs.park(session, data)?;
                let mut location = self.settings.resume_url.clone();
                location.query_pairs_mut().append_pair(TICKET_PARAM, ticket.as_str());
                debug!(%session, "restored request parked for the proxy");
                Ok(FlowOutcome::Redirect(location))
            }
            redirect => Ok(redirect),
        }
    }

    /// Hand a restored request over to the proxy that presents its ticket.
    pub fn redeem(&self, ticket: &str) -> Result<RequestData, FlowError> {
        let (session, data) = self.handoffs.redeem(ticket, Utc::now())?;
        info!(%session, "restored request handed over to the proxy");
        Ok(data)
    }

    fn schedule_sync(&self, user: &PerunUser, data: &RequestData) {
        let Some(queue) = &self.sync else {
            return;
        };
        let issuer = data.auth_info.as_ref().and_then(|a| a.issuer.as_deref());
        match SyncTask::from_attributes(user.id, issuer, &data.attributes, &self.settings.identifier_attributes) {
            Some(task) => {
                queue.enqueue(task);
            }
            None => warn!(user_id = %user.id, "no issuer or identifier attribute; skipping directory sync"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_url_is_appended_to_the_base_path() {
        let root = Url::parse("https://proxy.example.org").unwrap();
        assert_eq!(
            callback_url(&root).unwrap().as_str(),
            "https://proxy.example.org/perunensuremember/process"
        );

        let nested = Url::parse("https://proxy.example.org/idp/").unwrap();
        assert_eq!(
            callback_url(&nested).unwrap().as_str(),
            "https://proxy.example.org/idp/perunensuremember/process"
        );
    }
}
