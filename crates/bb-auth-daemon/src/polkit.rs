//! Polkit bridge: policy authentication requests as sessions.
//!
//! The OS policy authority delivers `initiateAuthentication` calls through
//! external D-Bus glue; they arrive here as [`PolkitEvent::Initiate`] on
//! the agent loop. For each cookie the bridge runs a *policy session*
//! (created through the injected [`PolicySessionFactory`]) that streams
//! prompt/error/info callbacks and a completion verdict back as further
//! [`PolkitEvent`]s.
//!
//! A completed-but-not-gained session that the user did not cancel is
//! retried with a fresh policy session, up to
//! [`MAX_AUTH_RETRIES`] attempts in total; after that the session closes
//! with "Too many failed attempts".

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use bb_auth_core::Secret;
use bb_auth_core::constants::MAX_AUTH_RETRIES;

use crate::agent::session::{Context, SessionResult, Source};
use crate::agent::{AgentCore, AgentHandle};
use crate::requestor::normalize_prompt;

/// Events exchanged with the policy authority glue and policy sessions.
#[derive(Debug)]
pub enum PolkitEvent {
    /// A new authentication request for `cookie`.
    Initiate {
        cookie: String,
        action_id: String,
        message: String,
        icon_name: String,
        user: String,
        details: Map<String, Value>,
    },
    /// The authority cancelled everything in flight.
    CancelAll,
    /// The policy session asks for input.
    SessionRequest {
        cookie: String,
        prompt: String,
        echo: bool,
    },
    /// The policy session finished one attempt.
    SessionCompleted {
        cookie: String,
        gained_authorization: bool,
    },
    /// Non-fatal error text from the policy session.
    SessionShowError { cookie: String, text: String },
    /// Transient info text from the policy session.
    SessionShowInfo { cookie: String, text: String },
}

/// One attempt-scoped conversation with the policy authority.
pub trait PolicySession: Send {
    /// Starts the conversation; callbacks arrive as [`PolkitEvent`]s.
    fn initiate(&mut self);
    /// Submits the user's response to the pending prompt.
    fn respond(&mut self, response: Secret);
    /// Aborts the conversation.
    fn cancel(&mut self);
}

/// Creates policy sessions; injected so tests can drive the bridge
/// without a policy authority.
pub trait PolicySessionFactory: Send {
    fn create(&mut self, cookie: &str, user: &str, events: AgentHandle) -> Box<dyn PolicySession>;
}

/// Per-cookie authentication flow.
struct AuthFlow {
    user: String,
    retry_count: u32,
    cancelled: bool,
    gained: bool,
    session: Box<dyn PolicySession>,
}

/// The bridge itself: flows keyed by policy cookie.
pub struct PolkitBridge {
    factory: Box<dyn PolicySessionFactory>,
    flows: HashMap<String, AuthFlow>,
}

impl PolkitBridge {
    #[must_use]
    pub fn new(factory: Box<dyn PolicySessionFactory>) -> Self {
        Self {
            factory,
            flows: HashMap::new(),
        }
    }

    /// Dispatches one bridge event.
    pub fn on_event(&mut self, core: &mut AgentCore, event: PolkitEvent) {
        match event {
            PolkitEvent::Initiate {
                cookie,
                action_id,
                message,
                icon_name,
                user,
                details,
            } => self.on_initiate(core, cookie, action_id, message, &icon_name, user, details),
            PolkitEvent::CancelAll => self.cancel_all(core),
            PolkitEvent::SessionRequest {
                cookie,
                prompt,
                echo,
            } => self.on_session_request(core, &cookie, &prompt, echo),
            PolkitEvent::SessionCompleted {
                cookie,
                gained_authorization,
            } => self.on_session_completed(core, &cookie, gained_authorization),
            PolkitEvent::SessionShowError { cookie, text } => {
                self.on_session_error(core, &cookie, &text);
            }
            PolkitEvent::SessionShowInfo { cookie, text } => {
                self.on_session_info(core, &cookie, &text);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_initiate(
        &mut self,
        core: &mut AgentCore,
        cookie: String,
        action_id: String,
        message: String,
        _icon_name: &str,
        user: String,
        details: Map<String, Value>,
    ) {
        if self.flows.contains_key(&cookie) {
            warn!("rejecting duplicate polkit cookie {cookie}");
            return;
        }

        debug!("new polkit authentication for {cookie} ({action_id})");

        let subject_pid = extract_subject_pid(&details);
        let actor = core.resolve_actor(subject_pid);
        let ctx = Context {
            message,
            action_id,
            user: user.clone(),
            details,
            requestor: actor.to_requestor(subject_pid),
            ..Context::default()
        };
        core.create_session(&cookie, Source::Polkit, ctx);

        let mut session = self.factory.create(&cookie, &user, core.handle());
        session.initiate();
        self.flows.insert(
            cookie,
            AuthFlow {
                user,
                retry_count: 0,
                cancelled: false,
                gained: false,
                session,
            },
        );
    }

    fn on_session_request(&mut self, core: &mut AgentCore, cookie: &str, prompt: &str, echo: bool) {
        if !self.flows.contains_key(cookie) {
            return;
        }
        // Keep the retry error visible alongside the fresh prompt.
        core.update_session_prompt(cookie, &normalize_prompt(prompt), echo, false);
    }

    fn on_session_error(&mut self, core: &mut AgentCore, cookie: &str, text: &str) {
        if !self.flows.contains_key(cookie) {
            return;
        }
        core.update_session_error(cookie, text);
    }

    fn on_session_info(&mut self, core: &mut AgentCore, cookie: &str, text: &str) {
        if !self.flows.contains_key(cookie) {
            return;
        }
        core.update_session_info(cookie, text);
    }

    fn on_session_completed(&mut self, core: &mut AgentCore, cookie: &str, gained: bool) {
        let Some(mut flow) = self.flows.remove(cookie) else {
            return;
        };
        flow.gained = gained;
        if !gained && !flow.cancelled {
            core.update_session_error(cookie, "Authentication failed");
        }
        self.finish_flow(core, cookie, flow);
    }

    /// Submits a password to the live policy session. Missing cookies are
    /// no-ops.
    pub fn submit_password(&mut self, cookie: &str, password: Secret) -> bool {
        match self.flows.get_mut(cookie) {
            Some(flow) => {
                flow.session.respond(password);
                true
            }
            None => false,
        }
    }

    /// Cancels one pending flow. Missing cookies are no-ops.
    pub fn cancel_pending(&mut self, core: &mut AgentCore, cookie: &str) -> bool {
        let Some(mut flow) = self.flows.remove(cookie) else {
            return false;
        };
        flow.session.cancel();
        flow.cancelled = true;
        self.finish_flow(core, cookie, flow);
        true
    }

    /// Cancels every in-flight flow (authority shutdown, cancel-all).
    pub fn cancel_all(&mut self, core: &mut AgentCore) {
        let cookies: Vec<String> = self.flows.keys().cloned().collect();
        for cookie in cookies {
            self.cancel_pending(core, &cookie);
        }
    }

    /// Whether `cookie` has a live flow.
    #[must_use]
    pub fn has_flow(&self, cookie: &str) -> bool {
        self.flows.contains_key(cookie)
    }

    /// Finishes one attempt: either retries with a fresh policy session
    /// or closes the session with its terminal result.
    fn finish_flow(&mut self, core: &mut AgentCore, cookie: &str, mut flow: AuthFlow) {
        if !flow.gained && !flow.cancelled {
            flow.retry_count += 1;
            if flow.retry_count < MAX_AUTH_RETRIES {
                debug!(
                    "reattempting authentication for {cookie} (attempt {}/{MAX_AUTH_RETRIES})",
                    flow.retry_count + 1
                );
                let mut session = self.factory.create(cookie, &flow.user, core.handle());
                session.initiate();
                flow.session = session;
                self.flows.insert(cookie.to_owned(), flow);
                return;
            }
            core.update_session_error(cookie, "Too many failed attempts");
        }

        let result = if flow.gained {
            SessionResult::Success
        } else if flow.cancelled {
            SessionResult::Cancelled
        } else {
            SessionResult::Error
        };
        core.close_session(cookie, result);
    }
}

/// Pulls the subject pid (falling back to the caller pid) out of the
/// authority's request details.
#[must_use]
pub fn extract_subject_pid(details: &Map<String, Value>) -> Option<i32> {
    for key in ["polkit.subject-pid", "polkit.caller-pid"] {
        let pid = match details.get(key) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        if let Some(pid) = pid {
            if pid > 0 && pid <= i64::from(i32::MAX) {
                #[allow(clippy::cast_possible_truncation)] // range-checked
                return Some(pid as i32);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subject_pid_extraction() {
        let details: Map<String, Value> =
            serde_json::from_value(json!({ "polkit.subject-pid": 1234 })).unwrap();
        assert_eq!(extract_subject_pid(&details), Some(1234));

        let details: Map<String, Value> =
            serde_json::from_value(json!({ "polkit.caller-pid": "567" })).unwrap();
        assert_eq!(extract_subject_pid(&details), Some(567));

        let details: Map<String, Value> =
            serde_json::from_value(json!({ "polkit.subject-pid": -1 })).unwrap();
        assert_eq!(extract_subject_pid(&details), None);

        assert_eq!(extract_subject_pid(&Map::new()), None);
    }
}
