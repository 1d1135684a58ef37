//! Two-phase pinentry flow.
//!
//! A pinentry front-end cannot know whether a passphrase was correct at
//! the moment the user submits it; the cryptographic operation happens on
//! the GPG side afterwards. Each cookie therefore moves through two
//! phases:
//!
//! - **Input**: a `pinentry_request` surfaces (or re-prompts) a session.
//!   The user's submission is handed back to the front-end as a
//!   `pinentry_response` and the flow becomes *awaiting outcome*.
//! - **Outcome**: the front-end reports `pinentry_result` with `success`,
//!   `retry`, `cancelled`, or `error`. `retry` is the only non-terminal
//!   result: the session stays open with an error attached and the next
//!   `pinentry_request` on the same cookie re-prompts. A 10 s single-shot
//!   timer closes the flow if the front-end never reports back.
//!
//! Every flow is pinned to the peer pid that first used the cookie; a
//! `pinentry_result` from anyone else is rejected. Retry progress is
//! parsed from the `(N of M attempts)` pattern in the description and
//! remembered per `keyinfo` for requests that do not restate it.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use bb_auth_core::Secret;
use bb_auth_core::wire::{self, PinentryRequest, PinentryResult};

use crate::agent::AgentCore;
use crate::agent::session::{Context, SessionResult, Source};
use crate::ipc::ClientId;

/// Prompt used when the front-end sends none.
const DEFAULT_PROMPT: &str = "Enter passphrase:";

/// Error used when the source reports a failure without a message.
const DEFAULT_AUTH_ERROR: &str = "Authentication failed";

/// One request waiting for user input.
#[derive(Debug, Clone)]
pub struct PendingPinentryInput {
    pub cookie: String,
    pub client: ClientId,
    pub peer_pid: Option<i32>,
    pub prompt: String,
    pub description: String,
    pub error: String,
    pub keyinfo: String,
    pub repeat: bool,
    pub confirm_only: bool,
}

/// A flow whose passphrase was handed back; waiting for the terminal
/// result or the timeout.
struct AwaitingOutcome {
    request: PendingPinentryInput,
    timer: JoinHandle<()>,
    epoch: u64,
}

/// Remembered retry progress for one key identity.
#[derive(Debug, Default, Clone, Copy)]
struct RetryInfo {
    cur_retry: u32,
    max_retries: u32,
}

/// Owner of all per-cookie pinentry state.
pub struct PinentryManager {
    pending_inputs: HashMap<String, PendingPinentryInput>,
    awaiting: HashMap<String, AwaitingOutcome>,
    flow_owners: HashMap<String, Option<i32>>,
    flow_keyinfos: HashMap<String, String>,
    retry_info: HashMap<String, RetryInfo>,
    retry_reported: HashSet<String>,
    retry_pattern: Regex,
    next_epoch: u64,
}

impl Default for PinentryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PinentryManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending_inputs: HashMap::new(),
            awaiting: HashMap::new(),
            flow_owners: HashMap::new(),
            flow_keyinfos: HashMap::new(),
            retry_info: HashMap::new(),
            retry_reported: HashSet::new(),
            retry_pattern: Regex::new(r"\((\d+)\s+of\s+(\d+)\s+attempts\)")
                .expect("retry pattern is valid"),
            next_epoch: 0,
        }
    }

    /// Phase A: an incoming `pinentry_request`. Returns an error reply for
    /// the sender when the request is rejected.
    pub fn handle_request(
        &mut self,
        core: &mut AgentCore,
        client: ClientId,
        peer_pid: Option<i32>,
        req: PinentryRequest,
    ) -> Option<Value> {
        let cookie = req
            .cookie
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(owner) = self.flow_owners.get(&cookie) {
            if *owner != peer_pid {
                warn!(
                    "pinentry owner mismatch for cookie {cookie}: expected {owner:?}, got {peer_pid:?}"
                );
                return Some(wire::error_reply("Cookie owned by another process"));
            }
        }
        self.flow_owners.insert(cookie.clone(), peer_pid);

        if !req.keyinfo.is_empty() {
            self.flow_keyinfos
                .insert(cookie.clone(), req.keyinfo.clone());
        }

        let prompt = if req.prompt.is_empty() {
            DEFAULT_PROMPT.to_owned()
        } else {
            req.prompt.clone()
        };

        let (cur_retry, max_retries) = self.resolve_retry_info(&req);
        let session_exists = core.session_exists(&cookie);

        // An awaiting-outcome record here means the source skipped the
        // explicit retry result and is re-prompting directly: the last
        // attempt failed.
        if self.awaiting.contains_key(&cookie) {
            self.clear_awaiting(&cookie);
            let retry_error = if req.error.is_empty() {
                DEFAULT_AUTH_ERROR
            } else {
                req.error.as_str()
            };
            core.update_session_error(&cookie, retry_error);
        }

        self.pending_inputs.insert(
            cookie.clone(),
            PendingPinentryInput {
                cookie: cookie.clone(),
                client,
                peer_pid,
                prompt: prompt.clone(),
                description: req.description.clone(),
                error: req.error.clone(),
                keyinfo: req.keyinfo.clone(),
                repeat: req.repeat,
                confirm_only: req.confirm_only,
            },
        );

        if session_exists {
            core.update_session_pinentry_retry(&cookie, cur_retry, max_retries);
        } else {
            let actor = core.resolve_actor(peer_pid);
            let ctx = Context {
                message: prompt.clone(),
                description: req.description,
                keyinfo: req.keyinfo,
                cur_retry,
                max_retries,
                confirm_only: req.confirm_only,
                repeat: req.repeat,
                requestor: actor.to_requestor(peer_pid),
                ..Context::default()
            };
            core.create_session(&cookie, Source::Pinentry, ctx);
        }

        // Preserve any error attached just above.
        core.update_session_prompt(&cookie, &prompt, false, false);

        let mut emit_request_error = !req.error.is_empty();
        if self.retry_reported.remove(&cookie) {
            // The retry result already surfaced this failure.
            emit_request_error = false;
        }
        if emit_request_error {
            core.update_session_error(&cookie, &req.error);
        }

        None
    }

    /// Whether `cookie` belongs to the pinentry subsystem in any phase.
    #[must_use]
    pub fn has_request(&self, core: &AgentCore, cookie: &str) -> bool {
        self.pending_inputs.contains_key(cookie)
            || self.awaiting.contains_key(cookie)
            || core.session_source(cookie) == Some(Source::Pinentry)
    }

    /// Whether `cookie` has input pending.
    #[must_use]
    pub fn has_pending_input(&self, cookie: &str) -> bool {
        self.pending_inputs.contains_key(cookie)
    }

    /// Whether `cookie` is between submission and terminal result.
    #[must_use]
    pub fn is_awaiting_outcome(&self, cookie: &str) -> bool {
        self.awaiting.contains_key(cookie)
    }

    /// The user submitted: hand the passphrase (or confirmation) back to
    /// the originating front-end and start the outcome timer. Returns the
    /// reply for the responder.
    pub fn handle_respond(
        &mut self,
        core: &mut AgentCore,
        cookie: &str,
        response: Secret,
    ) -> Value {
        let Some(request) = self.pending_inputs.remove(cookie) else {
            if self.awaiting.contains_key(cookie) {
                return wire::error_reply("Session is already awaiting terminal result");
            }
            if core.session_source(cookie) == Some(Source::Pinentry) {
                return wire::error_reply("Session is not accepting input");
            }
            return wire::error_reply("Unknown session");
        };

        let reply = if request.confirm_only {
            json!({
                "type": "pinentry_response",
                "id": cookie,
                "result": "confirmed",
            })
        } else {
            json!({
                "type": "pinentry_response",
                "id": cookie,
                "result": "ok",
                "password": response,
            })
        };
        core.send(request.client, &reply);

        self.clear_awaiting(cookie);
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let timer = core.spawn_outcome_timer(cookie.to_owned(), epoch);
        self.awaiting.insert(
            cookie.to_owned(),
            AwaitingOutcome {
                request,
                timer,
                epoch,
            },
        );

        wire::ok_reply()
    }

    /// Phase B: terminal outcome reported by the front-end.
    pub fn handle_result(
        &mut self,
        core: &mut AgentCore,
        peer_pid: Option<i32>,
        msg: PinentryResult,
    ) -> Value {
        let cookie = msg.id;
        if cookie.is_empty() {
            return wire::error_reply("Missing id");
        }

        if !self.validate_result_owner(&cookie, peer_pid) {
            return wire::error_reply("Result sender does not own session");
        }

        if core.session_source(&cookie) != Some(Source::Pinentry) {
            return wire::error_reply("Unknown pinentry session");
        }

        let error = msg.error;
        match msg.result.to_lowercase().as_str() {
            "success" => {
                self.close_flow(core, &cookie, SessionResult::Success, None);
                wire::ok_reply()
            }
            "retry" => {
                self.clear_awaiting(&cookie);
                let reason = if error.is_empty() {
                    DEFAULT_AUTH_ERROR
                } else {
                    error.as_str()
                };
                self.retry_reported.insert(cookie.clone());
                core.update_session_error(&cookie, reason);
                wire::ok_reply()
            }
            "cancelled" | "canceled" => {
                self.close_flow(core, &cookie, SessionResult::Cancelled, None);
                wire::ok_reply()
            }
            "error" => {
                let reason = if error.is_empty() {
                    DEFAULT_AUTH_ERROR.to_owned()
                } else {
                    error
                };
                self.close_flow(core, &cookie, SessionResult::Error, Some(&reason));
                wire::ok_reply()
            }
            _ => wire::error_reply("Invalid result type"),
        }
    }

    /// The user cancelled. Notifies the originating front-end and closes
    /// the flow. Returns the reply for the responder.
    pub fn handle_cancel(&mut self, core: &mut AgentCore, cookie: &str) -> Value {
        let known = self.pending_inputs.contains_key(cookie)
            || self.awaiting.contains_key(cookie)
            || core.session_source(cookie) == Some(Source::Pinentry);
        if !known {
            return wire::error_reply("Unknown session");
        }

        let originator = self
            .pending_inputs
            .get(cookie)
            .map(|request| request.client)
            .or_else(|| self.awaiting.get(cookie).map(|a| a.request.client));
        if let Some(client) = originator {
            core.send(
                client,
                &json!({
                    "type": "pinentry_response",
                    "id": cookie,
                    "result": "cancelled",
                }),
            );
        }

        self.close_flow(core, cookie, SessionResult::Cancelled, None);
        wire::ok_reply()
    }

    /// The outcome timer fired. The epoch guards against a stale timer
    /// racing a just-restarted flow.
    pub fn handle_outcome_timeout(&mut self, core: &mut AgentCore, cookie: &str, epoch: u64) {
        let current = self.awaiting.get(cookie).map(|a| a.epoch);
        if current != Some(epoch) {
            debug!("stale pinentry outcome timer for {cookie} ignored");
            return;
        }
        self.close_flow(
            core,
            cookie,
            SessionResult::Error,
            Some("Pinentry did not report terminal result"),
        );
    }

    /// The originating front-end disconnected: cancel all of its flows.
    pub fn cleanup_for_client(&mut self, core: &mut AgentCore, client: ClientId) {
        let mut cookies: Vec<String> = self
            .pending_inputs
            .values()
            .filter(|request| request.client == client)
            .map(|request| request.cookie.clone())
            .collect();
        cookies.extend(
            self.awaiting
                .values()
                .filter(|a| a.request.client == client)
                .map(|a| a.request.cookie.clone()),
        );

        for cookie in cookies {
            self.close_flow(
                core,
                &cookie,
                SessionResult::Cancelled,
                Some("Pinentry disconnected"),
            );
        }
    }

    /// Extracts retry counters from the request, falling back to (and
    /// refreshing) the per-keyinfo table.
    fn resolve_retry_info(&mut self, req: &PinentryRequest) -> (u32, u32) {
        let mut cur_retry = 0;
        let mut max_retries = 3;
        let mut parsed = false;

        if let Some(caps) = self.retry_pattern.captures(&req.description) {
            cur_retry = caps[1].parse().unwrap_or(0);
            max_retries = caps[2].parse().unwrap_or(3);
            parsed = true;
        }

        if !req.keyinfo.is_empty() {
            let info = self.retry_info.entry(req.keyinfo.clone()).or_default();
            if parsed {
                info.cur_retry = cur_retry;
                info.max_retries = max_retries;
            } else {
                cur_retry = info.cur_retry;
                max_retries = if info.max_retries > 0 {
                    info.max_retries
                } else {
                    3
                };
            }
        }

        if max_retries == 0 {
            max_retries = 3;
        }
        (cur_retry, max_retries)
    }

    fn validate_result_owner(&self, cookie: &str, peer_pid: Option<i32>) -> bool {
        self.flow_owners
            .get(cookie)
            .is_none_or(|owner| *owner == peer_pid)
    }

    fn clear_awaiting(&mut self, cookie: &str) {
        if let Some(awaiting) = self.awaiting.remove(cookie) {
            awaiting.timer.abort();
        }
    }

    /// Tears down every piece of per-cookie state and closes the session.
    fn close_flow(
        &mut self,
        core: &mut AgentCore,
        cookie: &str,
        result: SessionResult,
        error: Option<&str>,
    ) {
        if core.session_source(cookie) == Some(Source::Pinentry) {
            if let Some(error) = error {
                core.update_session_error(cookie, error);
            }
            core.close_session(cookie, result);
        }

        self.pending_inputs.remove(cookie);
        self.clear_awaiting(cookie);
        self.flow_owners.remove(cookie);
        self.retry_reported.remove(cookie);
        if let Some(keyinfo) = self.flow_keyinfos.remove(cookie) {
            self.retry_info.remove(&keyinfo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(description: &str, keyinfo: &str) -> PinentryRequest {
        PinentryRequest {
            cookie: None,
            prompt: String::new(),
            description: description.to_owned(),
            error: String::new(),
            keyinfo: keyinfo.to_owned(),
            repeat: false,
            confirm_only: false,
        }
    }

    #[test]
    fn parses_retry_counters_from_description() {
        let mut manager = PinentryManager::new();
        let (cur, max) = manager.resolve_retry_info(&request("Bad try (2 of 3 attempts)", ""));
        assert_eq!((cur, max), (2, 3));
    }

    #[test]
    fn keyinfo_table_remembers_progress() {
        let mut manager = PinentryManager::new();

        let (cur, max) = manager.resolve_retry_info(&request("(1 of 3 attempts)", "s/abc"));
        assert_eq!((cur, max), (1, 3));

        // Same key, no counters restated: table supplies them.
        let (cur, max) = manager.resolve_retry_info(&request("Please enter the passphrase", "s/abc"));
        assert_eq!((cur, max), (1, 3));

        // Different key: defaults.
        let (cur, max) = manager.resolve_retry_info(&request("Please enter the passphrase", "s/def"));
        assert_eq!((cur, max), (0, 3));
    }

    #[test]
    fn zero_max_retries_is_clamped() {
        let mut manager = PinentryManager::new();
        let (cur, max) = manager.resolve_retry_info(&request("(0 of 0 attempts)", ""));
        assert_eq!(cur, 0);
        assert_eq!(max, 3);
    }

    #[test]
    fn owner_validation() {
        let mut manager = PinentryManager::new();
        manager.flow_owners.insert("c1".into(), Some(42));

        assert!(manager.validate_result_owner("c1", Some(42)));
        assert!(!manager.validate_result_owner("c1", Some(43)));
        assert!(!manager.validate_result_owner("c1", None));
        // Unclaimed cookies accept anyone.
        assert!(manager.validate_result_owner("c2", Some(99)));
    }
}
