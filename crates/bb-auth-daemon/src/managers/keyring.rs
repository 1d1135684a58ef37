//! Keyring prompt correlation.
//!
//! The keyring prompter connects, sends a `keyring_request`, and keeps the
//! connection open; whatever the user does is reported back on that same
//! connection as a single `keyring_response`. Unlike pinentry there is no
//! second phase: handing the password back is the end of the flow.

use std::collections::HashMap;

use serde_json::{Value, json};
use uuid::Uuid;

use bb_auth_core::Secret;
use bb_auth_core::wire::{self, KeyringRequest};

use crate::agent::AgentCore;
use crate::agent::session::{Context, SessionResult, Source};
use crate::ipc::ClientId;

/// Correlation record for one outstanding keyring prompt.
#[derive(Debug)]
pub struct PendingKeyringRequest {
    pub cookie: String,
    pub client: ClientId,
    pub peer_pid: Option<i32>,
    pub title: String,
    pub message: String,
    pub choice: Option<String>,
    pub flags: i32,
}

/// Owner of pending keyring prompts, keyed by cookie.
#[derive(Default)]
pub struct KeyringManager {
    pending: HashMap<String, PendingKeyringRequest>,
}

impl KeyringManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles an incoming `keyring_request`: records the pending prompt,
    /// resolves the requestor, and surfaces a Keyring session.
    pub fn handle_request(
        &mut self,
        core: &mut AgentCore,
        client: ClientId,
        peer_pid: Option<i32>,
        req: KeyringRequest,
    ) {
        let cookie = req
            .cookie
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let title = req.effective_title();
        let message = req.message.clone();

        self.pending.insert(
            cookie.clone(),
            PendingKeyringRequest {
                cookie: cookie.clone(),
                client,
                peer_pid,
                title: title.clone(),
                message: message.clone(),
                choice: req.choice,
                flags: req.flags,
            },
        );

        let actor = core.resolve_actor(peer_pid);
        let ctx = Context {
            message: title,
            keyring_name: message.clone(),
            requestor: actor.to_requestor(peer_pid),
            ..Context::default()
        };

        core.create_session(&cookie, Source::Keyring, ctx);
        core.update_session_prompt(&cookie, &message, false, true);
    }

    /// Whether `cookie` belongs to this manager.
    #[must_use]
    pub fn has(&self, cookie: &str) -> bool {
        self.pending.contains_key(cookie)
    }

    /// Delivers the user's submission to the originating client and closes
    /// the session as a success. Returns the reply for the responder.
    pub fn handle_respond(
        &mut self,
        core: &mut AgentCore,
        cookie: &str,
        response: Secret,
    ) -> Value {
        let Some(request) = self.pending.remove(cookie) else {
            return wire::error_reply("Unknown session");
        };

        let reply = json!({
            "type": "keyring_response",
            "id": cookie,
            "result": "ok",
            "password": response,
        });
        core.send(request.client, &reply);

        core.close_session(cookie, SessionResult::Success);
        wire::ok_reply()
    }

    /// Reports a cancellation to the originating client and closes the
    /// session. Returns the reply for the responder.
    pub fn handle_cancel(&mut self, core: &mut AgentCore, cookie: &str) -> Value {
        let Some(request) = self.pending.remove(cookie) else {
            return wire::error_reply("Unknown session");
        };

        core.send(
            request.client,
            &json!({
                "type": "keyring_response",
                "result": "cancelled",
                "id": cookie,
            }),
        );

        core.close_session(cookie, SessionResult::Cancelled);
        wire::ok_reply()
    }

    /// Closes every pending prompt that originated from a now-disconnected
    /// client. No response is sent; there is nobody left to read it.
    pub fn cleanup_for_client(&mut self, core: &mut AgentCore, client: ClientId) {
        let cookies: Vec<String> = self
            .pending
            .values()
            .filter(|request| request.client == client)
            .map(|request| request.cookie.clone())
            .collect();

        for cookie in cookies {
            self.pending.remove(&cookie);
            core.close_session(&cookie, SessionResult::Cancelled);
        }
    }
}
