//! Typed request payloads and generic reply builders.
//!
//! Inbound messages are parsed in two steps: the IPC layer validates that a
//! line is a JSON object with a string `type`, then the handler for that
//! type deserializes the object into one of the structs below. Unknown
//! extra fields are ignored, matching the lenient field handling of the
//! shipping front-ends.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::secret::Secret;

/// `ui.register` payload.
#[derive(Debug, Deserialize)]
pub struct UiRegister {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub priority: Option<i32>,
}

/// `keyring_request` payload.
///
/// `title` is preferred over the older `prompt` spelling; both are carried
/// so either generation of the keyring prompter works.
#[derive(Debug, Deserialize)]
pub struct KeyringRequest {
    pub cookie: Option<String>,
    pub title: Option<String>,
    pub prompt: Option<String>,
    #[serde(default)]
    pub message: String,
    pub choice: Option<String>,
    #[serde(default)]
    pub flags: i32,
}

impl KeyringRequest {
    /// The user-facing title, whichever field carried it.
    #[must_use]
    pub fn effective_title(&self) -> String {
        self.title
            .clone()
            .or_else(|| self.prompt.clone())
            .unwrap_or_default()
    }
}

/// `pinentry_request` payload.
#[derive(Debug, Deserialize)]
pub struct PinentryRequest {
    pub cookie: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub keyinfo: String,
    #[serde(default)]
    pub repeat: bool,
    #[serde(default)]
    pub confirm_only: bool,
}

/// `pinentry_result` payload.
///
/// A missing `id` is surfaced as a handler-level error rather than a
/// parse failure, matching the error taxonomy of the daemon.
#[derive(Debug, Deserialize)]
pub struct PinentryResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error: String,
}

/// `session.respond` payload.
#[derive(Debug, Deserialize)]
pub struct SessionRespond {
    #[serde(default)]
    pub id: String,
    pub response: Option<Secret>,
}

/// `session.cancel` payload.
#[derive(Debug, Deserialize)]
pub struct SessionCancel {
    #[serde(default)]
    pub id: String,
}

/// Builds a generic `{type:"ok"}` reply.
#[must_use]
pub fn ok_reply() -> Value {
    json!({ "type": "ok" })
}

/// Builds a `{type:"error", message}` reply.
#[must_use]
pub fn error_reply(message: &str) -> Value {
    json!({ "type": "error", "message": message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyring_title_falls_back_to_prompt() {
        let req: KeyringRequest =
            serde_json::from_value(json!({ "prompt": "Unlock", "message": "Login keyring" }))
                .unwrap();
        assert_eq!(req.effective_title(), "Unlock");
        assert_eq!(req.message, "Login keyring");

        let req: KeyringRequest =
            serde_json::from_value(json!({ "title": "Unlock", "prompt": "old" })).unwrap();
        assert_eq!(req.effective_title(), "Unlock");
    }

    #[test]
    fn pinentry_request_defaults() {
        let req: PinentryRequest = serde_json::from_value(json!({})).unwrap();
        assert!(req.cookie.is_none());
        assert!(req.prompt.is_empty());
        assert!(!req.confirm_only);
        assert!(!req.repeat);
    }

    #[test]
    fn respond_payload_carries_secret() {
        let msg: SessionRespond =
            serde_json::from_value(json!({ "id": "c1", "response": "pw" })).unwrap();
        assert_eq!(msg.id, "c1");
        assert_eq!(msg.response.unwrap().expose(), "pw");
    }

    #[test]
    fn respond_tolerates_missing_fields() {
        let msg: SessionRespond = serde_json::from_value(json!({})).unwrap();
        assert!(msg.id.is_empty());
        assert!(msg.response.is_none());
    }
}
