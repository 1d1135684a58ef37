//! Per-prompt session records and their wire events.
//!
//! A session is the broker's record of one credential prompt flow,
//! identified by an opaque cookie. It is created by a manager, mutated
//! only through [`SessionStore`](super::store::SessionStore) methods, and
//! destroyed immediately after producing its `session.closed` event.

use serde_json::{Map, Value, json};

/// Where a session originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Polkit,
    Keyring,
    Pinentry,
}

impl Source {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Polkit => "polkit",
            Self::Keyring => "keyring",
            Self::Pinentry => "pinentry",
        }
    }
}

/// Terminal outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionResult {
    Success,
    Cancelled,
    Error,
}

impl SessionResult {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

/// Session lifecycle state. The only transition is
/// `Prompting -> Closed(result)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Prompting,
    Closed(SessionResult),
}

/// The end-user-visible identity of the process behind a prompt.
#[derive(Debug, Clone, Default)]
pub struct Requestor {
    pub name: String,
    pub icon: String,
    pub fallback_letter: String,
    pub fallback_key: String,
    pub pid: Option<i32>,
}

/// Immutable creation context of a session.
///
/// `message` and `requestor` are common; the remaining fields are
/// source-specific and only serialized for the matching source.
#[derive(Debug, Clone)]
pub struct Context {
    pub message: String,
    pub requestor: Requestor,

    // Polkit
    pub action_id: String,
    pub user: String,
    pub details: Map<String, Value>,

    // Keyring
    pub keyring_name: String,

    // Pinentry
    pub description: String,
    pub keyinfo: String,
    pub cur_retry: u32,
    pub max_retries: u32,
    pub confirm_only: bool,
    pub repeat: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            message: String::new(),
            requestor: Requestor::default(),
            action_id: String::new(),
            user: String::new(),
            details: Map::new(),
            keyring_name: String::new(),
            description: String::new(),
            keyinfo: String::new(),
            cur_retry: 0,
            max_retries: 3,
            confirm_only: false,
            repeat: false,
        }
    }
}

/// One live credential prompt.
#[derive(Debug)]
pub struct Session {
    id: String,
    source: Source,
    context: Context,
    state: State,
    prompt: String,
    echo: bool,
    error: String,
    info: String,
}

impl Session {
    #[must_use]
    pub fn new(id: impl Into<String>, source: Source, context: Context) -> Self {
        Self {
            id: id.into(),
            source,
            context,
            state: State::Prompting,
            prompt: String::new(),
            echo: false,
            error: String::new(),
            info: String::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn source(&self) -> Source {
        self.source
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Updates the prompt text and echo flag.
    ///
    /// Transient `info` is always cleared; `error` is cleared unless the
    /// caller asks for it to be preserved (the pinentry retry path sets
    /// the error immediately before re-prompting).
    pub fn set_prompt(&mut self, prompt: impl Into<String>, echo: bool, clear_error: bool) {
        self.prompt = prompt.into();
        self.echo = echo;
        self.state = State::Prompting;
        if clear_error {
            self.error.clear();
        }
        self.info.clear();
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = error.into();
    }

    pub fn set_info(&mut self, info: impl Into<String>) {
        self.info = info.into();
    }

    /// Updates pinentry retry counters; no-op for other sources.
    ///
    /// Counters are clamped so `max_retries >= 1` always holds.
    pub fn set_pinentry_retry(&mut self, cur_retry: u32, max_retries: u32) {
        if self.source != Source::Pinentry {
            return;
        }
        self.context.cur_retry = cur_retry;
        self.context.max_retries = if max_retries > 0 { max_retries } else { 3 };
    }

    /// Transitions to `Closed(result)`. A success clears any stale error.
    pub fn close(&mut self, result: SessionResult) {
        self.state = State::Closed(result);
        if result == SessionResult::Success {
            self.error.clear();
        }
    }

    fn requestor_json(&self) -> Value {
        let requestor = &self.context.requestor;
        let mut obj = Map::new();
        obj.insert("name".into(), requestor.name.clone().into());
        obj.insert("icon".into(), requestor.icon.clone().into());
        obj.insert(
            "fallbackLetter".into(),
            requestor.fallback_letter.clone().into(),
        );
        if !requestor.fallback_key.is_empty() {
            obj.insert("fallbackKey".into(), requestor.fallback_key.clone().into());
        }
        if let Some(pid) = requestor.pid {
            if pid > 0 {
                obj.insert("pid".into(), pid.into());
            }
        }
        Value::Object(obj)
    }

    fn context_json(&self) -> Value {
        let ctx = &self.context;
        let mut obj = Map::new();
        obj.insert("message".into(), ctx.message.clone().into());
        obj.insert("requestor".into(), self.requestor_json());

        match self.source {
            Source::Polkit => {
                if !ctx.action_id.is_empty() {
                    obj.insert("actionId".into(), ctx.action_id.clone().into());
                }
                if !ctx.user.is_empty() {
                    obj.insert("user".into(), ctx.user.clone().into());
                }
                if !ctx.details.is_empty() {
                    obj.insert("details".into(), Value::Object(ctx.details.clone()));
                }
            }
            Source::Keyring => {
                if !ctx.keyring_name.is_empty() {
                    obj.insert("keyringName".into(), ctx.keyring_name.clone().into());
                }
            }
            Source::Pinentry => {
                if !ctx.description.is_empty() {
                    obj.insert("description".into(), ctx.description.clone().into());
                }
                if !ctx.keyinfo.is_empty() {
                    obj.insert("keyinfo".into(), ctx.keyinfo.clone().into());
                }
                obj.insert("curRetry".into(), ctx.cur_retry.into());
                obj.insert("maxRetries".into(), ctx.max_retries.into());
                obj.insert("confirmOnly".into(), ctx.confirm_only.into());
                obj.insert("repeat".into(), ctx.repeat.into());
            }
        }

        Value::Object(obj)
    }

    /// Builds the `session.created` event.
    #[must_use]
    pub fn created_event(&self) -> Value {
        json!({
            "type": "session.created",
            "id": self.id,
            "source": self.source.as_str(),
            "context": self.context_json(),
        })
    }

    /// Builds a `session.updated` event from the current prompt state.
    #[must_use]
    pub fn updated_event(&self) -> Value {
        let mut event = Map::new();
        event.insert("type".into(), "session.updated".into());
        event.insert("id".into(), self.id.clone().into());
        event.insert("state".into(), "prompting".into());
        event.insert("prompt".into(), self.prompt.clone().into());
        event.insert("echo".into(), self.echo.into());

        if self.source == Source::Pinentry {
            event.insert("curRetry".into(), self.context.cur_retry.into());
            event.insert("maxRetries".into(), self.context.max_retries.into());
        }
        if !self.error.is_empty() {
            event.insert("error".into(), self.error.clone().into());
        }
        if !self.info.is_empty() {
            event.insert("info".into(), self.info.clone().into());
        }

        Value::Object(event)
    }

    /// Builds the terminal `session.closed` event.
    #[must_use]
    pub fn closed_event(&self) -> Value {
        let result = match self.state {
            State::Closed(result) => result,
            State::Prompting => SessionResult::Error,
        };

        let mut event = Map::new();
        event.insert("type".into(), "session.closed".into());
        event.insert("id".into(), self.id.clone().into());
        event.insert("result".into(), result.as_str().into());
        if !self.error.is_empty() {
            event.insert("error".into(), self.error.clone().into());
        }
        Value::Object(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pinentry_session() -> Session {
        let ctx = Context {
            message: "Enter passphrase".into(),
            keyinfo: "s/123".into(),
            ..Context::default()
        };
        Session::new("c1", Source::Pinentry, ctx)
    }

    #[test]
    fn set_prompt_clears_info_and_optionally_error() {
        let mut session = pinentry_session();
        session.set_error("bad");
        session.set_info("checking");

        session.set_prompt("PIN", false, false);
        let event = session.updated_event();
        assert_eq!(event["error"], "bad");
        assert!(event.get("info").is_none());

        session.set_prompt("PIN", false, true);
        let event = session.updated_event();
        assert!(event.get("error").is_none());
    }

    #[test]
    fn close_success_clears_error() {
        let mut session = pinentry_session();
        session.set_error("bad");
        session.close(SessionResult::Success);

        let event = session.closed_event();
        assert_eq!(event["result"], "success");
        assert!(event.get("error").is_none());
    }

    #[test]
    fn closed_event_carries_error() {
        let mut session = pinentry_session();
        session.set_error("helper crashed");
        session.close(SessionResult::Error);

        let event = session.closed_event();
        assert_eq!(event["result"], "error");
        assert_eq!(event["error"], "helper crashed");
    }

    #[test]
    fn retry_counters_are_clamped() {
        let mut session = pinentry_session();
        session.set_pinentry_retry(2, 0);
        let event = session.updated_event();
        assert_eq!(event["curRetry"], 2);
        assert_eq!(event["maxRetries"], 3);
    }

    #[test]
    fn retry_counters_ignored_for_other_sources() {
        let mut session = Session::new("c2", Source::Keyring, Context::default());
        session.set_pinentry_retry(1, 5);
        let event = session.updated_event();
        assert!(event.get("curRetry").is_none());
    }

    #[test]
    fn created_event_shape_per_source() {
        let ctx = Context {
            message: "Authentication required".into(),
            action_id: "org.example.run".into(),
            user: "root".into(),
            ..Context::default()
        };
        let session = Session::new("pk1", Source::Polkit, ctx);
        let event = session.created_event();
        assert_eq!(event["type"], "session.created");
        assert_eq!(event["source"], "polkit");
        assert_eq!(event["context"]["actionId"], "org.example.run");
        assert!(event["context"].get("curRetry").is_none());

        let event = pinentry_session().created_event();
        assert_eq!(event["source"], "pinentry");
        assert_eq!(event["context"]["maxRetries"], 3);
        assert_eq!(event["context"]["confirmOnly"], false);
    }

    #[test]
    fn requestor_pid_omitted_when_unknown() {
        let mut ctx = Context::default();
        ctx.requestor = Requestor {
            name: "Files".into(),
            icon: "files".into(),
            fallback_letter: "F".into(),
            fallback_key: "files.desktop".into(),
            pid: None,
        };
        let session = Session::new("k1", Source::Keyring, ctx);
        let requestor = &session.created_event()["context"]["requestor"];
        assert_eq!(requestor["name"], "Files");
        assert!(requestor.get("pid").is_none());
    }
}
