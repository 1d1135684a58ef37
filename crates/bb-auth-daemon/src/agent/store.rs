//! Owner of all live sessions.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use super::session::{Context, Session, SessionResult, Source};

/// Cookie-keyed store of live sessions.
///
/// Every mutation returns the wire event it produced so the caller can
/// route it; lookup misses return `None` rather than failing. Closing a
/// session destroys the record after building its closed event, so at most
/// one live session exists per cookie at any moment.
#[derive(Default)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session and returns its `session.created` event.
    ///
    /// Managers guarantee cookie uniqueness before calling; a colliding
    /// create replaces the stale record and is logged.
    pub fn create(&mut self, id: &str, source: Source, context: Context) -> Value {
        let session = Session::new(id, source, context);
        let created = session.created_event();
        if self.sessions.insert(id.to_owned(), session).is_some() {
            warn!("session {id} replaced an existing record");
        }
        created
    }

    /// Updates the prompt; returns the `session.updated` event.
    pub fn update_prompt(
        &mut self,
        id: &str,
        prompt: &str,
        echo: bool,
        clear_error: bool,
    ) -> Option<Value> {
        let session = self.sessions.get_mut(id)?;
        session.set_prompt(prompt, echo, clear_error);
        Some(session.updated_event())
    }

    /// Attaches an error; returns the `session.updated` event.
    pub fn update_error(&mut self, id: &str, error: &str) -> Option<Value> {
        let session = self.sessions.get_mut(id)?;
        session.set_error(error);
        Some(session.updated_event())
    }

    /// Attaches transient info; returns the `session.updated` event.
    pub fn update_info(&mut self, id: &str, info: &str) -> Option<Value> {
        let session = self.sessions.get_mut(id)?;
        session.set_info(info);
        Some(session.updated_event())
    }

    /// Updates pinentry retry counters without emitting an event.
    pub fn update_pinentry_retry(&mut self, id: &str, cur_retry: u32, max_retries: u32) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) if session.source() == Source::Pinentry => {
                session.set_pinentry_retry(cur_retry, max_retries);
                true
            }
            _ => false,
        }
    }

    /// Closes and destroys the session; returns its `session.closed` event.
    pub fn close(&mut self, id: &str, result: SessionResult) -> Option<Value> {
        let mut session = self.sessions.remove(id)?;
        session.close(result);
        Some(session.closed_event())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    #[must_use]
    pub fn source_of(&self, id: &str) -> Option<Source> {
        self.sessions.get(id).map(Session::source)
    }

    /// Iterates live sessions (replay on subscribe).
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
