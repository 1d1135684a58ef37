//! Bounded event queue and event routing.
//!
//! Events flow out of the daemon two ways: pushed to the active provider
//! (or broadcast to subscribers), and pulled by `next` long-pollers. The
//! queue backs the pull side; routing always enqueues and then drains
//! waiters so both sides observe the same stream.

use std::collections::VecDeque;

use serde_json::Value;

use bb_auth_core::constants::EVENT_QUEUE_CAPACITY;

use super::providers::ProviderRegistry;
use crate::ipc::ClientId;

/// Bounded FIFO of pending events plus the `next` waiter list.
///
/// When the queue is full the oldest event is dropped, never the newest,
/// so a reconnecting poller still observes a session's close unless 256
/// intervening events displaced it.
pub struct EventQueue {
    max_size: usize,
    events: VecDeque<Value>,
    waiters: VecDeque<ClientId>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(EVENT_QUEUE_CAPACITY)
    }
}

impl EventQueue {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            events: VecDeque::new(),
            waiters: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Pops the oldest pending event.
    pub fn take_next(&mut self) -> Option<Value> {
        self.events.pop_front()
    }

    /// Appends an event, dropping the oldest when at capacity.
    pub fn enqueue(&mut self, event: Value) {
        if self.events.len() >= self.max_size {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Parks `client` until an event is available.
    pub fn subscribe_next(&mut self, client: ClientId) {
        self.waiters.push_back(client);
    }

    /// Drops a disconnected waiter.
    pub fn remove_waiter(&mut self, client: ClientId) {
        self.waiters.retain(|waiter| *waiter != client);
    }

    /// Pairs pending events with parked waiters in FIFO order, one event
    /// per waiter.
    pub fn drain_to_waiters(&mut self, mut send: impl FnMut(ClientId, &Value)) {
        while !self.waiters.is_empty() {
            let Some(event) = self.events.pop_front() else {
                break;
            };
            if let Some(waiter) = self.waiters.pop_front() {
                send(waiter, &event);
            }
        }
    }
}

/// Whether an event is steered to the active provider.
#[must_use]
pub fn is_session_event(event: &Value) -> bool {
    event
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.starts_with("session."))
}

/// Routes one event.
///
/// `session.*` events go only to the active provider when one exists, so
/// a single UI owns the prompt; everything else (and session events in
/// provider-less mode) is broadcast to all connected subscribers. The
/// event is then enqueued and waiters are drained immediately, with
/// provider delivery preceding the waiter drain.
pub fn route_event(
    event: &Value,
    subscribers: &[ClientId],
    registry: &ProviderRegistry,
    queue: &mut EventQueue,
    connected: &impl Fn(ClientId) -> bool,
    send: &mut impl FnMut(ClientId, &Value),
) {
    if is_session_event(event) && registry.has_active() {
        if let Some(active) = registry.active() {
            if connected(active) {
                send(active, event);
            }
        }
    } else {
        for subscriber in subscribers {
            if connected(*subscriber) {
                send(*subscriber, event);
            }
        }
    }

    queue.enqueue(event.clone());
    queue.drain_to_waiters(send);
}
