//! The broker engine.
//!
//! All daemon state lives in one [`Agent`] driven by a single task: the
//! IPC server, timers, and policy-session callbacks post [`AgentEvent`]s
//! through an [`AgentHandle`] and the agent processes them in arrival
//! order. Nothing here is shared across threads, so there are no locks;
//! event emission is synchronous with the state change that produced it.
//!
//! [`AgentCore`] carries the engine state the managers need to reach
//! (session store, provider registry, event queue, outbox); the managers
//! and the polkit bridge receive it explicitly on every call instead of
//! going through any global.

pub mod events;
pub mod providers;
pub mod session;
pub mod store;

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use bb_auth_core::constants::{
    PINENTRY_RESULT_TIMEOUT, PROTOCOL_VERSION, PROVIDER_MAINTENANCE_INTERVAL,
};
use bb_auth_core::wire::{
    self, KeyringRequest, PinentryRequest, PinentryResult, SessionCancel, SessionRespond,
    UiRegister,
};
use bb_auth_core::{Secret, bootstrap};

use crate::fallback::FallbackLauncher;
use crate::ipc::{ClientId, Outbox, OutboundFrame};
use crate::managers::{KeyringManager, PinentryManager};
use crate::polkit::{PolicySessionFactory, PolkitBridge, PolkitEvent};
use crate::requestor::{ActorInfo, RequestorResolver};

use events::{EventQueue, route_event};
use providers::ProviderRegistry;
use session::{Context, SessionResult, Source};
use store::SessionStore;

/// Everything that can wake the agent loop.
pub enum AgentEvent {
    /// A connection was accepted; `tx` is its send queue.
    ClientConnected {
        id: ClientId,
        peer_pid: Option<i32>,
        tx: mpsc::UnboundedSender<OutboundFrame>,
    },
    /// A connection went away.
    ClientDisconnected(ClientId),
    /// A validated protocol message.
    Message { client: ClientId, msg: Value },
    /// A pinentry outcome timer fired.
    PinentryOutcomeTimeout { cookie: String, epoch: u64 },
    /// Policy authority traffic.
    Polkit(PolkitEvent),
}

/// Cloneable sender half of the agent loop.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentHandle {
    /// Creates the handle and the receiver the agent loop consumes.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Posts an event; dropped silently once the loop is gone.
    pub fn send(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    /// Posts a polkit bridge event.
    pub fn polkit(&self, event: PolkitEvent) {
        self.send(AgentEvent::Polkit(event));
    }
}

/// Engine state shared with the managers and the polkit bridge.
pub struct AgentCore {
    handle: AgentHandle,
    outbox: Outbox,
    peer_pids: HashMap<ClientId, Option<i32>>,
    subscribers: Vec<ClientId>,
    store: SessionStore,
    registry: ProviderRegistry,
    queue: EventQueue,
    resolver: RequestorResolver,
    fallback: FallbackLauncher,
    socket_path: PathBuf,
    bootstrap: Map<String, Value>,
}

impl AgentCore {
    fn new(
        handle: AgentHandle,
        socket_path: PathBuf,
        resolver: RequestorResolver,
        bootstrap: Map<String, Value>,
    ) -> Self {
        Self {
            handle,
            outbox: Outbox::new(),
            peer_pids: HashMap::new(),
            subscribers: Vec::new(),
            store: SessionStore::new(),
            registry: ProviderRegistry::new(),
            queue: EventQueue::default(),
            resolver,
            fallback: FallbackLauncher::new(),
            socket_path,
            bootstrap,
        }
    }

    /// The handle timers and policy sessions post through.
    #[must_use]
    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    /// Queues one message for a client.
    pub fn send(&self, client: ClientId, value: &Value) -> bool {
        self.outbox.send(client, value)
    }

    /// Peer pid recorded at accept time.
    #[must_use]
    pub fn peer_pid(&self, client: ClientId) -> Option<i32> {
        self.peer_pids.get(&client).copied().flatten()
    }

    /// Resolves the requestor identity behind a peer pid.
    #[must_use]
    pub fn resolve_actor(&self, peer_pid: Option<i32>) -> ActorInfo {
        match peer_pid {
            Some(pid) => self.resolver.resolve(pid),
            None => ActorInfo::unknown(),
        }
    }

    /// Routes an event: steered to the active provider for `session.*`,
    /// broadcast otherwise, then enqueued and drained to waiters.
    pub fn emit_event(&mut self, event: &Value) {
        let outbox = &self.outbox;
        let connected = |client: ClientId| outbox.is_connected(client);
        let mut send = |client: ClientId, value: &Value| {
            outbox.send(client, value);
        };
        route_event(
            event,
            &self.subscribers,
            &self.registry,
            &mut self.queue,
            &connected,
            &mut send,
        );
    }

    /// Creates a session and emits `session.created`.
    pub fn create_session(&mut self, id: &str, source: Source, ctx: Context) {
        let event = self.store.create(id, source, ctx);
        self.emit_event(&event);
    }

    /// Updates a session prompt and emits `session.updated`.
    pub fn update_session_prompt(&mut self, id: &str, prompt: &str, echo: bool, clear_error: bool) {
        if let Some(event) = self.store.update_prompt(id, prompt, echo, clear_error) {
            self.emit_event(&event);
        }
    }

    /// Attaches an error and emits `session.updated`.
    pub fn update_session_error(&mut self, id: &str, error: &str) {
        if let Some(event) = self.store.update_error(id, error) {
            self.emit_event(&event);
        }
    }

    /// Attaches transient info and emits `session.updated`.
    pub fn update_session_info(&mut self, id: &str, info: &str) {
        if let Some(event) = self.store.update_info(id, info) {
            self.emit_event(&event);
        }
    }

    /// Updates pinentry retry counters (no event of its own).
    pub fn update_session_pinentry_retry(&mut self, id: &str, cur: u32, max: u32) -> bool {
        self.store.update_pinentry_retry(id, cur, max)
    }

    /// Closes a session and emits its final `session.closed`.
    pub fn close_session(&mut self, id: &str, result: SessionResult) {
        if let Some(event) = self.store.close(id, result) {
            self.emit_event(&event);
        }
    }

    #[must_use]
    pub fn session_exists(&self, id: &str) -> bool {
        self.store.get(id).is_some()
    }

    #[must_use]
    pub fn session_source(&self, id: &str) -> Option<Source> {
        self.store.source_of(id)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    #[must_use]
    pub fn has_active_provider(&self) -> bool {
        self.registry.has_active()
    }

    /// Starts the single-shot pinentry outcome timer.
    pub fn spawn_outcome_timer(&self, cookie: String, epoch: u64) -> JoinHandle<()> {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PINENTRY_RESULT_TIMEOUT).await;
            handle.send(AgentEvent::PinentryOutcomeTimeout { cookie, epoch });
        })
    }

    /// Re-elects the active provider against live connections.
    fn recompute_providers(&mut self) -> bool {
        let outbox = &self.outbox;
        self.registry.recompute_active(|c| outbox.is_connected(c))
    }

    /// Broadcasts the current provider status.
    fn emit_provider_status(&mut self) {
        let event = match self.registry.active_info() {
            Some(p) => json!({
                "type": "ui.active",
                "active": true,
                "provider": {
                    "id": p.id,
                    "name": p.name,
                    "kind": p.kind,
                    "priority": p.priority,
                },
            }),
            None => json!({ "type": "ui.active", "active": false }),
        };
        self.emit_event(&event);
    }

    /// Launches the fallback UI when sessions exist with no provider.
    async fn maybe_launch_fallback(&mut self, reason: &str) {
        if self.store.is_empty() || self.registry.has_active() {
            return;
        }
        let socket_path = self.socket_path.clone();
        self.fallback.ensure_running(&socket_path, reason).await;
    }
}

/// The daemon engine: core state plus the source managers.
pub struct Agent {
    core: AgentCore,
    keyring: KeyringManager,
    pinentry: PinentryManager,
    polkit: PolkitBridge,
}

impl Agent {
    /// Production construction: real `/proc`, the standard application
    /// directories, and the bootstrap state file.
    #[must_use]
    pub fn new(
        handle: AgentHandle,
        socket_path: PathBuf,
        factory: Box<dyn PolicySessionFactory>,
    ) -> Self {
        Self::with_parts(
            handle,
            socket_path,
            factory,
            RequestorResolver::new(),
            bootstrap::load(),
        )
    }

    /// Fully injected construction (tests).
    #[must_use]
    pub fn with_parts(
        handle: AgentHandle,
        socket_path: PathBuf,
        factory: Box<dyn PolicySessionFactory>,
        resolver: RequestorResolver,
        bootstrap: Map<String, Value>,
    ) -> Self {
        Self {
            core: AgentCore::new(handle, socket_path, resolver, bootstrap),
            keyring: KeyringManager::new(),
            pinentry: PinentryManager::new(),
            polkit: PolkitBridge::new(factory),
        }
    }

    /// Engine state, for inspection.
    #[must_use]
    pub fn core(&self) -> &AgentCore {
        &self.core
    }

    /// Runs the agent loop until every handle is dropped.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AgentEvent>) {
        let mut maintenance = tokio::time::interval(PROVIDER_MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = maintenance.tick() => self.maintenance().await,
            }
        }
    }

    /// Processes one event.
    pub async fn handle_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::ClientConnected { id, peer_pid, tx } => {
                self.core.outbox.attach(id, tx);
                self.core.peer_pids.insert(id, peer_pid);
            }
            AgentEvent::ClientDisconnected(id) => self.on_client_disconnected(id).await,
            AgentEvent::Message { client, msg } => self.handle_message(client, msg).await,
            AgentEvent::PinentryOutcomeTimeout { cookie, epoch } => {
                self.pinentry
                    .handle_outcome_timeout(&mut self.core, &cookie, epoch);
            }
            AgentEvent::Polkit(event) => self.polkit.on_event(&mut self.core, event),
        }
    }

    /// Periodic provider maintenance.
    pub async fn maintenance(&mut self) {
        if self.core.recompute_providers() {
            self.core.emit_provider_status();
        }
        self.core.maybe_launch_fallback("active provider lost").await;
    }

    async fn handle_message(&mut self, client: ClientId, msg: Value) {
        let msg_type = msg
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        debug!("{client} -> {msg_type}");

        match msg_type.as_str() {
            "ping" => self.handle_ping(client),
            "subscribe" => self.handle_subscribe(client),
            "next" => self.handle_next(client),
            "ui.register" => self.handle_ui_register(client, msg),
            "ui.heartbeat" => self.handle_ui_heartbeat(client),
            "ui.unregister" => self.handle_ui_unregister(client).await,
            "keyring_request" => self.handle_keyring_request(client, msg),
            "pinentry_request" => self.handle_pinentry_request(client, msg),
            "pinentry_result" => self.handle_pinentry_result(client, msg),
            "session.respond" => self.handle_respond(client, msg),
            "session.cancel" => self.handle_cancel(client, msg),
            _ => {
                self.core.send(client, &wire::error_reply("Unknown type"));
            }
        }
    }

    fn handle_ping(&mut self, client: ClientId) {
        let mut pong = Map::new();
        pong.insert("type".into(), "pong".into());
        pong.insert("version".into(), PROTOCOL_VERSION.into());
        pong.insert(
            "capabilities".into(),
            json!(["polkit", "keyring", "pinentry"]),
        );
        if !self.core.bootstrap.is_empty() {
            pong.insert("bootstrap".into(), Value::Object(self.core.bootstrap.clone()));
        }
        if let Some(p) = self.core.registry.active_info() {
            pong.insert(
                "provider".into(),
                json!({
                    "id": p.id,
                    "name": p.name,
                    "kind": p.kind,
                    "priority": p.priority,
                }),
            );
        }
        self.core.send(client, &Value::Object(pong));
    }

    fn handle_subscribe(&mut self, client: ClientId) {
        if !self.core.subscribers.contains(&client) {
            self.core.subscribers.push(client);
        }

        let is_provider = self.core.registry.contains(client);
        let is_active = is_provider && self.core.registry.active() == Some(client);

        // Replay current sessions to passive observers and to the active
        // provider; an inactive provider would duplicate prompts.
        if !is_provider || is_active {
            let replay: Vec<(Value, Value)> = self
                .core
                .store
                .iter()
                .map(|s| (s.created_event(), s.updated_event()))
                .collect();
            for (created, updated) in replay {
                self.core.send(client, &created);
                self.core.send(client, &updated);
            }
        }

        let mut reply = Map::new();
        reply.insert("type".into(), "subscribed".into());
        reply.insert("sessionCount".into(), self.core.store.len().into());
        if is_provider {
            reply.insert("active".into(), is_active.into());
        }
        self.core.send(client, &Value::Object(reply));
    }

    fn handle_next(&mut self, client: ClientId) {
        if let Some(event) = self.core.queue.take_next() {
            self.core.send(client, &event);
        } else {
            self.core.queue.subscribe_next(client);
        }
    }

    fn handle_ui_register(&mut self, client: ClientId, msg: Value) {
        let reg: UiRegister = serde_json::from_value(msg).unwrap_or(UiRegister {
            name: None,
            kind: None,
            priority: None,
        });

        let info = self.core.registry.register(client, &reg);
        let changed = self.core.recompute_providers();
        let active = self.core.registry.active() == Some(client);

        self.core.send(
            client,
            &json!({
                "type": "ui.registered",
                "id": info.id,
                "active": active,
                "priority": info.priority,
            }),
        );

        if changed {
            self.core.emit_provider_status();
        }
    }

    fn handle_ui_heartbeat(&mut self, client: ClientId) {
        if !self.core.registry.heartbeat(client) {
            self.core.send(client, &wire::error_reply("Unknown provider"));
            return;
        }

        let changed = self.core.recompute_providers();
        let active = self.core.registry.active() == Some(client);
        self.core
            .send(client, &json!({ "type": "ok", "active": active }));
        if changed {
            self.core.emit_provider_status();
        }
    }

    async fn handle_ui_unregister(&mut self, client: ClientId) {
        if !self.core.registry.unregister(client) {
            self.core.send(client, &wire::error_reply("Unknown provider"));
            return;
        }

        let changed = self.core.recompute_providers();
        self.core.send(client, &wire::ok_reply());
        if changed {
            self.core.emit_provider_status();
        }
        self.core.maybe_launch_fallback("provider unregistered").await;
    }

    fn handle_keyring_request(&mut self, client: ClientId, msg: Value) {
        let req: KeyringRequest = match serde_json::from_value(msg) {
            Ok(req) => req,
            Err(_) => {
                self.core.send(client, &wire::error_reply("Invalid request"));
                return;
            }
        };
        let peer_pid = self.core.peer_pid(client);
        self.keyring
            .handle_request(&mut self.core, client, peer_pid, req);
    }

    fn handle_pinentry_request(&mut self, client: ClientId, msg: Value) {
        let req: PinentryRequest = match serde_json::from_value(msg) {
            Ok(req) => req,
            Err(_) => {
                self.core.send(client, &wire::error_reply("Invalid request"));
                return;
            }
        };
        let peer_pid = self.core.peer_pid(client);
        if let Some(reply) = self
            .pinentry
            .handle_request(&mut self.core, client, peer_pid, req)
        {
            self.core.send(client, &reply);
        }
    }

    fn handle_pinentry_result(&mut self, client: ClientId, msg: Value) {
        let msg: PinentryResult = match serde_json::from_value(msg) {
            Ok(msg) => msg,
            Err(_) => {
                self.core.send(client, &wire::error_reply("Invalid request"));
                return;
            }
        };
        let peer_pid = self.core.peer_pid(client);
        let reply = self.pinentry.handle_result(&mut self.core, peer_pid, msg);
        self.core.send(client, &reply);
    }

    fn handle_respond(&mut self, client: ClientId, msg: Value) {
        let msg: SessionRespond = match serde_json::from_value(msg) {
            Ok(msg) => msg,
            Err(_) => {
                self.core.send(client, &wire::error_reply("Invalid request"));
                return;
            }
        };

        if !self.core.registry.is_authorized(client) {
            self.core
                .send(client, &wire::error_reply("Not active UI provider"));
            return;
        }

        let cookie = msg.id;
        let response = msg.response.unwrap_or_else(|| Secret::from(""));

        // Ownership is checked in subsystem order: keyring pending,
        // pinentry (any phase), then live polkit sessions.
        let reply = if self.keyring.has(&cookie) {
            self.keyring.handle_respond(&mut self.core, &cookie, response)
        } else if self.pinentry.has_request(&self.core, &cookie) {
            self.pinentry
                .handle_respond(&mut self.core, &cookie, response)
        } else if self.core.session_source(&cookie) == Some(Source::Polkit) {
            self.polkit.submit_password(&cookie, response);
            wire::ok_reply()
        } else {
            wire::error_reply("Unknown session")
        };
        self.core.send(client, &reply);
    }

    fn handle_cancel(&mut self, client: ClientId, msg: Value) {
        let msg: SessionCancel = match serde_json::from_value(msg) {
            Ok(msg) => msg,
            Err(_) => {
                self.core.send(client, &wire::error_reply("Invalid request"));
                return;
            }
        };

        if !self.core.registry.is_authorized(client) {
            self.core
                .send(client, &wire::error_reply("Not active UI provider"));
            return;
        }

        let cookie = msg.id;
        let reply = if self.keyring.has(&cookie) {
            self.keyring.handle_cancel(&mut self.core, &cookie)
        } else if self.pinentry.has_request(&self.core, &cookie) {
            self.pinentry.handle_cancel(&mut self.core, &cookie)
        } else if self.core.session_source(&cookie) == Some(Source::Polkit) {
            self.polkit.cancel_pending(&mut self.core, &cookie);
            wire::ok_reply()
        } else {
            wire::error_reply("Unknown session")
        };
        self.core.send(client, &reply);
    }

    /// Cascades cleanup for a disconnected client through every
    /// subsystem that may key state by it.
    async fn on_client_disconnected(&mut self, client: ClientId) {
        self.core.outbox.detach(client);
        self.core.peer_pids.remove(&client);
        self.core.subscribers.retain(|s| *s != client);
        self.core.queue.remove_waiter(client);

        self.keyring.cleanup_for_client(&mut self.core, client);
        self.pinentry.cleanup_for_client(&mut self.core, client);

        if self.core.registry.remove_client(client) && self.core.recompute_providers() {
            self.core.emit_provider_status();
        }

        self.core.maybe_launch_fallback("provider disconnected").await;
    }
}
