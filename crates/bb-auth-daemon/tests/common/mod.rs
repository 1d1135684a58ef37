//! Shared test harness: an agent driven directly by synthesized events,
//! with channel-backed fake clients instead of real sockets.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use bb_auth_core::Secret;
use bb_auth_daemon::agent::{Agent, AgentEvent, AgentHandle};
use bb_auth_daemon::ipc::{ClientId, OutboundFrame};
use bb_auth_daemon::polkit::{PolicySession, PolicySessionFactory};
use bb_auth_daemon::requestor::{DesktopIndex, RequestorResolver};

/// One fake connection: an id plus the receiving end of its send queue.
pub struct TestClient {
    pub id: ClientId,
    rx: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl TestClient {
    /// Next queued message, if any.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx
            .try_recv()
            .ok()
            .map(|frame| serde_json::from_slice(&frame.0).expect("frames hold valid JSON"))
    }

    /// All queued messages.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(msg) = self.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Next message, asserting its type.
    pub fn expect(&mut self, msg_type: &str) -> Value {
        let msg = self.try_recv().expect("expected a message, queue is empty");
        assert_eq!(msg["type"], msg_type, "unexpected message: {msg}");
        msg
    }

    /// Asserts the queue is empty.
    pub fn expect_none(&mut self) {
        if let Some(msg) = self.try_recv() {
            panic!("expected no message, got {msg}");
        }
    }
}

/// Agent plus the receiver its handle posts into.
pub struct Harness {
    pub agent: Agent,
    rx: mpsc::UnboundedReceiver<AgentEvent>,
    next_id: u64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_factory(Box::new(NullFactory))
    }

    pub fn with_factory(factory: Box<dyn PolicySessionFactory>) -> Self {
        // A resolver over a nonexistent proc root: every actor resolves
        // to Unknown without touching the host system.
        let resolver = RequestorResolver::with_roots(
            PathBuf::from("/nonexistent-proc-root"),
            1000,
            DesktopIndex::default(),
        );
        Self::with_factory_and_resolver(factory, resolver)
    }

    pub fn with_factory_and_resolver(
        factory: Box<dyn PolicySessionFactory>,
        resolver: RequestorResolver,
    ) -> Self {
        let (handle, rx) = AgentHandle::channel();
        let agent = Agent::with_parts(
            handle,
            std::env::temp_dir().join("bb-auth-harness.sock"),
            factory,
            resolver,
            Map::new(),
        );
        Self {
            agent,
            rx,
            next_id: 0,
        }
    }

    pub async fn connect(&mut self) -> TestClient {
        self.connect_with_pid(None).await
    }

    pub async fn connect_with_pid(&mut self, peer_pid: Option<i32>) -> TestClient {
        self.next_id += 1;
        let id = ClientId(self.next_id);
        let (tx, rx) = mpsc::unbounded_channel();
        self.agent
            .handle_event(AgentEvent::ClientConnected { id, peer_pid, tx })
            .await;
        TestClient { id, rx }
    }

    pub async fn send(&mut self, client: &TestClient, msg: Value) {
        self.agent
            .handle_event(AgentEvent::Message {
                client: client.id,
                msg,
            })
            .await;
    }

    pub async fn disconnect(&mut self, client: &TestClient) {
        self.agent
            .handle_event(AgentEvent::ClientDisconnected(client.id))
            .await;
    }

    /// Lets spawned tasks (timers, policy-session drivers) run.
    pub async fn settle(&mut self) {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    /// Delivers every event queued behind the agent handle.
    pub async fn pump(&mut self) {
        self.settle().await;
        while let Ok(event) = self.rx.try_recv() {
            self.agent.handle_event(event).await;
        }
    }
}

/// What a mock policy session observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockAction {
    Create { cookie: String, user: String },
    Initiate { cookie: String },
    Respond { cookie: String, password: String },
    Cancel { cookie: String },
}

/// Shared recording of mock policy-session activity.
#[derive(Clone, Default)]
pub struct ActionLog(Arc<Mutex<Vec<MockAction>>>);

impl ActionLog {
    pub fn record(&self, action: MockAction) {
        self.0.lock().unwrap().push(action);
    }

    /// Takes everything recorded so far.
    pub fn take(&self) -> Vec<MockAction> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// Factory recording session lifecycles; callbacks are driven by tests.
pub struct MockFactory {
    pub log: ActionLog,
}

impl MockFactory {
    pub fn new() -> (Self, ActionLog) {
        let log = ActionLog::default();
        (Self { log: log.clone() }, log)
    }
}

impl PolicySessionFactory for MockFactory {
    fn create(&mut self, cookie: &str, user: &str, _events: AgentHandle) -> Box<dyn PolicySession> {
        self.log.record(MockAction::Create {
            cookie: cookie.to_owned(),
            user: user.to_owned(),
        });
        Box::new(MockSession {
            cookie: cookie.to_owned(),
            log: self.log.clone(),
        })
    }
}

struct MockSession {
    cookie: String,
    log: ActionLog,
}

impl PolicySession for MockSession {
    fn initiate(&mut self) {
        self.log.record(MockAction::Initiate {
            cookie: self.cookie.clone(),
        });
    }

    fn respond(&mut self, response: Secret) {
        self.log.record(MockAction::Respond {
            cookie: self.cookie.clone(),
            password: response.expose().to_owned(),
        });
    }

    fn cancel(&mut self) {
        self.log.record(MockAction::Cancel {
            cookie: self.cookie.clone(),
        });
    }
}

/// Factory for tests that never touch polkit.
pub struct NullFactory;

impl PolicySessionFactory for NullFactory {
    fn create(
        &mut self,
        _cookie: &str,
        _user: &str,
        _events: AgentHandle,
    ) -> Box<dyn PolicySession> {
        Box::new(NullSession)
    }
}

struct NullSession;

impl PolicySession for NullSession {
    fn initiate(&mut self) {}
    fn respond(&mut self, _response: Secret) {}
    fn cancel(&mut self) {}
}
