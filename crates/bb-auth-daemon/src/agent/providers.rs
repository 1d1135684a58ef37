//! Connected UI providers and active-provider election.
//!
//! Any client may register as a UI provider. Exactly one provider is
//! *active* at a time and receives routed `session.*` events; the rest see
//! only broadcast status. Election is by priority, ties broken by the most
//! recent heartbeat. Providers whose connection is gone or whose heartbeat
//! is stale are evicted during every recompute.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use bb_auth_core::constants::PROVIDER_HEARTBEAT_TIMEOUT_MS;
use bb_auth_core::wire::UiRegister;

use crate::ipc::ClientId;

/// Milliseconds since the Unix epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // i64 millis overflow in ~292M years
pub fn unix_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Clock source, injectable for tests.
pub type NowFn = Box<dyn Fn() -> i64 + Send>;

/// One registered UI provider.
#[derive(Debug, Clone)]
pub struct UiProvider {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub priority: i32,
    pub last_heartbeat_ms: i64,
}

/// Registry of UI providers plus the current election result.
pub struct ProviderRegistry {
    now: NowFn,
    providers: HashMap<ClientId, UiProvider>,
    active: Option<ClientId>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Box::new(unix_time_ms))
    }

    /// Creates a registry with an injected clock.
    #[must_use]
    pub fn with_clock(now: NowFn) -> Self {
        Self {
            now,
            providers: HashMap::new(),
            active: None,
        }
    }

    /// Registers (or re-registers) `client` as a provider.
    ///
    /// The id survives re-registration on the same connection. Defaults:
    /// empty name becomes `unknown`, empty kind inherits the name, and an
    /// absent priority maps from the kind (`quickshell` 100, `fallback`
    /// 10, anything else 50).
    pub fn register(&mut self, client: ClientId, msg: &UiRegister) -> UiProvider {
        let now = (self.now)();
        let provider = self.providers.entry(client).or_insert_with(|| UiProvider {
            id: Uuid::new_v4().to_string(),
            name: String::new(),
            kind: String::new(),
            priority: 0,
            last_heartbeat_ms: 0,
        });

        provider.name = match msg.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => "unknown".to_owned(),
        };
        provider.kind = match msg.kind.as_deref() {
            Some(kind) if !kind.is_empty() => kind.to_owned(),
            _ => provider.name.clone(),
        };
        provider.priority = msg.priority.unwrap_or(match provider.kind.as_str() {
            "quickshell" => 100,
            "fallback" => 10,
            _ => 50,
        });
        provider.last_heartbeat_ms = now;

        provider.clone()
    }

    /// Refreshes the heartbeat; `false` when the client is not registered.
    pub fn heartbeat(&mut self, client: ClientId) -> bool {
        match self.providers.get_mut(&client) {
            Some(provider) => {
                provider.last_heartbeat_ms = (self.now)();
                true
            }
            None => false,
        }
    }

    /// Removes a provider; `false` when the client was not registered.
    pub fn unregister(&mut self, client: ClientId) -> bool {
        self.providers.remove(&client).is_some()
    }

    /// Disconnect cleanup; identical to [`unregister`](Self::unregister).
    pub fn remove_client(&mut self, client: ClientId) -> bool {
        self.unregister(client)
    }

    /// Re-elects the active provider, evicting disconnected and stale
    /// entries. Returns whether the active-provider identity changed.
    pub fn recompute_active(&mut self, connected: impl Fn(ClientId) -> bool) -> bool {
        let now = (self.now)();

        self.providers.retain(|client, provider| {
            connected(*client) && now - provider.last_heartbeat_ms <= PROVIDER_HEARTBEAT_TIMEOUT_MS
        });

        let best = self
            .providers
            .iter()
            .max_by_key(|(_, p)| (p.priority, p.last_heartbeat_ms))
            .map(|(client, _)| *client);

        if self.active == best {
            return false;
        }
        self.active = best;
        true
    }

    /// Maintenance-tick eviction; the returned flag drives a status
    /// broadcast.
    pub fn prune_stale(&mut self, connected: impl Fn(ClientId) -> bool) -> bool {
        self.recompute_active(connected)
    }

    /// Whether `client` may respond to sessions.
    ///
    /// With zero registered providers the registry is in unlocked mode and
    /// any socket is authorized; this keeps bare CLIs and tests working
    /// but should be treated as a deliberate policy choice. Otherwise only
    /// the active provider passes.
    #[must_use]
    pub fn is_authorized(&self, client: ClientId) -> bool {
        if self.providers.is_empty() {
            return true;
        }
        self.providers.contains_key(&client) && self.active == Some(client)
    }

    #[must_use]
    pub fn has_active(&self) -> bool {
        self.active
            .is_some_and(|client| self.providers.contains_key(&client))
    }

    #[must_use]
    pub fn active(&self) -> Option<ClientId> {
        self.active
    }

    #[must_use]
    pub fn active_info(&self) -> Option<&UiProvider> {
        self.active.and_then(|client| self.providers.get(&client))
    }

    #[must_use]
    pub fn provider(&self, client: ClientId) -> Option<&UiProvider> {
        self.providers.get(&client)
    }

    #[must_use]
    pub fn contains(&self, client: ClientId) -> bool {
        self.providers.contains_key(&client)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
