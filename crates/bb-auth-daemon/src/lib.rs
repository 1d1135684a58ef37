//! bb-auth daemon engine.
//!
//! A per-user authentication broker: PolicyKit authentication requests,
//! keyring prompts, and GPG pinentry requests are multiplexed onto
//! pluggable UI providers connected over one local socket.
//!
//! # Architecture
//!
//! ```text
//! polkit / keyring / pinentry ──▶ managers ──▶ session store
//!                                                  │ events
//!                                                  ▼
//!                       event router ──▶ active provider │ subscribers │ next-waiters
//!                                                  │ responses
//!                                                  ▼
//!                                   managers ──▶ originating source
//! ```
//!
//! Everything runs on a single-threaded event loop (see [`agent`]); the
//! IPC layer hands connections to the engine as opaque client ids with
//! per-connection send queues.
//!
//! # Module Overview
//!
//! - [`agent`]: the engine: message handlers, session store, provider
//!   registry, event queue/router
//! - [`ipc`]: socket listener, line codec, client handles
//! - [`managers`]: keyring correlation and the two-phase pinentry flow
//! - [`polkit`]: policy-authority bridge with retry policy
//! - [`helper`]: `polkit-agent-helper-1`-backed policy sessions
//! - [`requestor`]: process-ancestry walk and desktop-entry matching
//! - [`fallback`]: fallback UI launcher

pub mod agent;
pub mod fallback;
pub mod helper;
pub mod ipc;
pub mod managers;
pub mod polkit;
pub mod requestor;

pub use agent::{Agent, AgentEvent, AgentHandle};
pub use ipc::{ClientId, IpcServer};
