//! Bridges from external credential sources into sessions.
//!
//! Each manager owns the short-lived correlation records between an
//! originating client socket and the session it spawned, and drives the
//! session store through the [`AgentCore`](crate::agent::AgentCore) it is
//! handed on every call. Terminal replies to an originator happen at most
//! once: responding or cancelling consumes the correlation record, so a
//! duplicate reply has nothing left to send.

pub mod keyring;
pub mod pinentry;

pub use keyring::KeyringManager;
pub use pinentry::PinentryManager;
