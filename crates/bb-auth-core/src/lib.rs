//! Shared types and utilities for the bb-auth broker.
//!
//! This crate holds the pieces both the daemon and its clients need:
//!
//! - [`constants`]: protocol limits and timeouts
//! - [`wire`]: typed request payloads and generic reply builders
//! - [`secret`]: zeroize-on-drop credential strings ([`Secret`])
//! - [`paths`]: default socket and state-directory resolution
//! - [`bootstrap`]: optional bootstrap-state file parsing
//!
//! The wire protocol itself is newline-delimited UTF-8 JSON objects over a
//! local stream socket; every message is a JSON object with a string `type`
//! field. See the daemon crate for framing and dispatch.

pub mod bootstrap;
pub mod constants;
pub mod paths;
pub mod secret;
pub mod wire;

pub use secret::Secret;
