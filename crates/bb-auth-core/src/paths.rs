//! Default filesystem locations.

use std::env;
use std::path::PathBuf;

/// Socket file name under the runtime directory.
const SOCKET_FILE: &str = "bb-auth.sock";

/// Subdirectory of the state directory owned by bb-auth.
const STATE_SUBDIR: &str = "bb-auth";

/// Returns the default daemon socket path: `$XDG_RUNTIME_DIR/bb-auth.sock`.
///
/// Falls back to the system temp directory when `XDG_RUNTIME_DIR` is unset
/// (headless test environments, mostly).
#[must_use]
pub fn socket_path() -> PathBuf {
    let runtime_dir = env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir);
    runtime_dir.join(SOCKET_FILE)
}

/// Returns the bb-auth state directory: `$XDG_STATE_HOME/bb-auth`, or
/// `~/.local/state/bb-auth` when `XDG_STATE_HOME` is unset.
#[must_use]
pub fn state_dir() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME") {
        return Some(PathBuf::from(dir).join(STATE_SUBDIR));
    }
    env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".local/state").join(STATE_SUBDIR))
}
