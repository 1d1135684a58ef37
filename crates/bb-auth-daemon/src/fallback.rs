//! Fallback UI launcher.
//!
//! When the last UI provider goes away while sessions still exist, the
//! daemon starts a minimal fallback window so prompts are never silently
//! stranded. Launching is best-effort: every failure is logged and none
//! is fatal.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use bb_auth_core::constants::FALLBACK_LAUNCH_COOLDOWN_MS;

use crate::agent::providers::unix_time_ms;

/// Executable name of the fallback UI.
pub const FALLBACK_BIN_NAME: &str = "bb-auth-fallback";

/// Environment override for the fallback UI location.
pub const FALLBACK_BIN_ENV: &str = "BB_AUTH_FALLBACK_BIN";

/// How long the running-instance probe may take.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Launches the fallback UI at most once per cooldown window.
pub struct FallbackLauncher {
    last_launch_ms: i64,
}

impl Default for FallbackLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self { last_launch_ms: 0 }
    }

    /// Starts the fallback UI unless one is already running or a launch
    /// was attempted within the cooldown window.
    pub async fn ensure_running(&mut self, socket_path: &Path, reason: &str) {
        let now = unix_time_ms();
        if now - self.last_launch_ms < FALLBACK_LAUNCH_COOLDOWN_MS {
            debug!("fallback launch suppressed by cooldown");
            return;
        }
        self.last_launch_ms = now;

        if probe_running().await {
            debug!("fallback UI already running");
            return;
        }

        let Some(bin) = locate_fallback_bin() else {
            warn!("no fallback UI binary found ({reason})");
            return;
        };

        info!("launching fallback UI: {} ({reason})", bin.display());
        match Command::new(&bin)
            .arg("--socket")
            .arg(socket_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
        {
            Ok(mut child) => {
                // Reap in the background; the UI outlives this call.
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(e) => warn!("failed to launch fallback UI {}: {e}", bin.display()),
        }
    }
}

/// Checks for an already-running instance under the current uid.
async fn probe_running() -> bool {
    let uid = nix::unistd::getuid().to_string();
    let child = Command::new("pgrep")
        .args(["-U", &uid, "-x", FALLBACK_BIN_NAME])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    let Ok(mut child) = child else {
        return false;
    };

    match tokio::time::timeout(PROBE_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => status.success(),
        _ => {
            let _ = child.start_kill();
            false
        }
    }
}

/// Finds the fallback UI binary: explicit override first, then alongside
/// the daemon executable.
fn locate_fallback_bin() -> Option<PathBuf> {
    if let Some(path) = env::var_os(FALLBACK_BIN_ENV) {
        return Some(PathBuf::from(path));
    }

    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(FALLBACK_BIN_NAME)))
        .filter(|path| path.exists())
}
