//! Protocol limits and timeouts shared by the daemon and its clients.

use std::time::Duration;

/// Protocol version reported in `pong` replies.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Maximum size of a single protocol line (64 KiB).
///
/// The limit is enforced before any line is buffered in full; a connection
/// that exceeds it is disconnected.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Client-side connect timeout.
pub const IPC_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Client-side read timeout for request/response exchanges.
pub const IPC_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Client-side write timeout.
pub const IPC_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long a pinentry front-end waits for the user (client-side).
pub const PINENTRY_REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long the daemon waits for a terminal `pinentry_result` after the
/// passphrase was handed back to the source.
pub const PINENTRY_RESULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum polkit authentication attempts before the session fails.
pub const MAX_AUTH_RETRIES: u32 = 3;

/// A UI provider whose last heartbeat is older than this is evicted.
pub const PROVIDER_HEARTBEAT_TIMEOUT_MS: i64 = 15_000;

/// Cadence of the provider maintenance tick.
pub const PROVIDER_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum delay between fallback-UI launch attempts.
pub const FALLBACK_LAUNCH_COOLDOWN_MS: i64 = 5_000;

/// Bounded event queue capacity; the oldest event is dropped when full.
pub const EVENT_QUEUE_CAPACITY: usize = 256;
