//! Optional bootstrap-state file.
//!
//! A desktop session can drop a small env-style file at
//! `<state-dir>/bb-auth/bootstrap-state.env` describing how the broker was
//! brought up (greeter handoff, session mode, timestamp of the handoff).
//! The daemon treats the contents as an opaque key/value map and surfaces
//! them verbatim in `pong` replies so UIs can adapt without a separate
//! side channel.

use std::env;
use std::fs;

use serde_json::{Map, Value};

use crate::paths;

/// File name under the bb-auth state directory.
pub const BOOTSTRAP_STATE_FILE: &str = "bootstrap-state.env";

/// Environment variable that overrides the `mode` key.
pub const MODE_ENV_VAR: &str = "BB_AUTH_MODE";

/// Loads the bootstrap state map, if any.
///
/// Returns an empty map when the file is absent or unreadable; the
/// `BB_AUTH_MODE` override applies either way.
#[must_use]
pub fn load() -> Map<String, Value> {
    let mut map = paths::state_dir()
        .map(|dir| dir.join(BOOTSTRAP_STATE_FILE))
        .and_then(|path| fs::read_to_string(path).ok())
        .map(|contents| parse(&contents))
        .unwrap_or_default();

    if let Ok(mode) = env::var(MODE_ENV_VAR) {
        if !mode.is_empty() {
            map.insert("mode".to_owned(), Value::String(mode));
        }
    }

    map
}

/// Parses `key=value` lines into a JSON map.
///
/// Blank lines and `#` comments are skipped; `timestamp` is parsed as a
/// 64-bit integer, every other value stays a string. Malformed lines are
/// ignored rather than rejected; the file is advisory.
#[must_use]
pub fn parse(contents: &str) -> Map<String, Value> {
    let mut map = Map::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            continue;
        }

        let parsed = if key == "timestamp" {
            match value.parse::<i64>() {
                Ok(ts) => Value::from(ts),
                Err(_) => Value::String(value.to_owned()),
            }
        } else {
            Value::String(value.to_owned())
        };

        map.insert(key.to_owned(), parsed);
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_comments_and_timestamp() {
        let contents = "\
# written by the greeter
mode=greeter
timestamp=1722550000
display = :0
";
        let map = parse(contents);
        assert_eq!(map.get("mode"), Some(&Value::String("greeter".into())));
        assert_eq!(map.get("timestamp"), Some(&Value::from(1_722_550_000_i64)));
        assert_eq!(map.get("display"), Some(&Value::String(":0".into())));
        assert!(!map.contains_key("# written by the greeter"));
    }

    #[test]
    fn skips_malformed_lines() {
        let map = parse("no-equals-here\n=value-without-key\nok=1\n");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("ok"), Some(&Value::String("1".into())));
    }

    #[test]
    fn non_numeric_timestamp_stays_a_string() {
        let map = parse("timestamp=soon\n");
        assert_eq!(map.get("timestamp"), Some(&Value::String("soon".into())));
    }
}
