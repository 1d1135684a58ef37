//! Zeroize-on-drop credential strings.
//!
//! Passwords and passphrases travel through the broker exactly once: from a
//! UI provider's `session.respond` to the originating client socket. They
//! are held in a [`Secret`] for that trip so the backing storage is wiped
//! when the value is dropped, and so an accidental `{:?}` never prints the
//! contents.

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use zeroize::Zeroizing;

/// A credential string that wipes its backing storage on drop.
///
/// `Secret` deliberately does not implement `Clone`; a handler that needs
/// the value twice is holding it too long. `Debug` is redacted.
pub struct Secret(Zeroizing<String>);

impl Secret {
    /// Wraps an already-materialized string.
    #[must_use]
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    /// Borrows the secret contents.
    ///
    /// Callers must not copy the returned slice into long-lived storage.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value.to_owned())
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // The intermediate String is moved, not copied, into the Zeroizing
        // wrapper; deserializer scratch buffers are out of our hands.
        String::deserialize(deserializer).map(Self::new)
    }
}

impl Serialize for Secret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_redacted() {
        let secret = Secret::from("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret([REDACTED])");
    }

    #[test]
    fn roundtrips_through_serde() {
        let secret: Secret = serde_json::from_str("\"pw\"").unwrap();
        assert_eq!(secret.expose(), "pw");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"pw\"");
    }
}
